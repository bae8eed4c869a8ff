//! Synthetic generation driver.
//!
//! Stands in for the model-side generation loop: it runs user turns against a
//! [`Session`], prefilling prompt rows and then decoding one token per step.
//! Instead of real attention outputs, every row encodes `(layer, absolute
//! position)`, which lets callers check that retained rows were relocated
//! intact by eviction rather than recomputed.

use serde::Serialize;
use tracing::debug;

use crate::cache::{CacheElement, CacheResult, CacheStats, EvictionOutcome};
use crate::config::SimulationConfig;
use crate::session::Session;

/// Synthetic `head_dim`-wide row for `layer` at absolute token `position`.
///
/// Each element is an integer digit below `T::EXACT_INT_RANGE`, so the row
/// is stored without rounding in any element type. Element 0 holds the low
/// digit of `position`, element 1 the layer, and elements 2.. the higher
/// digits of `position`, least significant first. Rows for distinct positions
/// differ as long as the position fits in the available digits.
pub fn encode_row<T: CacheElement>(
    layer: usize,
    position: usize,
    negate: bool,
    head_dim: usize,
) -> Vec<T> {
    let base = T::EXACT_INT_RANGE;
    let mut high = position / base;
    (0..head_dim)
        .map(|i| {
            let digit = match i {
                0 => position % base,
                1 => layer % base,
                _ => {
                    let d = high % base;
                    high /= base;
                    d
                }
            };
            let v = digit as f32;
            T::from_f32(if negate { -v } else { v })
        })
        .collect()
}

/// Summary of a finished simulated session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub turns: usize,
    pub tokens_appended: usize,
    pub evictions: usize,
    pub cache: CacheStats,
}

/// Drives one session through a synthetic chat workload.
pub struct SyntheticDriver<T: CacheElement> {
    session: Session<T>,
    workload: SimulationConfig,
    /// Absolute token position held by each cache slot.
    positions: Vec<usize>,
    next_position: usize,
    evictions: usize,
}

impl<T: CacheElement> SyntheticDriver<T> {
    pub fn new(session: Session<T>, workload: SimulationConfig) -> Self {
        Self {
            session,
            workload,
            positions: Vec::new(),
            next_position: 0,
            evictions: 0,
        }
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Absolute token positions currently cached, slot by slot.
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Append `count` synthetic tokens to every layer as one step.
    pub fn append_tokens(&mut self, count: usize) -> CacheResult<()> {
        let cache = self.session.cache();
        let shape = cache.shape();
        let layers = cache.num_layers();
        let start = self.next_position;

        let rows = |negate: bool| -> Vec<Vec<T>> {
            (0..layers)
                .map(|layer| {
                    let mut out = Vec::with_capacity(count * shape.token_elements());
                    for _plane in 0..shape.planes() {
                        for pos in start..start + count {
                            out.extend(encode_row::<T>(layer, pos, negate, shape.head_dim()));
                        }
                    }
                    out
                })
                .collect()
        };
        let keys = rows(false);
        let values = rows(true);

        self.session.cache_mut().append_step(&keys, &values)?;
        self.positions.extend(start..start + count);
        self.next_position += count;
        Ok(())
    }

    fn track(&mut self, outcome: EvictionOutcome) {
        if let EvictionOutcome::Evicted {
            keep_front,
            keep_back,
            ..
        } = outcome
        {
            let tail = self.positions.len() - keep_back;
            self.positions.drain(keep_front..tail);
            self.evictions += 1;
        }
    }

    /// Run one user turn: evict if needed, prefill the prompt, then decode.
    pub fn run_turn(&mut self) -> CacheResult<EvictionOutcome> {
        let prompt = self.workload.prompt_tokens;
        let max_gen = self.workload.max_gen_tokens;

        let outcome = self.session.begin_turn(prompt, max_gen)?;
        self.track(outcome);

        self.append_tokens(prompt)?;
        for _ in 0..max_gen {
            self.append_tokens(1)?;
        }

        debug!(
            session = %self.session.id(),
            turn = self.session.turns(),
            length = self.session.cache().current_length(),
            "Turn complete"
        );
        Ok(outcome)
    }

    /// First `(layer, slot)` whose cached key or value does not match the row
    /// originally written for that slot's absolute position.
    pub fn first_mismatch(&self) -> Option<(usize, usize)> {
        let cache = self.session.cache();
        for (layer_idx, layer) in cache.layers().iter().enumerate() {
            let (keys, values) = layer.valid_slice();
            if keys.len() != self.positions.len() {
                return Some((layer_idx, keys.len().min(self.positions.len())));
            }
            let shape = keys.shape();
            for (slot, &pos) in self.positions.iter().enumerate() {
                let k: Vec<T> = encode_row(layer_idx, pos, false, shape.head_dim());
                let v: Vec<T> = encode_row(layer_idx, pos, true, shape.head_dim());
                for b in 0..shape.batch() {
                    for h in 0..shape.heads() {
                        let ok = keys.row(b, h, slot) == k.as_slice()
                            && values.row(b, h, slot) == v.as_slice();
                        if !ok {
                            return Some((layer_idx, slot));
                        }
                    }
                }
            }
        }
        None
    }

    /// Run every configured turn and report.
    pub fn run(mut self) -> CacheResult<SessionReport> {
        for _ in 0..self.workload.turns {
            self.run_turn()?;
        }
        Ok(self.report())
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            session_id: self.session.id().to_string(),
            turns: self.session.turns(),
            tokens_appended: self.next_position,
            evictions: self.evictions,
            cache: self.session.cache().stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use half::{bf16, f16};

    use super::*;
    use crate::config::Config;

    fn driver(turns: usize, prompt: usize, gen: usize) -> SyntheticDriver<f32> {
        driver_with::<f32>(2, 32, turns, prompt, gen)
    }

    fn driver_with<T: CacheElement>(
        head_dim: usize,
        cache_size: usize,
        turns: usize,
        prompt: usize,
        gen: usize,
    ) -> SyntheticDriver<T> {
        let mut config = Config::default();
        config.model.n_layers = 2;
        config.model.n_kv_heads = 2;
        config.model.head_dim = head_dim;
        config.cache.block_size = 8;
        config.cache.cache_size = Some(cache_size);
        let workload = SimulationConfig {
            sessions: 1,
            turns,
            prompt_tokens: prompt,
            max_gen_tokens: gen,
        };
        SyntheticDriver::new(Session::new(&config).unwrap(), workload)
    }

    #[test]
    fn test_turns_stay_under_ceiling() {
        let mut d = driver(10, 4, 6);
        for _ in 0..10 {
            d.run_turn().unwrap();
            assert!(d.session().cache().current_length() <= 36);
            assert!(d.session().cache().is_synchronized());
        }
        assert_eq!(d.first_mismatch(), None);
        assert_eq!(&d.positions()[..4], &[0, 1, 2, 3]);
        assert_eq!(*d.positions().last().unwrap(), 99);
    }

    #[test]
    fn test_report_counts() {
        let report = driver(5, 2, 8).run().unwrap();
        assert_eq!(report.turns, 5);
        assert_eq!(report.tokens_appended, 50);
        assert_eq!(report.cache.length, 50 - report.cache.evicted_tokens as usize);
        assert!(report.evictions >= 1);
    }

    #[test]
    fn test_rows_are_exact_in_half_types() {
        let a: Vec<f16> = encode_row(1, 0, false, 4);
        let b: Vec<f16> = encode_row(1, 7, false, 4);
        assert_ne!(a, b);
        assert!(a.iter().all(|x| x.is_finite()));

        let c: Vec<bf16> = encode_row(0, 256, false, 3);
        let d: Vec<bf16> = encode_row(0, 257, false, 3);
        let e: Vec<bf16> = encode_row(0, 0, false, 3);
        assert_ne!(c, d);
        assert_ne!(c, e);
        assert_ne!(encode_row::<bf16>(0, 5, false, 3), encode_row::<bf16>(1, 5, false, 3));
    }

    #[test]
    fn test_f16_session_rows_survive_eviction() {
        // 30 turns of 72 tokens push positions past the f16 integer range.
        let mut d = driver_with::<f16>(4, 128, 30, 64, 8);
        for _ in 0..30 {
            d.run_turn().unwrap();
            assert_eq!(d.first_mismatch(), None);
        }
        assert!(d.report().evictions >= 1);
        assert_eq!(&d.positions()[..4], &[0, 1, 2, 3]);
        assert!(*d.positions().last().unwrap() > 2048);
    }

    #[test]
    fn test_bf16_session_rows_survive_eviction() {
        let mut d = driver_with::<bf16>(3, 64, 10, 40, 8);
        for _ in 0..10 {
            d.run_turn().unwrap();
        }
        assert_eq!(d.first_mismatch(), None);
        assert!(*d.positions().last().unwrap() > 256);
    }

    #[test]
    fn test_misplaced_row_detected() {
        let mut d = driver_with::<f16>(4, 32, 6, 4, 6);
        for _ in 0..6 {
            d.run_turn().unwrap();
        }
        let n = d.positions.len();
        d.positions.swap(n - 1, n - 2);
        assert!(d.first_mismatch().is_some());
    }
}
