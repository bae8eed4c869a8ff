//! A single chat session's cache state.
//!
//! A session owns its [`CacheLayerSet`] and eviction policy outright; nothing
//! is shared between sessions, so independent sessions can run in parallel.
//! Each user turn:
//! 1. Computes the space it needs (prompt + max generated tokens)
//! 2. Asks the sink policy to evict interior tokens if that would overflow
//! 3. Hands the cache to the generation loop, which appends one step at a time

use tracing::info;
use uuid::Uuid;

use crate::cache::{
    CacheElement, CacheError, CacheLayerSet, CacheResult, EvictionOutcome, SinkEvictionPolicy,
};
use crate::config::Config;

/// Explicit per-session state passed into every generation step.
#[derive(Debug)]
pub struct Session<T: CacheElement> {
    id: Uuid,
    cache: CacheLayerSet<T>,
    policy: SinkEvictionPolicy,
    turns: usize,
}

impl<T: CacheElement> Session<T> {
    /// Start a session with an empty cache shaped by `config`.
    pub fn new(config: &Config) -> CacheResult<Self> {
        let cache = CacheLayerSet::new(
            config.model.n_layers,
            config.kv_shape()?,
            config.allocator()?,
        )?;
        let policy = SinkEvictionPolicy::new(config.sink_config())?;
        Ok(Self::with_parts(cache, policy))
    }

    /// Start a session from an existing cache and policy.
    pub fn with_parts(cache: CacheLayerSet<T>, policy: SinkEvictionPolicy) -> Self {
        let id = Uuid::new_v4();
        info!(
            session = %id,
            layers = cache.num_layers(),
            dtype = %T::DTYPE,
            start_size = policy.start_size(),
            ceiling = policy.ceiling(),
            "Session started"
        );
        Self {
            id,
            cache,
            policy,
            turns: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cache(&self) -> &CacheLayerSet<T> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CacheLayerSet<T> {
        &mut self.cache
    }

    pub fn policy(&self) -> &SinkEvictionPolicy {
        &self.policy
    }

    /// Completed `begin_turn` calls.
    pub fn turns(&self) -> usize {
        self.turns
    }

    /// Prepare the cache for a turn that appends up to
    /// `prompt_tokens + max_gen_tokens` tokens.
    pub fn begin_turn(
        &mut self,
        prompt_tokens: usize,
        max_gen_tokens: usize,
    ) -> CacheResult<EvictionOutcome> {
        let space_needed = prompt_tokens.checked_add(max_gen_tokens).ok_or_else(|| {
            CacheError::InvalidArgument(format!(
                "space for {prompt_tokens} prompt + {max_gen_tokens} generated tokens overflows"
            ))
        })?;
        let outcome = self.policy.evict_for_space(&mut self.cache, space_needed)?;
        self.turns += 1;
        info!(
            session = %self.id,
            turn = self.turns,
            space_needed,
            length = self.cache.current_length(),
            evicted = outcome.evicted_tokens(),
            "Turn started"
        );
        Ok(outcome)
    }
}

impl<T: CacheElement> Drop for Session<T> {
    fn drop(&mut self) {
        let stats = self.cache.stats();
        info!(
            session = %self.id,
            turns = self.turns,
            length = stats.length,
            evicted_tokens = stats.evicted_tokens,
            "Session ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.model.n_layers = 2;
        config.model.n_kv_heads = 1;
        config.model.head_dim = 1;
        config.cache.block_size = 4;
        config.cache.cache_size = Some(20);
        config
    }

    #[test]
    fn test_new_session_is_empty() {
        let session: Session<f32> = Session::new(&small_config()).unwrap();
        assert_eq!(session.cache().current_length(), 0);
        assert_eq!(session.cache().num_layers(), 2);
        assert_eq!(session.policy().ceiling(), 24);
        assert_eq!(session.turns(), 0);
    }

    #[test]
    fn test_begin_turn_evicts_when_over_ceiling() {
        let mut session: Session<f32> = Session::new(&small_config()).unwrap();
        let rows: Vec<Vec<f32>> = (0..2)
            .map(|_| (0..22).map(|t| t as f32).collect())
            .collect();
        session.cache_mut().append_step(&rows, &rows).unwrap();

        let outcome = session.begin_turn(2, 3).unwrap();
        assert_eq!(
            outcome,
            EvictionOutcome::Evicted {
                keep_front: 4,
                keep_back: 15,
                evicted: 3
            }
        );
        assert_eq!(session.cache().current_length(), 19);
        assert_eq!(session.turns(), 1);
    }

    #[test]
    fn test_begin_turn_rejects_overflowing_space() {
        let mut session: Session<f32> = Session::new(&small_config()).unwrap();
        let err = session.begin_turn(usize::MAX, 1).unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
        assert_eq!(session.turns(), 0);
    }

    #[test]
    fn test_huge_cache_size_rejected_at_construction() {
        let mut config = small_config();
        config.cache.cache_size = Some(usize::MAX);
        let err = Session::<f32>::new(&config).unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument(_)));
    }

    #[test]
    fn test_sessions_have_distinct_ids() {
        let a: Session<f32> = Session::new(&small_config()).unwrap();
        let b: Session<f32> = Session::new(&small_config()).unwrap();
        assert_ne!(a.id(), b.id());
    }
}
