//! Attention-sink eviction policy.
//!
//! Keeps the absolute earliest `start_size` tokens (the attention sink) and
//! the most recent tokens, discarding everything in between. Dropping the
//! sink instead degrades streaming attention, so this policy never falls
//! back to "keep most recent only".
//!
//! ```text
//! before:  [ s s s s | m m m m m m m m m m | r r r r r r ]
//!            sink       dropped               recent (keep_back)
//! after:   [ s s s s | r r r r r r ]
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::element::CacheElement;
use crate::cache::error::{CacheError, CacheResult};
use crate::cache::layer_set::CacheLayerSet;

/// Default sink window, in tokens.
pub const DEFAULT_START_SIZE: usize = 4;

/// How `max_cache_len` relates to the sink window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkBudget {
    /// `max_cache_len` counts only the recent window; the total ceiling is
    /// `max_cache_len + start_size`.
    #[default]
    Exclusive,
    /// `max_cache_len` is the total ceiling, sink included.
    Inclusive,
}

/// Sink window parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Leading tokens that are never evicted.
    pub start_size: usize,
    /// Cache ceiling derived from the model's context limit.
    pub max_cache_len: usize,
    /// Boundary mode for `max_cache_len`.
    #[serde(default)]
    pub budget: SinkBudget,
}

impl SinkConfig {
    pub fn new(start_size: usize, max_cache_len: usize) -> Self {
        Self {
            start_size,
            max_cache_len,
            budget: SinkBudget::default(),
        }
    }
}

/// What an eviction call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The cache is no longer than the sink window; nothing to discard.
    BelowSink,
    /// The requested space fits under the ceiling.
    WithinBudget,
    /// Interior tokens were dropped.
    Evicted {
        keep_front: usize,
        keep_back: usize,
        evicted: usize,
    },
}

impl EvictionOutcome {
    pub fn evicted_tokens(&self) -> usize {
        match self {
            EvictionOutcome::Evicted { evicted, .. } => *evicted,
            _ => 0,
        }
    }

    pub fn is_evicted(&self) -> bool {
        matches!(self, EvictionOutcome::Evicted { .. })
    }
}

/// The attention-sink eviction policy.
#[derive(Debug, Clone)]
pub struct SinkEvictionPolicy {
    config: SinkConfig,
}

impl SinkEvictionPolicy {
    pub fn new(config: SinkConfig) -> CacheResult<Self> {
        if config.max_cache_len == 0 {
            return Err(CacheError::invalid("max_cache_len must be non-zero"));
        }
        if config.budget == SinkBudget::Inclusive && config.max_cache_len <= config.start_size {
            return Err(CacheError::invalid(format!(
                "inclusive max_cache_len {} must exceed start_size {}",
                config.max_cache_len, config.start_size
            )));
        }
        if config.budget == SinkBudget::Exclusive
            && config.max_cache_len.checked_add(config.start_size).is_none()
        {
            return Err(CacheError::invalid(format!(
                "max_cache_len {} + start_size {} overflows",
                config.max_cache_len, config.start_size
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn start_size(&self) -> usize {
        self.config.start_size
    }

    /// Largest length the cache may reach before eviction triggers.
    pub fn ceiling(&self) -> usize {
        match self.config.budget {
            SinkBudget::Exclusive => self.config.max_cache_len + self.config.start_size,
            SinkBudget::Inclusive => self.config.max_cache_len,
        }
    }

    /// Largest `space_needed` a single request may ask for.
    fn max_request(&self) -> usize {
        self.ceiling() - self.config.start_size
    }

    /// Decide the `(keep_front, keep_back)` pair for a cache of `length`
    /// tokens that must make room for `space_needed` more.
    ///
    /// Returns `Ok(None)` when no eviction is required.
    pub fn plan(&self, length: usize, space_needed: usize) -> CacheResult<Option<(usize, usize)>> {
        let start_size = self.config.start_size;
        if length <= start_size {
            return Ok(None);
        }
        if length.saturating_add(space_needed) <= self.ceiling() {
            return Ok(None);
        }
        if space_needed > self.max_request() {
            return Err(CacheError::invalid(format!(
                "space_needed {space_needed} exceeds the cache ceiling ({} beyond the sink)",
                self.max_request()
            )));
        }

        let keep_back = (self.max_request() - space_needed).min(length - start_size);
        Ok(Some((start_size, keep_back)))
    }

    /// Make room for `space_needed` more tokens, evicting interior tokens of
    /// every layer if the projected length would exceed the ceiling.
    ///
    /// Only checks space; growth is the allocator's job on the next append.
    pub fn evict_for_space<T: CacheElement>(
        &self,
        cache: &mut CacheLayerSet<T>,
        space_needed: usize,
    ) -> CacheResult<EvictionOutcome> {
        let length = cache.current_length();
        if length <= self.config.start_size {
            debug!(length, start_size = self.config.start_size, "Cache within sink window");
            return Ok(EvictionOutcome::BelowSink);
        }

        let Some((keep_front, keep_back)) = self.plan(length, space_needed)? else {
            return Ok(EvictionOutcome::WithinBudget);
        };

        cache.truncate_front_and_back(keep_front, keep_back)?;
        let evicted = length - cache.current_length();
        info!(
            before = length,
            after = cache.current_length(),
            space_needed,
            keep_front,
            keep_back,
            evicted,
            "Evicted interior tokens"
        );
        Ok(EvictionOutcome::Evicted {
            keep_front,
            keep_back,
            evicted,
        })
    }

    /// Trim a cache that has outgrown the ceiling back to sink + recent window.
    pub fn evict_to_fit<T: CacheElement>(
        &self,
        cache: &mut CacheLayerSet<T>,
    ) -> CacheResult<EvictionOutcome> {
        self.evict_for_space(cache, 0)
    }

    /// Drop the token range `[start, end)` from every layer.
    ///
    /// The sink window cannot be cut into.
    pub fn evict_range<T: CacheElement>(
        &self,
        cache: &mut CacheLayerSet<T>,
        start: usize,
        end: usize,
    ) -> CacheResult<EvictionOutcome> {
        let length = cache.current_length();
        if start > end || end > length {
            return Err(CacheError::invalid(format!(
                "range {start}..{end} is not within cache length {length}"
            )));
        }
        if start < self.config.start_size {
            return Err(CacheError::invalid(format!(
                "range {start}..{end} overlaps the sink window of {}",
                self.config.start_size
            )));
        }
        if start == end {
            return Ok(EvictionOutcome::WithinBudget);
        }

        let keep_back = length - end;
        cache.truncate_front_and_back(start, keep_back)?;
        info!(start, end, before = length, after = cache.current_length(), "Evicted token range");
        Ok(EvictionOutcome::Evicted {
            keep_front: start,
            keep_back,
            evicted: end - start,
        })
    }
}
