//! Block-based capacity allocator for KV cache buffers.
//!
//! Buffers never grow one token at a time. When a write would overflow, the
//! allocator pads the required length by a fixed block so that a session of
//! length `L` reallocates `O(L / block_size)` times.

use tracing::debug;

use crate::cache::element::CacheElement;
use crate::cache::error::{CacheError, CacheResult};

/// Default over-allocation block, in sequence slots.
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// Sizing policy for buffer creation and growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAllocator {
    block_size: usize,
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl BlockAllocator {
    /// Create an allocator that pads every growth by `block_size` slots.
    pub fn new(block_size: usize) -> CacheResult<Self> {
        if block_size == 0 {
            return Err(CacheError::invalid("block_size must be non-zero"));
        }
        Ok(Self { block_size })
    }

    /// Block size in slots.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether a buffer with `capacity` slots must grow to hold `required`.
    pub fn needs_grow(&self, capacity: usize, required: usize) -> bool {
        capacity < required
    }

    /// Padded capacity to request when growing to hold `required` slots.
    pub fn grow_target(&self, required: usize) -> usize {
        required.saturating_add(self.block_size)
    }

    /// Capacity for a freshly created buffer holding `initial_length` slots.
    pub fn initial_capacity(&self, initial_length: usize) -> usize {
        self.grow_target(initial_length)
    }

    /// Allocate zero-filled storage for `slots` slots of `slot_elements` each.
    ///
    /// Uses a fallible reservation so out-of-memory surfaces as
    /// [`CacheError::AllocationFailure`] instead of aborting.
    pub fn allocate<T: CacheElement>(
        &self,
        slots: usize,
        slot_elements: usize,
    ) -> CacheResult<Vec<T>> {
        let elements = slots
            .checked_mul(slot_elements)
            .ok_or(CacheError::AllocationFailure {
                slots,
                elements: usize::MAX,
            })?;

        let mut storage: Vec<T> = Vec::new();
        storage
            .try_reserve_exact(elements)
            .map_err(|_| CacheError::AllocationFailure { slots, elements })?;
        storage.resize(elements, T::zeroed());

        debug!(slots, elements, dtype = %T::DTYPE, "Allocated cache storage");
        Ok(storage)
    }
}
