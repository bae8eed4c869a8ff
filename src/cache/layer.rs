//! Key/value buffer pair for one transformer layer.
//!
//! The pair always moves together: both buffers share length and capacity,
//! and every mutation validates both sides before touching either.

use crate::cache::allocator::BlockAllocator;
use crate::cache::buffer::{KvShape, TensorBuffer, TensorView};
use crate::cache::element::CacheElement;
use crate::cache::error::{CacheError, CacheResult};

/// The cached key and value tensors of one layer.
#[derive(Debug, Clone)]
pub struct LayerCache<T: CacheElement> {
    key: TensorBuffer<T>,
    value: TensorBuffer<T>,
    grow_count: u64,
}

/// A prepared replacement for a layer's storage, committed only once every
/// layer has been prepared successfully.
pub(crate) struct PreparedLayer<T: CacheElement> {
    key: TensorBuffer<T>,
    value: TensorBuffer<T>,
}

impl<T: CacheElement> LayerCache<T> {
    /// An empty layer; storage is allocated on the first append.
    pub fn new(shape: KvShape, allocator: BlockAllocator) -> Self {
        Self {
            key: TensorBuffer::empty(shape, allocator),
            value: TensorBuffer::empty(shape, allocator),
            grow_count: 0,
        }
    }

    /// A layer pre-filled with prompt rows, block-padded by the allocator.
    pub fn with_rows(
        shape: KvShape,
        key_rows: &[T],
        value_rows: &[T],
        allocator: BlockAllocator,
    ) -> CacheResult<Self> {
        let tokens = Self::token_pair(&shape, key_rows, value_rows)?;
        let capacity = allocator.initial_capacity(tokens);
        Ok(Self {
            key: TensorBuffer::create(shape, key_rows, capacity, allocator)?,
            value: TensorBuffer::create(shape, value_rows, capacity, allocator)?,
            grow_count: 0,
        })
    }

    fn token_pair(shape: &KvShape, key: &[T], value: &[T]) -> CacheResult<usize> {
        let key_tokens = shape.tokens_in(key.len())?;
        let value_tokens = shape.tokens_in(value.len())?;
        if key_tokens != value_tokens {
            return Err(CacheError::invalid(format!(
                "key has {key_tokens} tokens but value has {value_tokens}"
            )));
        }
        Ok(key_tokens)
    }

    /// Number of valid cached tokens.
    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.key.capacity()
    }

    pub fn shape(&self) -> KvShape {
        self.key.shape()
    }

    pub fn key(&self) -> &TensorBuffer<T> {
        &self.key
    }

    pub fn value(&self) -> &TensorBuffer<T> {
        &self.value
    }

    /// Number of times this layer's storage has been grown.
    pub fn grow_count(&self) -> u64 {
        self.grow_count
    }

    pub fn bytes_allocated(&self) -> usize {
        self.key.bytes_allocated() + self.value.bytes_allocated()
    }

    /// Read-only `(key[0:length], value[0:length])` for attention.
    pub fn valid_slice(&self) -> (TensorView<'_, T>, TensorView<'_, T>) {
        (self.key.view(), self.value.view())
    }

    /// Storage grown to hold `required` tokens, or `None` if it already fits.
    pub(crate) fn prepare_reserve(&self, required: usize) -> CacheResult<Option<PreparedLayer<T>>> {
        let allocator = self.key.allocator();
        if !allocator.needs_grow(self.capacity(), required) {
            return Ok(None);
        }
        let target = allocator.grow_target(required);
        Ok(Some(PreparedLayer {
            key: self.key.grown(target)?,
            value: self.value.grown(target)?,
        }))
    }

    pub(crate) fn prepare_compaction(
        &self,
        keep_front: usize,
        keep_back: usize,
    ) -> CacheResult<PreparedLayer<T>> {
        Ok(PreparedLayer {
            key: self.key.compacted(keep_front, keep_back)?,
            value: self.value.compacted(keep_front, keep_back)?,
        })
    }

    pub(crate) fn commit_growth(&mut self, prepared: PreparedLayer<T>) {
        self.key = prepared.key;
        self.value = prepared.value;
        self.grow_count += 1;
    }

    pub(crate) fn commit_compaction(&mut self, prepared: PreparedLayer<T>) {
        self.key = prepared.key;
        self.value = prepared.value;
    }

    /// Validate an append of `key`/`value` rows and return its token count.
    pub(crate) fn check_rows(&self, key: &[T], value: &[T]) -> CacheResult<usize> {
        Self::token_pair(&self.shape(), key, value)
    }

    /// Grow if needed, returning whether a growth happened.
    pub fn reserve(&mut self, required: usize) -> CacheResult<bool> {
        match self.prepare_reserve(required)? {
            Some(prepared) => {
                self.commit_growth(prepared);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Capacity check, block-padded growth if needed, then append.
    ///
    /// This is the only mutation path attention code should use.
    pub fn reserve_and_append(&mut self, new_key: &[T], new_value: &[T]) -> CacheResult<()> {
        let tokens = self.check_rows(new_key, new_value)?;
        self.reserve(self.len() + tokens)?;
        self.key.append(new_key)?;
        self.value.append(new_value)?;
        Ok(())
    }
}
