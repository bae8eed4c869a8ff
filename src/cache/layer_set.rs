//! The per-session cache: one [`LayerCache`] per transformer layer.
//!
//! Growth, append and compaction fan out identically to every layer through
//! a single call, so all layers report the same length after each step.
//! Fan-out is two-phase: every layer's new storage is prepared first and
//! committed only if all preparations succeed.

use serde::Serialize;
use tracing::debug;

use crate::cache::allocator::BlockAllocator;
use crate::cache::buffer::KvShape;
use crate::cache::element::CacheElement;
use crate::cache::error::{CacheError, CacheResult};
use crate::cache::layer::LayerCache;

/// Aggregate cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of layers.
    pub layers: usize,
    /// Shared valid length.
    pub length: usize,
    /// Smallest per-layer capacity.
    pub capacity: usize,
    /// Bytes allocated across all layers (K and V).
    pub bytes_allocated: usize,
    /// Growths performed, summed over layers.
    pub grow_count: u64,
    /// Compactions performed on the whole set.
    pub compaction_count: u64,
    /// Tokens discarded by compaction since creation.
    pub evicted_tokens: u64,
}

/// Ordered per-layer KV caches for one session.
#[derive(Debug, Clone)]
pub struct CacheLayerSet<T: CacheElement> {
    layers: Vec<LayerCache<T>>,
    shape: KvShape,
    allocator: BlockAllocator,
    compaction_count: u64,
    evicted_tokens: u64,
}

impl<T: CacheElement> CacheLayerSet<T> {
    /// Create `num_layers` empty layers.
    pub fn new(num_layers: usize, shape: KvShape, allocator: BlockAllocator) -> CacheResult<Self> {
        if num_layers == 0 {
            return Err(CacheError::invalid("a cache needs at least one layer"));
        }
        Ok(Self {
            layers: (0..num_layers)
                .map(|_| LayerCache::new(shape, allocator))
                .collect(),
            shape,
            allocator,
            compaction_count: 0,
            evicted_tokens: 0,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn shape(&self) -> KvShape {
        self.shape
    }

    pub fn allocator(&self) -> BlockAllocator {
        self.allocator
    }

    /// The cache of layer `index`.
    pub fn layer(&self, index: usize) -> Option<&LayerCache<T>> {
        self.layers.get(index)
    }

    /// Mutable access for per-layer appends during a forward pass.
    pub fn layer_mut(&mut self, index: usize) -> Option<&mut LayerCache<T>> {
        self.layers.get_mut(index)
    }

    pub fn layers(&self) -> &[LayerCache<T>] {
        &self.layers
    }

    /// Shared valid length (taken from layer 0).
    pub fn current_length(&self) -> usize {
        self.layers[0].len()
    }

    /// Smallest capacity across layers.
    pub fn capacity(&self) -> usize {
        self.layers.iter().map(|l| l.capacity()).min().unwrap_or(0)
    }

    /// Whether every layer reports the same length.
    pub fn is_synchronized(&self) -> bool {
        let length = self.current_length();
        self.layers.iter().all(|l| l.len() == length)
    }

    fn ensure_synchronized(&self) -> CacheResult<()> {
        if self.is_synchronized() {
            return Ok(());
        }
        let lengths: Vec<usize> = self.layers.iter().map(|l| l.len()).collect();
        Err(CacheError::invalid(format!(
            "layer lengths out of sync: {lengths:?}"
        )))
    }

    /// Grow every layer that cannot hold `required` tokens.
    ///
    /// Returns the number of layers that grew.
    pub fn reserve(&mut self, required: usize) -> CacheResult<usize> {
        let prepared = self
            .layers
            .iter()
            .map(|layer| layer.prepare_reserve(required))
            .collect::<CacheResult<Vec<_>>>()?;

        let mut grown = 0;
        for (layer, prepared) in self.layers.iter_mut().zip(prepared) {
            if let Some(prepared) = prepared {
                layer.commit_growth(prepared);
                grown += 1;
            }
        }

        if grown > 0 {
            debug!(required, layers = grown, capacity = self.capacity(), "Reserved cache capacity");
        }
        Ok(grown)
    }

    /// Append one step's key/value rows to every layer.
    ///
    /// `keys[i]`/`values[i]` are layer `i`'s rows, laid out
    /// `[batch, heads, n, head_dim]`; every layer must receive the same `n`.
    pub fn append_step<K: AsRef<[T]>>(&mut self, keys: &[K], values: &[K]) -> CacheResult<()> {
        if keys.len() != self.num_layers() || values.len() != self.num_layers() {
            return Err(CacheError::invalid(format!(
                "expected rows for {} layers, got {} keys and {} values",
                self.num_layers(),
                keys.len(),
                values.len()
            )));
        }
        self.ensure_synchronized()?;

        let mut step_tokens = None;
        for (layer, (k, v)) in self.layers.iter().zip(keys.iter().zip(values)) {
            let tokens = layer.check_rows(k.as_ref(), v.as_ref())?;
            if *step_tokens.get_or_insert(tokens) != tokens {
                return Err(CacheError::invalid(
                    "every layer must append the same number of tokens",
                ));
            }
        }
        let tokens = step_tokens.unwrap_or(0);

        self.reserve(self.current_length() + tokens)?;
        for (layer, (k, v)) in self.layers.iter_mut().zip(keys.iter().zip(values)) {
            layer.reserve_and_append(k.as_ref(), v.as_ref())?;
        }
        Ok(())
    }

    /// Keep the first `keep_front` and last `keep_back` tokens in every layer.
    pub fn truncate_front_and_back(
        &mut self,
        keep_front: usize,
        keep_back: usize,
    ) -> CacheResult<()> {
        self.ensure_synchronized()?;
        let before = self.current_length();

        let prepared = self
            .layers
            .iter()
            .map(|layer| layer.prepare_compaction(keep_front, keep_back))
            .collect::<CacheResult<Vec<_>>>()?;
        for (layer, prepared) in self.layers.iter_mut().zip(prepared) {
            layer.commit_compaction(prepared);
        }

        let evicted = before - self.current_length();
        self.compaction_count += 1;
        self.evicted_tokens += evicted as u64;
        debug!(
            before,
            after = self.current_length(),
            keep_front,
            keep_back,
            evicted,
            "Compacted all layers"
        );
        Ok(())
    }

    /// Bytes allocated across all layers.
    pub fn bytes_allocated(&self) -> usize {
        self.layers.iter().map(|l| l.bytes_allocated()).sum()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            layers: self.num_layers(),
            length: self.current_length(),
            capacity: self.capacity(),
            bytes_allocated: self.bytes_allocated(),
            grow_count: self.layers.iter().map(|l| l.grow_count()).sum(),
            compaction_count: self.compaction_count,
            evicted_tokens: self.evicted_tokens,
        }
    }
}
