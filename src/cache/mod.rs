//! KV cache storage and retention.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`element`]: storage dtypes (f32, f16, bf16)
//! - [`allocator`]: block-padded capacity sizing and fallible allocation
//! - [`buffer`]: growable `[batch, heads, capacity, head_dim]` tensor storage
//! - [`layer`]: key/value buffer pair for one transformer layer
//! - [`layer_set`]: all layers of a session, mutated in lockstep
//! - [`sink`]: attention-sink eviction policy (sink + recent window)

pub mod allocator;
pub mod buffer;
pub mod element;
pub mod error;
pub mod layer;
pub mod layer_set;
pub mod sink;

pub use allocator::{BlockAllocator, DEFAULT_BLOCK_SIZE};
pub use buffer::{KvShape, TensorBuffer, TensorView};
pub use element::{CacheElement, DType};
pub use error::{CacheError, CacheResult};
pub use layer::LayerCache;
pub use layer_set::{CacheLayerSet, CacheStats};
pub use sink::{EvictionOutcome, SinkBudget, SinkConfig, SinkEvictionPolicy, DEFAULT_START_SIZE};
