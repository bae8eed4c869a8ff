//! kv-sink-cache: growable KV cache with attention-sink eviction.
//!
//! Stores accumulated attention keys/values per transformer layer in
//! block-padded buffers, and bounds total cache size for unbounded
//! conversations by keeping a fixed leading "sink" window plus a sliding
//! window of recent tokens.

pub mod cache;
pub mod config;
pub mod driver;
pub mod session;

pub use cache::{
    CacheElement, CacheError, CacheLayerSet, CacheResult, EvictionOutcome, KvShape, LayerCache,
    SinkEvictionPolicy,
};
pub use session::Session;
