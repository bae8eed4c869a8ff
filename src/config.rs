//! Runtime configuration for kv-sink-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Model geometry, cache sizing knobs and the simulated workload live here.

use std::path::{Path, PathBuf};

use anyhow::ensure;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::{
    BlockAllocator, CacheResult, DType, KvShape, SinkBudget, SinkConfig, DEFAULT_BLOCK_SIZE,
    DEFAULT_START_SIZE,
};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-sink-sim", about = "Simulate streaming chat sessions over an attention-sink KV cache")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override the number of concurrent sessions.
    #[arg(long)]
    pub sessions: Option<usize>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model geometry.
    pub model: ModelConfig,

    /// Cache sizing and eviction.
    pub cache: CacheConfig,

    /// Simulated chat workload.
    pub simulation: SimulationConfig,
}

/// Model-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of transformer layers.
    pub n_layers: usize,

    /// Number of KV heads (for GQA/MQA).
    pub n_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Batch size of cached tensors.
    pub batch_size: usize,

    /// Model context limit in tokens.
    pub context_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_layers: 32,
            n_kv_heads: 8,
            head_dim: 128,
            batch_size: 1,
            context_size: 4096,
        }
    }
}

/// Cache sizing and eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Storage dtype.
    pub dtype: DType,

    /// Over-allocation block in tokens.
    pub block_size: usize,

    /// Attention-sink window in tokens.
    pub start_size: usize,

    /// Explicit cache ceiling; derived from the context size when absent.
    pub cache_size: Option<usize>,

    /// Whether the ceiling includes the sink window.
    pub budget: SinkBudget,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dtype: DType::F16,
            block_size: DEFAULT_BLOCK_SIZE,
            start_size: DEFAULT_START_SIZE,
            cache_size: None,
            budget: SinkBudget::Exclusive,
        }
    }
}

/// Synthetic chat workload driven by the simulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Independent sessions to run concurrently.
    pub sessions: usize,

    /// User turns per session.
    pub turns: usize,

    /// Prompt tokens per turn.
    pub prompt_tokens: usize,

    /// Maximum generated tokens per turn.
    pub max_gen_tokens: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sessions: 2,
            turns: 16,
            prompt_tokens: 64,
            max_gen_tokens: 512,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject configurations no cache could be built from.
    pub fn validate(&self) -> anyhow::Result<()> {
        let m = &self.model;
        ensure!(m.n_layers > 0, "model.n_layers must be non-zero");
        ensure!(
            m.n_kv_heads > 0 && m.head_dim > 0 && m.batch_size > 0,
            "model tensor dimensions must be non-zero"
        );
        ensure!(self.cache.block_size > 0, "cache.block_size must be non-zero");
        ensure!(
            self.max_cache_len() > 0,
            "cache ceiling is zero (context_size {} with start_size {})",
            m.context_size,
            self.cache.start_size
        );
        Ok(())
    }

    /// Cache ceiling passed to the eviction policy: the explicit cache size,
    /// or the context limit minus the sink window.
    pub fn max_cache_len(&self) -> usize {
        self.cache
            .cache_size
            .unwrap_or_else(|| self.model.context_size.saturating_sub(self.cache.start_size))
    }

    pub fn kv_shape(&self) -> CacheResult<KvShape> {
        KvShape::new(self.model.batch_size, self.model.n_kv_heads, self.model.head_dim)
    }

    pub fn allocator(&self) -> CacheResult<BlockAllocator> {
        BlockAllocator::new(self.cache.block_size)
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            start_size: self.cache.start_size,
            max_cache_len: self.max_cache_len(),
            budget: self.cache.budget,
        }
    }

    /// Bytes one cached token occupies across all layers (K and V).
    pub fn kv_token_bytes(&self) -> usize {
        let m = &self.model;
        let per_layer = m.batch_size * m.n_kv_heads * m.head_dim * self.cache.dtype.size_bytes() * 2;
        per_layer * m.n_layers
    }
}
