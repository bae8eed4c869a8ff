//! kv-sink-sim: drive synthetic chat sessions through the sink KV cache.
//!
//! Each session is owned by a single blocking task; sessions share nothing
//! and run in parallel.

use std::time::Instant;

use clap::Parser;
use half::{bf16, f16};
use tracing::{error, info};

use kv_sink_cache::cache::{CacheElement, DType};
use kv_sink_cache::config::{Cli, Config};
use kv_sink_cache::driver::{SessionReport, SyntheticDriver};
use kv_sink_cache::Session;

fn run_session<T: CacheElement>(config: &Config) -> anyhow::Result<SessionReport> {
    let session = Session::<T>::new(config)?;
    let driver = SyntheticDriver::new(session, config.simulation.clone());
    Ok(driver.run()?)
}

fn run_for_dtype(config: &Config) -> anyhow::Result<SessionReport> {
    match config.cache.dtype {
        DType::F32 => run_session::<f32>(config),
        DType::F16 => run_session::<f16>(config),
        DType::Bf16 => run_session::<bf16>(config),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_sink_cache=debug,kv_sink_sim=debug"
    } else {
        "kv_sink_cache=info,kv_sink_sim=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-sink-sim v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(sessions) = cli.sessions {
        config.simulation.sessions = sessions;
    }
    config.validate()?;

    info!(
        layers = config.model.n_layers,
        kv_heads = config.model.n_kv_heads,
        head_dim = config.model.head_dim,
        dtype = %config.cache.dtype,
        block_size = config.cache.block_size,
        start_size = config.cache.start_size,
        max_cache_len = config.max_cache_len(),
        token_bytes = config.kv_token_bytes(),
        "Configuration loaded"
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..config.simulation.sessions)
        .map(|_| {
            let config = config.clone();
            tokio::task::spawn_blocking(move || run_for_dtype(&config))
        })
        .collect();

    let mut failed = 0;
    for handle in handles {
        match handle.await? {
            Ok(report) => info!(
                session = %report.session_id,
                turns = report.turns,
                tokens = report.tokens_appended,
                evictions = report.evictions,
                length = report.cache.length,
                capacity = report.cache.capacity,
                bytes = report.cache.bytes_allocated,
                grows = report.cache.grow_count,
                "Session report"
            ),
            Err(e) => {
                error!("Session failed: {e}");
                failed += 1;
            }
        }
    }

    info!(
        sessions = config.simulation.sessions,
        failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Simulation complete"
    );

    anyhow::ensure!(failed == 0, "{failed} session(s) failed");
    Ok(())
}
