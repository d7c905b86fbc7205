//! Activity stream simulator
//!
//! Runs seeded fan-out simulations against the in-memory backend and prints
//! a summary. Configuration comes from `STREAMS_*` variables.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | SIM_SEEDS | 20 | Number of seeds to run |
//! | SIM_START_SEED | 0 | First seed |
//! | SIM_OPS | 500 | Operations per seed |
//! | STREAMS_LOG_JSON | false | JSON log lines |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use activity_streams::dst::{summarize_batch, FanoutDSTConfig, FanoutDSTHarness};
use activity_streams::observability;
use activity_streams::StreamConfig;
use tracing::info;

const DEFAULT_SEEDS: usize = 20;
const DEFAULT_OPS: usize = 500;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init_tracing(observability::json_requested());

    let stream = StreamConfig::from_env()?;
    let seeds: usize = env_or("SIM_SEEDS", DEFAULT_SEEDS);
    let start_seed: u64 = env_or("SIM_START_SEED", 0);
    let ops: usize = env_or("SIM_OPS", DEFAULT_OPS);

    info!(seeds, start_seed, ops, threshold = stream.connections_threshold, "starting simulation");

    let mut results = Vec::with_capacity(seeds);
    let mut last_stats = None;
    for i in 0..seeds {
        let mut config = FanoutDSTConfig::new(start_seed + i as u64);
        config.stream = stream.clone();
        let mut harness = FanoutDSTHarness::new(config);
        harness.run(ops);
        info!(summary = %harness.result().summary(), "seed finished");
        last_stats = Some(harness.stats());
        results.push(harness.result().clone());
    }

    println!("{}", summarize_batch(&results));
    if let Some(stats) = last_stats {
        println!("Last seed index stats: {}", serde_json::to_string(&stats)?);
    }

    if results.iter().any(|r| !r.is_success()) {
        std::process::exit(1);
    }
    Ok(())
}
