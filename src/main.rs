//! Keystone controller - main entry point.

use clap::Parser;
use keystone::config::KeystoneConfig;
use keystone::controller::{run_elected, ControllerOptions, StaticElection};
use keystone::store::MemoryStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Control-plane process for a distributed transactional storage cluster.
#[derive(Parser)]
#[command(name = "keystone", version, about)]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run with the development configuration: in-memory metadata store,
    /// static leadership, short timeouts.
    #[arg(long)]
    dev: bool,

    /// Log level filter, e.g. `info` or `keystone=debug`.
    #[arg(long)]
    log_level: Option<String>,

    /// Seed for the placement RNG. Fixed seeds make placement
    /// deterministic for simulation runs.
    #[arg(long)]
    rng_seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => KeystoneConfig::from_file(path)?,
        None if cli.dev => KeystoneConfig::development(),
        None => KeystoneConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }

    keystone::observability::init(&config.observability)?;

    // The development store lives in process memory; a deployment wires in
    // the cluster's own transactional store here.
    let store = MemoryStore::new();
    let election = Arc::new(StaticElection);
    let rng_seed = cli.rng_seed;

    let controller = tokio::spawn(run_elected(election, move || {
        let mut options = ControllerOptions::new(config.clone(), store.clone());
        options.rng_seed = rng_seed;
        options
    }));

    tokio::select! {
        result = controller => result??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    Ok(())
}
