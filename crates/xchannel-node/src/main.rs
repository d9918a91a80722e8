//! xchannel node entry point.
//!
//! Loads the setup configuration from a TOML file (or defaults) and runs a
//! local cross-ledger channel between two in-process participants.

mod config;
mod simulation;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use xchannel_core::SetupConfig;

/// xchannel node
#[derive(Parser, Debug)]
#[command(name = "xchannel-node", version, about = "Cross-ledger payment channel node")]
struct Args {
    /// Path to the configuration file (TOML).
    #[arg(short, long, default_value = "xchannel.toml")]
    config: PathBuf,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Generate a default config file and exit.
    #[arg(long)]
    init: bool,
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle --init flag
    if args.init {
        let defaults = SetupConfig::default();
        config::save(&defaults, &args.config)?;
        init_logging(
            args.log_level.as_deref().unwrap_or(&defaults.logging.level),
            &defaults.logging.format,
        );
        tracing::info!(path = %args.config.display(), "wrote default config");
        return Ok(());
    }

    let mut config = config::load(&args.config)?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging.level, &config.logging.format);

    tracing::info!("xchannel node v{}", env!("CARGO_PKG_VERSION"));
    for ledger in &config.ledgers {
        tracing::info!(
            ledger = %ledger.id,
            node_url = %ledger.node_url,
            assets = ledger.assets.len(),
            "ledger configured"
        );
    }

    tokio::select! {
        result = simulation::run(&config) => {
            let report = result?;
            tracing::info!(
                channel = %report.channel,
                proposer = %report.proposer_phase,
                peer = %report.peer_phase,
                assets = report.assets.len(),
                "simulation finished"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    tracing::info!("xchannel node exited cleanly");
    Ok(())
}
