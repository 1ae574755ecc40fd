//! brokerd — one rank of a broker session.
//!
//! # Usage
//!
//! ```bash
//! # Single-node session.
//! brokerd
//!
//! # One rank of a distributed session, config supplies the rest.
//! brokerd --config /etc/tbon-broker/rank3.toml
//! ```

use std::process::ExitCode;

use clap::Parser;
use tbon_broker::config::BrokerConfig;
use tbon_broker::Broker;

/// Run one rank of a distributed message broker.
#[derive(Parser, Debug)]
#[command(name = "brokerd", version, about)]
struct Cli {
    /// Path to a TOML config file. Without one, runs a standalone
    /// single-node session (rank 0 of size 1).
    #[arg(short, long, env = "BROKER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match BrokerConfig::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::error!(error = %e, path, "failed to load config");
                return ExitCode::FAILURE;
            }
        },
        None => BrokerConfig::standalone(),
    };

    tracing::info!(rank = config.session.rank, size = config.session.size, "starting brokerd");

    let broker = match Broker::bootstrap(config).await {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "bootstrap failed");
            return ExitCode::FAILURE;
        }
    };

    match broker.run().await {
        Ok(rc) => {
            tracing::info!(rc, "brokerd exited");
            ExitCode::from(rc.clamp(0, 255) as u8)
        }
        Err(e) => {
            tracing::error!(error = %e, "brokerd exited with error");
            ExitCode::FAILURE
        }
    }
}
