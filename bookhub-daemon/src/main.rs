//! Bookhub Daemon
//!
//! Serves the identity and credit hub to book sites over a local socket.
//!
//! # Running
//!
//! ```bash
//! cargo run -p bookhub-daemon
//! # or after install:
//! bookhubd
//! ```

use anyhow::Result;
use bookhub_daemon::{ApiState, DaemonConfig, load_config, start_server};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_logging(&config.log_level);

    info!("Starting Bookhub daemon...");
    info!("Loaded configuration from {:?}", config.config_path);

    run_daemon(config).await
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("Daemon starting on {:?}", config.socket_path);

    let state = ApiState::from_config(&config).await?;
    let server_handle = start_server(&config.socket_path, state).await?;

    info!("Daemon running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping server...");

    server_handle.stop().await?;

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
        info!("Socket file removed");
    }

    info!("Daemon stopped");
    Ok(())
}
