//! Herald: real-time notification fan-out over Server-Sent Events.
//!
//! # Usage
//!
//! ```bash
//! herald --port 8080 --data-dir ./data --log-level info
//! ```
//!
//! Environment variables can also be used:
//! - `HERALD_PORT`: Port to listen on
//! - `HERALD_DATA_DIR`: Data directory for SQLite
//! - `HERALD_HEARTBEAT_SECS`: Heartbeat interval for open streams
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use anyhow::Context;
use herald::config::Config;
use herald::observability::metrics::init_metrics_with_endpoint;
use herald::observability::tracing::init_tracing;
use herald::server::run_server;
use std::fs;
use tokio::sync::watch;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
   _   _                _     _
  | | | | ___ _ __ __ _| | __| |
  | |_| |/ _ \ '__/ _` | |/ _` |
  |  _  |  __/ | | (_| | | (_| |
  |_| |_|\___|_|  \__,_|_|\__,_|

  Herald v{} - Notification Fan-out

  Configuration:
    Address:    {}:{}
    Data Dir:   {}
    Log Level:  {}
    Heartbeat:  {}s (degraded bound {})

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.host,
        config.port,
        config.data_dir.display(),
        config.log_level,
        config.heartbeat_secs,
        config.degraded_max_ticks
    );
}

/// Resolve once SIGINT or SIGTERM arrives.
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for ctrl+c")?;
                tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl+c")?;
        tracing::info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    init_tracing(&config.log_level, config.log_format);

    // Initialize metrics (with optional OTLP export)
    init_metrics_with_endpoint(config.otel_endpoint.as_deref());

    fs::create_dir_all(&config.data_dir).with_context(|| {
        format!(
            "failed to create data directory {}",
            config.data_dir.display()
        )
    })?;

    print_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!(error = %e, "Signal handler failed, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    run_server(config, shutdown_rx)
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

    tracing::info!("Herald shutdown complete");
    Ok(())
}
