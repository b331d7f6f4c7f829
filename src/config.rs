//! Configuration parsing for the Herald server.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - Sensible defaults for quick start

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::observability::tracing::LogFormat;

/// Herald: real-time notification fan-out over Server-Sent Events.
#[derive(Parser, Debug, Clone)]
#[command(name = "herald")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "HERALD_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "HERALD_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Data directory for the SQLite notification store
    #[arg(short, long, env = "HERALD_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Log line format on stdout
    #[arg(long, env = "HERALD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Size of the database connection pool
    #[arg(long, env = "HERALD_DB_POOL_SIZE", default_value_t = 10)]
    pub db_pool_size: u32,

    /// Milliseconds to wait for a free database connection
    #[arg(long, env = "HERALD_DB_ACQUIRE_TIMEOUT_MS", default_value_t = 2000)]
    pub db_acquire_timeout_ms: u64,

    /// Seconds between heartbeats on an idle or degraded stream
    #[arg(
        long,
        env = "HERALD_HEARTBEAT_SECS",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub heartbeat_secs: u64,

    /// Degraded heartbeats sent before a stream gives up
    #[arg(
        long,
        env = "HERALD_DEGRADED_MAX_TICKS",
        default_value_t = 20,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub degraded_max_ticks: u32,

    /// Unread notifications replayed when a stream opens (0 disables)
    #[arg(long, env = "HERALD_BACKLOG_LIMIT", default_value_t = 5)]
    pub backlog_limit: usize,

    /// Milliseconds allowed for loading the replay backlog
    #[arg(long, env = "HERALD_BACKLOG_TIMEOUT_MS", default_value_t = 2000)]
    pub backlog_timeout_ms: u64,

    /// Seconds between store liveness probes
    #[arg(long, env = "HERALD_LIVENESS_PROBE_SECS", default_value_t = 5)]
    pub liveness_probe_secs: u64,

    /// OpenTelemetry collector endpoint for metrics export (optional)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("herald.db")
    }

    pub fn db_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.db_acquire_timeout_ms)
    }

    pub fn liveness_probe_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_probe_secs)
    }

    /// Create a configuration for tests: random port, fast timings.
    pub fn test_config(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            data_dir,
            log_level: "debug".into(),
            log_format: LogFormat::Text,
            db_pool_size: 4,
            db_acquire_timeout_ms: 500,
            heartbeat_secs: 1,
            degraded_max_ticks: 3,
            backlog_limit: 5,
            backlog_timeout_ms: 500,
            liveness_probe_secs: 1,
            otel_endpoint: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            log_level: "info".into(),
            log_format: LogFormat::Text,
            db_pool_size: 10,
            db_acquire_timeout_ms: 2000,
            heartbeat_secs: 15,
            degraded_max_ticks: 20,
            backlog_limit: 5,
            backlog_timeout_ms: 2000,
            liveness_probe_secs: 5,
            otel_endpoint: None,
        }
    }
}

/// Timing and replay settings for one notification stream.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Idle time before an `alive` heartbeat, and the degraded tick period
    pub heartbeat_interval: Duration,
    /// Degraded heartbeats before `degraded_timeout`
    pub degraded_max_ticks: u32,
    /// Unread notifications replayed on connect
    pub backlog_limit: usize,
    /// Budget for loading the replay backlog
    pub backlog_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SessionConfig {
    /// Create a SessionConfig from application config values.
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_secs),
            degraded_max_ticks: config.degraded_max_ticks,
            backlog_limit: config.backlog_limit,
            backlog_timeout: Duration::from_millis(config.backlog_timeout_ms),
        }
    }
}
