//! Log output setup.
//!
//! Events go to stdout either as human-readable lines or as one JSON object
//! per line for log shippers. `--log-level` (or `RUST_LOG`) takes full
//! `EnvFilter` directives such as `warn,herald::session=debug`.

use clap::ValueEnum;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Used when the configured directives do not parse.
const FALLBACK_DIRECTIVES: &str = "info,herald=debug";

/// Shape of each log line on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Parse filter directives.
pub fn build_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    EnvFilter::try_new(directives)
}

fn stdout_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Text => Box::new(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        ),
        // Session spans carry user_id, session_id and state; keep them on
        // every line so a stream can be followed without the span list.
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(false),
        ),
    }
}

/// Install the global subscriber.
///
/// Invalid directives fall back to `info,herald=debug` and are reported
/// once the subscriber is up.
///
/// # Panics
///
/// Panics if tracing has already been initialized.
pub fn init_tracing(directives: &str, format: LogFormat) {
    let (filter, rejected) = match build_filter(directives) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(FALLBACK_DIRECTIVES), Some(e)),
    };

    tracing_subscriber::registry()
        .with(stdout_layer(format))
        .with(filter)
        .init();

    if let Some(e) = rejected {
        tracing::warn!(directives, error = %e, "Invalid log filter, using defaults");
    }
    tracing::info!(service = "herald", format = ?format, "Tracing initialized");
}

/// Initialize tracing for tests (only logs errors).
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("error")
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_level_and_targets() {
        assert!(build_filter("info").is_ok());
        assert!(build_filter("warn,herald::session=trace").is_ok());
        assert!(build_filter(FALLBACK_DIRECTIVES).is_ok());
    }

    #[test]
    fn test_filter_rejects_unknown_level() {
        assert!(build_filter("herald=loud").is_err());
    }

    #[test]
    fn test_log_format_names() {
        assert_eq!(LogFormat::from_str("json", true), Ok(LogFormat::Json));
        assert_eq!(LogFormat::from_str("text", true), Ok(LogFormat::Text));
        assert!(LogFormat::from_str("yaml", true).is_err());
    }
}
