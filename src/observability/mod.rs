//! OpenTelemetry observability infrastructure.
//!
//! Provides:
//! - Structured tracing via tracing-subscriber
//! - OTLP-exportable metrics for announcements and sessions

pub mod metrics;
pub mod tracing;
