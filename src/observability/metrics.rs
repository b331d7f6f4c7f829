//! OTLP metrics implementation.
//!
//! Key metrics:
//! - herald_notifications_created_total: Counter of persisted announcements
//! - herald_fanout_deliveries_total: Counter of session queue pushes
//! - herald_sessions_active: Up/down counter of registered sessions
//! - herald_degraded_timeouts_total: Sessions closed by the degraded bound
//! - herald_session_errors_total: Sessions that ended on a failure

use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Herald metrics registry.
#[derive(Debug)]
pub struct Metrics {
    pub notifications_created: Counter<u64>,
    pub fanout_deliveries: Counter<u64>,
    pub sessions_active: UpDownCounter<i64>,
    pub degraded_timeouts: Counter<u64>,
    pub session_errors: Counter<u64>,
}

impl Metrics {
    /// Create a new metrics registry from a meter.
    fn new(meter: &Meter) -> Self {
        Self {
            notifications_created: meter
                .u64_counter("herald_notifications_created_total")
                .with_description("Notifications persisted through the announcer")
                .with_unit("1")
                .init(),
            fanout_deliveries: meter
                .u64_counter("herald_fanout_deliveries_total")
                .with_description("Notifications pushed onto live session queues")
                .with_unit("1")
                .init(),
            sessions_active: meter
                .i64_up_down_counter("herald_sessions_active")
                .with_description("Sessions currently registered for live delivery")
                .with_unit("1")
                .init(),
            degraded_timeouts: meter
                .u64_counter("herald_degraded_timeouts_total")
                .with_description("Sessions closed after exhausting degraded heartbeats")
                .with_unit("1")
                .init(),
            session_errors: meter
                .u64_counter("herald_session_errors_total")
                .with_description("Sessions terminated by an identity or runtime failure")
                .with_unit("1")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
///
/// # Arguments
///
/// * `otel_endpoint` - Optional OTLP endpoint for metrics export
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, using no-op metrics");
                    install_manual_reader();
                }
            }
        } else {
            // Recorded but never exported
            install_manual_reader();
        }

        let meter = global::meter("herald");
        Metrics::new(&meter)
    });
}

fn install_manual_reader() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Record a persisted notification.
pub fn record_notification_created(kind: &str) {
    if let Some(m) = METRICS.get() {
        m.notifications_created
            .add(1, &[KeyValue::new("type", kind.to_string())]);
    }
}

/// Record how many live queues received a notification.
pub fn record_fanout(delivered: usize) {
    if let Some(m) = METRICS.get() {
        m.fanout_deliveries.add(delivered as u64, &[]);
    }
}

/// Record a session registering (`+1`) or unregistering (`-1`).
pub fn record_session_delta(delta: i64) {
    if let Some(m) = METRICS.get() {
        m.sessions_active.add(delta, &[]);
    }
}

/// Record a session closed by the degraded bound.
pub fn record_degraded_timeout() {
    if let Some(m) = METRICS.get() {
        m.degraded_timeouts.add(1, &[]);
    }
}

/// Record a session terminated by a failure.
pub fn record_session_error(reason: &'static str) {
    if let Some(m) = METRICS.get() {
        m.session_errors.add(1, &[KeyValue::new("reason", reason)]);
    }
}
