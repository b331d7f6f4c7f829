//! Liveness monitor for the announce path.
//!
//! A single process-wide health flag. The component that owns the upstream
//! connection flips it; sessions and the announcer only read it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::NotificationStore;

/// Shared health flag answering "can announcements be delivered end-to-end".
#[derive(Debug)]
pub struct LivenessMonitor {
    state: watch::Sender<bool>,
}

impl LivenessMonitor {
    /// Create a monitor with the given initial health.
    pub fn new(healthy: bool) -> Self {
        let (state, _) = watch::channel(healthy);
        Self { state }
    }

    /// Current health.
    pub fn is_healthy(&self) -> bool {
        *self.state.borrow()
    }

    /// Set the health flag.
    ///
    /// Returns true if the value changed.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == healthy {
                false
            } else {
                *current = healthy;
                true
            }
        });

        if changed {
            if healthy {
                tracing::info!("Announce path recovered");
            } else {
                tracing::warn!("Announce path unavailable, new sessions enter degraded mode");
            }
        }
        changed
    }

    /// Watch health transitions, used to wake degraded sessions early.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Periodically ping the store and mirror the result into `monitor`.
///
/// Runs until `shutdown` is cancelled.
pub fn spawn_store_probe(
    store: Arc<dyn NotificationStore>,
    monitor: Arc<LivenessMonitor>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let store = Arc::clone(&store);
            let healthy = match tokio::task::spawn_blocking(move || store.ping()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Store probe failed");
                    false
                }
                Err(e) => {
                    tracing::error!(error = %e, "Store probe task panicked");
                    false
                }
            };
            monitor.set_healthy(healthy);
        }

        tracing::debug!("Store probe stopped");
    })
}
