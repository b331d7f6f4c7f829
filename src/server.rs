//! HTTP server setup and lifecycle.
//!
//! Wires the SQLite store, registry, liveness monitor and announcer into
//! the axum router and runs it with:
//! - A background store liveness probe
//! - Graceful shutdown that cancels every open session

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::announcer::Announcer;
use crate::api::{create_router, AppState};
use crate::config::{Config, SessionConfig};
use crate::liveness::{spawn_store_probe, LivenessMonitor};
use crate::registry::ConnectionRegistry;
use crate::store::sqlite::SqliteStore;
use crate::store::{NotificationStore, StoreResult};

/// Server state shared across handlers and background tasks.
pub struct ServerState {
    pub store: Arc<SqliteStore>,
    pub app: AppState,
}

impl ServerState {
    /// Open the store and build the shared components.
    ///
    /// The liveness flag starts from one synchronous ping so the first
    /// sessions do not enter degraded mode needlessly.
    pub fn open(config: &Config) -> StoreResult<Self> {
        let store = Arc::new(SqliteStore::open(
            config.db_path(),
            config.db_pool_size,
            config.db_acquire_timeout(),
        )?);

        let healthy = match store.ping() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Initial store ping failed");
                false
            }
        };

        let announcer = Announcer::new(
            store.clone(),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(LivenessMonitor::new(healthy)),
        );

        let app = AppState {
            announcer,
            identity: store.clone(),
            session: SessionConfig::from_config(config),
            shutdown: CancellationToken::new(),
        };

        Ok(Self { store, app })
    }
}

/// Run the Herald HTTP server.
///
/// # Arguments
///
/// * `config` - Server configuration
/// * `shutdown_rx` - Receiver for shutdown signal
///
/// # Returns
///
/// Returns when the server has shut down.
pub async fn run_server(
    config: Config,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state = ServerState::open(&config)?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(address = %addr, "Starting Herald server");
    serve(listener, state, &config, shutdown_rx).await
}

/// Serve on an already-bound listener until shutdown.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    config: &Config,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = state.app.shutdown.clone();

    let probe = spawn_store_probe(
        state.store.clone(),
        Arc::clone(state.app.announcer.liveness()),
        config.liveness_probe_interval(),
        shutdown.child_token(),
    );

    let router = create_router(state.app);

    let sessions = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            tracing::info!("Shutdown signal received, closing sessions");
            // Open streams never finish on their own.
            sessions.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = probe.await {
        tracing::warn!(error = %e, "Store probe task failed");
    }

    tracing::info!("Server stopped");
    Ok(())
}
