//! HTTP surface: the notification stream and the control API.
//!
//! Routes:
//! - `GET  /notifications/stream` - SSE notification stream
//! - `GET  /notifications/list` - recent notifications, newest first
//! - `GET  /notifications/unread` - unread notifications, newest first
//! - `GET  /notifications/count` - unread count
//! - `POST /notifications/:id/read` - mark one notification read
//! - `POST /notifications/read-all` - mark every notification read
//! - `POST /notifications` - announce a notification (admin)
//! - `GET  /notifications/stats` - live session stats (admin)
//! - `GET  /health`, `GET /ready` - process and liveness checks

pub mod auth;
pub mod error;

use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderName, CACHE_CONTROL};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::announcer::Announcer;
use crate::config::SessionConfig;
use crate::model::{NewNotification, NotificationRecord};
use crate::session::{self, SessionHandler};
use crate::store::{IdentityResolver, NotificationStore, StoreResult};

use self::auth::{authenticate, authenticate_admin, credential, TokenQuery};
use self::error::ApiError;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Largest page any listing endpoint returns.
pub const MAX_PAGE: usize = 100;
const DEFAULT_RECENT_PAGE: usize = 20;
const DEFAULT_UNREAD_PAGE: usize = 10;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub announcer: Announcer,
    pub identity: Arc<dyn IdentityResolver>,
    pub session: SessionConfig,
    /// Parent of every session's cancellation token.
    pub shutdown: CancellationToken,
}

impl AppState {
    fn session_handler(&self) -> SessionHandler {
        SessionHandler::new(self.announcer.clone(), Arc::clone(&self.identity), self.session)
    }

    /// Run a blocking store call on the blocking pool.
    async fn with_store<T, F>(&self, op: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn NotificationStore) -> StoreResult<T> + Send + 'static,
    {
        let store = Arc::clone(self.announcer.store());
        Ok(tokio::task::spawn_blocking(move || op(store.as_ref())).await??)
    }
}

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/notifications", post(create_notification))
        .route("/notifications/stream", get(stream_notifications))
        .route("/notifications/list", get(list_notifications))
        .route("/notifications/unread", get(unread_notifications))
        .route("/notifications/count", get(unread_count))
        .route("/notifications/read-all", post(mark_all_read))
        .route("/notifications/stats", get(stats))
        .route("/notifications/:id/read", post(mark_read))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
}

impl PageQuery {
    fn limit_or(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, MAX_PAGE)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCount {
    pub unread_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Updated {
    pub updated: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub broker_connected: bool,
}

/// Handle GET /notifications/stream.
///
/// Identity failures are reported as an `error` event on the stream rather
/// than an HTTP status, so `EventSource` clients see the reason.
async fn stream_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(token): Query<TokenQuery>,
) -> impl IntoResponse {
    let (events, handle) = state
        .session_handler()
        .spawn(credential(&headers, &token), state.shutdown.child_token());
    session::supervise(handle);

    let body = events.map(|event| Ok::<_, Infallible>(event.to_sse()));
    (
        [(CACHE_CONTROL, "no-cache"), (X_ACCEL_BUFFERING, "no")],
        Sse::new(body),
    )
}

/// Handle GET /notifications/list.
async fn list_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(token): Query<TokenQuery>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<NotificationRecord>>, ApiError> {
    let principal = authenticate(&state.identity, credential(&headers, &token)).await?;
    let limit = page.limit_or(DEFAULT_RECENT_PAGE);
    let records = state
        .with_store(move |store| store.list_recent(&principal.user_id, limit))
        .await?;
    Ok(Json(records))
}

/// Handle GET /notifications/unread.
async fn unread_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(token): Query<TokenQuery>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<NotificationRecord>>, ApiError> {
    let principal = authenticate(&state.identity, credential(&headers, &token)).await?;
    let limit = page.limit_or(DEFAULT_UNREAD_PAGE);
    let records = state
        .with_store(move |store| store.list_unread(&principal.user_id, limit))
        .await?;
    Ok(Json(records))
}

/// Handle GET /notifications/count.
async fn unread_count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(token): Query<TokenQuery>,
) -> Result<Json<UnreadCount>, ApiError> {
    let principal = authenticate(&state.identity, credential(&headers, &token)).await?;
    let unread_count = state
        .with_store(move |store| store.unread_count(&principal.user_id))
        .await?;
    Ok(Json(UnreadCount { unread_count }))
}

/// Handle POST /notifications/:id/read.
#[tracing::instrument(skip_all, fields(notification_id = %id))]
async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(token): Query<TokenQuery>,
    Path(id): Path<String>,
) -> Result<Json<Updated>, ApiError> {
    let principal = authenticate(&state.identity, credential(&headers, &token)).await?;
    let marked = state
        .with_store(move |store| store.mark_read(&principal.user_id, &id))
        .await?;

    if marked {
        Ok(Json(Updated { updated: 1 }))
    } else {
        Err(ApiError::NotFound("notification not found".into()))
    }
}

/// Handle POST /notifications/read-all.
#[tracing::instrument(skip_all)]
async fn mark_all_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(token): Query<TokenQuery>,
) -> Result<Json<Updated>, ApiError> {
    let principal = authenticate(&state.identity, credential(&headers, &token)).await?;
    let user_id = principal.user_id.clone();
    let updated = state
        .with_store(move |store| store.mark_all_read(&user_id))
        .await?;
    tracing::info!(user_id = %principal.user_id, updated, "Marked all notifications read");
    Ok(Json(Updated { updated }))
}

/// Handle POST /notifications (admin).
async fn create_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(token): Query<TokenQuery>,
    Json(new): Json<NewNotification>,
) -> Result<impl IntoResponse, ApiError> {
    authenticate_admin(&state.identity, credential(&headers, &token)).await?;

    if new.user_id.as_str().trim().is_empty() {
        return Err(ApiError::Validation("user_id must not be empty".into()));
    }
    if new.title.trim().is_empty() {
        return Err(ApiError::Validation("title must not be empty".into()));
    }

    let record = state.announcer.announce(new).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Handle GET /notifications/stats (admin).
async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(token): Query<TokenQuery>,
) -> Result<Json<SessionStats>, ApiError> {
    authenticate_admin(&state.identity, credential(&headers, &token)).await?;
    Ok(Json(SessionStats {
        active_sessions: state.announcer.active_session_count(),
        broker_connected: state.announcer.is_broker_connected(),
    }))
}

/// Handle GET /health - Basic health check.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Handle GET /ready - reflects announce path liveness.
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.announcer.is_broker_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DEGRADED")
    }
}
