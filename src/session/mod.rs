//! Per-connection notification stream.
//!
//! Each open stream runs one [`SessionHandler`] on its own task:
//!
//! ```text
//! AUTHENTICATING -> (DEGRADED <-> STREAMING) -> TERMINATED
//! ```
//!
//! - Authentication borrows a pooled connection only for the token lookup.
//! - Degraded mode keeps the client informed with a bounded number of
//!   heartbeats while the announce path is down, without registering.
//! - Streaming registers with the [`ConnectionRegistry`] and drains the
//!   session queue, sending `alive` heartbeats when idle.
//!
//! The registration is owned by a drop guard, so every exit (client gone,
//! server shutdown, task abort, panic) unregisters the session.

pub mod event;

pub use event::{HeartbeatStatus, StreamErrorKind, StreamEvent};

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::announcer::Announcer;
use crate::config::SessionConfig;
use crate::model::{Principal, SessionId, UserId};
use crate::observability::metrics;
use crate::registry::{ConnectionRegistry, SessionQueue};
use crate::store::{IdentityError, IdentityResolver};

/// Events buffered between a session task and the HTTP body.
const EVENT_BUFFER: usize = 16;

/// Lifecycle state of a session, recorded on its tracing span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    Degraded,
    Streaming,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticating => "authenticating",
            Self::Degraded => "degraded",
            Self::Streaming => "streaming",
            Self::Terminated => "terminated",
        }
    }
}

/// Why a session reached TERMINATED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Identity could not be established; one error event was sent.
    Rejected(StreamErrorKind),
    /// The degraded bound was reached; `degraded_timeout` was sent.
    DegradedTimeout,
    /// The client stopped reading.
    ClientGone,
    /// The server cancelled the session.
    Cancelled,
    /// The session queue closed underneath a registered session.
    QueueClosed,
}

/// Registry membership that is released when dropped.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    user_id: UserId,
    session_id: SessionId,
}

impl Registration {
    fn open(registry: &Arc<ConnectionRegistry>, user_id: &UserId) -> (Self, SessionQueue) {
        let (queue, session_id) = registry.register(user_id);
        metrics::record_session_delta(1);
        let registration = Self {
            registry: Arc::clone(registry),
            user_id: user_id.clone(),
            session_id,
        };
        (registration, queue)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.user_id, self.session_id);
        metrics::record_session_delta(-1);
    }
}

/// State machine driving one notification stream.
#[derive(Clone)]
pub struct SessionHandler {
    announcer: Announcer,
    identity: Arc<dyn IdentityResolver>,
    config: SessionConfig,
}

impl SessionHandler {
    pub fn new(
        announcer: Announcer,
        identity: Arc<dyn IdentityResolver>,
        config: SessionConfig,
    ) -> Self {
        Self {
            announcer,
            identity,
            config,
        }
    }

    /// Run the session on its own task.
    ///
    /// Returns the stream of events to forward to the client and the task
    /// handle. Dropping the stream ends the session.
    pub fn spawn(
        self,
        credential: Option<String>,
        cancel: CancellationToken,
    ) -> (ReceiverStream<StreamEvent>, JoinHandle<SessionEnd>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(self.run(credential, tx, cancel));
        (ReceiverStream::new(rx), handle)
    }

    /// Drive the session to completion, emitting events into `sink`.
    #[tracing::instrument(
        name = "session",
        skip_all,
        fields(
            user_id = tracing::field::Empty,
            session_id = tracing::field::Empty,
            state = SessionState::Authenticating.as_str()
        )
    )]
    pub async fn run(
        self,
        credential: Option<String>,
        sink: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> SessionEnd {
        let end = tokio::select! {
            () = cancel.cancelled() => SessionEnd::Cancelled,
            () = sink.closed() => SessionEnd::ClientGone,
            end = self.drive(credential, &sink) => end,
        };

        // `drive` has been dropped by now, releasing any registration.
        record_state(SessionState::Terminated);
        match end {
            SessionEnd::Rejected(kind) => metrics::record_session_error(kind.as_str()),
            SessionEnd::QueueClosed => metrics::record_session_error("queue_closed"),
            SessionEnd::DegradedTimeout => metrics::record_degraded_timeout(),
            SessionEnd::ClientGone | SessionEnd::Cancelled => {}
        }
        tracing::info!(end = ?end, "Session terminated");
        end
    }

    async fn drive(
        &self,
        credential: Option<String>,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> SessionEnd {
        let principal = match self.authenticate(credential).await {
            Ok(principal) => principal,
            Err(e) => {
                tracing::warn!(error = %e, "Stream authentication failed");
                let kind = StreamErrorKind::from(&e);
                // The client may already be gone; the outcome is the same.
                let _ = sink.send(StreamEvent::Error(kind)).await;
                return SessionEnd::Rejected(kind);
            }
        };
        let user_id = principal.user_id;
        tracing::Span::current().record("user_id", tracing::field::display(&user_id));

        if !self.announcer.is_broker_connected() {
            record_state(SessionState::Degraded);
            if let Err(end) = self.wait_for_liveness(sink).await {
                return end;
            }
        }

        record_state(SessionState::Streaming);
        self.stream(&user_id, sink).await
    }

    /// Resolve the credential, holding a pooled connection only for the lookup.
    async fn authenticate(&self, credential: Option<String>) -> Result<Principal, IdentityError> {
        let token = credential
            .filter(|t| !t.is_empty())
            .ok_or(IdentityError::NotAuthenticated)?;

        let identity = Arc::clone(&self.identity);
        tokio::task::spawn_blocking(move || identity.resolve(&token))
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?
    }

    /// Emit degraded heartbeats until liveness recovers or the bound is hit.
    async fn wait_for_liveness(&self, sink: &mpsc::Sender<StreamEvent>) -> Result<(), SessionEnd> {
        let mut health = self.announcer.liveness().subscribe();

        for tick in 0..self.config.degraded_max_ticks {
            if self.announcer.is_broker_connected() {
                tracing::info!(tick, "Announce path recovered, leaving degraded mode");
                return Ok(());
            }

            emit(sink, StreamEvent::Heartbeat(HeartbeatStatus::Degraded)).await?;

            // The tick ends at its deadline or on recovery; a flag that drops
            // again before this task observes it does not shorten the tick.
            let deadline = Instant::now() + self.config.heartbeat_interval;
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                true = recovered(&mut health) => {
                    tracing::info!(tick, "Announce path recovered, leaving degraded mode");
                    return Ok(());
                }
            }
        }

        if self.announcer.is_broker_connected() {
            return Ok(());
        }

        tracing::warn!(
            ticks = self.config.degraded_max_ticks,
            "Degraded mode exhausted, closing stream"
        );
        emit(sink, StreamEvent::Heartbeat(HeartbeatStatus::DegradedTimeout)).await?;
        Err(SessionEnd::DegradedTimeout)
    }

    async fn stream(&self, user_id: &UserId, sink: &mpsc::Sender<StreamEvent>) -> SessionEnd {
        let (registration, mut queue) = Registration::open(self.announcer.registry(), user_id);
        tracing::Span::current().record(
            "session_id",
            tracing::field::display(registration.session_id),
        );
        tracing::info!("Session streaming");

        let mut replayed = match self.replay_backlog(user_id, sink).await {
            Ok(replayed) => replayed,
            Err(end) => return end,
        };

        loop {
            let next = tokio::time::timeout(self.config.heartbeat_interval, queue.recv()).await;
            let event = match next {
                Ok(Some(record)) => {
                    if replayed.remove(&record.id) {
                        continue;
                    }
                    StreamEvent::Notification(record)
                }
                Ok(None) => {
                    tracing::error!("Session queue closed while registered");
                    return SessionEnd::QueueClosed;
                }
                Err(_) => StreamEvent::Heartbeat(HeartbeatStatus::Alive),
            };

            if let Err(end) = emit(sink, event).await {
                return end;
            }
        }
    }

    /// Send up to `backlog_limit` unread notifications, newest first.
    ///
    /// Returns the ids sent so queued duplicates can be skipped. Load
    /// failures are logged and leave the session streaming.
    async fn replay_backlog(
        &self,
        user_id: &UserId,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> Result<HashSet<String>, SessionEnd> {
        let limit = self.config.backlog_limit;
        if limit == 0 {
            return Ok(HashSet::new());
        }

        let store = Arc::clone(self.announcer.store());
        let owner = user_id.clone();
        let load = tokio::task::spawn_blocking(move || store.list_unread(&owner, limit));

        let backlog = match tokio::time::timeout(self.config.backlog_timeout, load).await {
            Ok(Ok(Ok(records))) => records,
            Ok(Ok(Err(e))) => {
                tracing::warn!(error = %e, "Failed to load unread backlog");
                return Ok(HashSet::new());
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Backlog task failed");
                return Ok(HashSet::new());
            }
            Err(_) => {
                tracing::warn!("Timed out loading unread backlog");
                return Ok(HashSet::new());
            }
        };

        let mut replayed = HashSet::with_capacity(backlog.len());
        for record in backlog {
            replayed.insert(record.id.clone());
            emit(sink, StreamEvent::Notification(Arc::new(record))).await?;
        }
        tracing::debug!(count = replayed.len(), "Replayed unread backlog");
        Ok(replayed)
    }
}

/// Wait on a live session task and log how it ended.
///
/// A panic inside the session is reported here instead of vanishing with
/// the dropped handle. Returns `None` if the task panicked or was aborted.
pub fn supervise(handle: JoinHandle<SessionEnd>) -> JoinHandle<Option<SessionEnd>> {
    tokio::spawn(async move {
        match handle.await {
            Ok(end) => Some(end),
            Err(e) if e.is_panic() => {
                tracing::error!(error = %e, "Session task panicked");
                metrics::record_session_error("panic");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "Session task cancelled");
                None
            }
        }
    })
}

/// Resolves `true` once liveness reads healthy, `false` if the monitor is gone.
async fn recovered(health: &mut watch::Receiver<bool>) -> bool {
    health.wait_for(|healthy| *healthy).await.is_ok()
}

async fn emit(sink: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Result<(), SessionEnd> {
    sink.send(event).await.map_err(|_| SessionEnd::ClientGone)
}

fn record_state(state: SessionState) {
    tracing::Span::current().record("state", state.as_str());
    tracing::debug!(state = state.as_str(), "Session state changed");
}
