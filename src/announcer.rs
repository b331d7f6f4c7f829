//! Announcer: the single entry point business logic uses to notify users.
//!
//! An announcement is a durable write to the Event Store followed by a
//! push onto every live session queue of the target user. The write must
//! succeed before anything is pushed, so a live client never sees a
//! notification that is missing from its history.

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::liveness::LivenessMonitor;
use crate::model::{NewNotification, NotificationRecord, UserId};
use crate::observability::metrics;
use crate::registry::ConnectionRegistry;
use crate::store::{NotificationStore, StoreError};

/// Error returned when an announcement could not be persisted.
#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("failed to persist notification: {0}")]
    Store(#[from] StoreError),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Persist-then-broadcast multiplexer.
#[derive(Clone)]
pub struct Announcer {
    store: Arc<dyn NotificationStore>,
    registry: Arc<ConnectionRegistry>,
    liveness: Arc<LivenessMonitor>,
}

impl Announcer {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: Arc<ConnectionRegistry>,
        liveness: Arc<LivenessMonitor>,
    ) -> Self {
        Self {
            store,
            registry,
            liveness,
        }
    }

    /// Create a notification for `user_id` and push it to its live sessions.
    pub async fn create_notification(
        &self,
        user_id: &UserId,
        kind: &str,
        title: &str,
        message: &str,
        related_id: Option<&str>,
    ) -> Result<NotificationRecord, AnnounceError> {
        self.announce(NewNotification {
            user_id: user_id.clone(),
            kind: kind.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            related_id: related_id.map(str::to_string),
        })
        .await
    }

    /// Persist `new`, then broadcast the stored record.
    ///
    /// Store failures are returned once and never retried; nothing is
    /// broadcast for a failed write.
    #[tracing::instrument(skip(self, new), fields(user_id = %new.user_id, kind = %new.kind))]
    pub async fn announce(&self, new: NewNotification) -> Result<NotificationRecord, AnnounceError> {
        let store = Arc::clone(&self.store);
        let record = tokio::task::spawn_blocking(move || store.create(&new)).await??;

        metrics::record_notification_created(&record.kind);
        tracing::info!(notification_id = %record.id, "Notification created");

        let delivered = self.broadcast_to_user(&record.user_id, record.clone());
        tracing::debug!(notification_id = %record.id, delivered, "Notification fanned out");

        Ok(record)
    }

    /// Push an already-persisted record onto every live session of `user_id`.
    ///
    /// Returns the number of sessions reached.
    pub fn broadcast_to_user(&self, user_id: &UserId, record: NotificationRecord) -> usize {
        let delivered = self.registry.broadcast(user_id, Arc::new(record));
        metrics::record_fanout(delivered);
        delivered
    }

    /// Announce on a detached task.
    ///
    /// Failures are logged and dropped; they never reach the caller.
    pub fn spawn_notification(&self, new: NewNotification) -> JoinHandle<()> {
        let announcer = self.clone();
        tokio::spawn(async move {
            let user_id = new.user_id.clone();
            if let Err(e) = announcer.announce(new).await {
                tracing::warn!(user_id = %user_id, error = %e, "Background notification dropped");
            }
        })
    }

    /// Whether live delivery is currently healthy end-to-end.
    pub fn is_broker_connected(&self) -> bool {
        self.liveness.is_healthy()
    }

    /// Number of open sessions across all users.
    pub fn active_session_count(&self) -> usize {
        self.registry.count_active()
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn liveness(&self) -> &Arc<LivenessMonitor> {
        &self.liveness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::store::memory::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, Announcer) {
        let store = Arc::new(MemoryStore::new());
        let announcer = Announcer::new(
            store.clone(),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(LivenessMonitor::new(true)),
        );
        (store, announcer)
    }

    #[tokio::test]
    async fn test_create_notification_fans_out_to_all_sessions() {
        let (store, announcer) = setup();
        let user = UserId::new("u");
        let other = UserId::new("other");
        store.add_user("tok", &user, Role::User);

        let (mut s1, _) = announcer.registry().register(&user);
        let (mut s2, _) = announcer.registry().register(&user);
        let (mut s3, _) = announcer.registry().register(&other);

        let record = announcer
            .create_notification(&user, "ASIGNACION", "T1", "msg1", None)
            .await
            .unwrap();

        let stored = store.notifications_for(&user);
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].read);
        assert_eq!(stored[0].id, record.id);

        for rx in [&mut s1, &mut s2] {
            let got = rx.try_recv().unwrap();
            assert_eq!(got.title, "T1");
            assert_eq!(got.message, "msg1");
            assert!(rx.try_recv().is_err());
        }
        assert!(s3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_write_broadcasts_nothing() {
        let (store, announcer) = setup();
        let user = UserId::new("u");
        let (mut rx, _) = announcer.registry().register(&user);

        store.set_available(false);
        let result = announcer
            .create_notification(&user, "ASIGNACION", "T1", "msg1", Some("op-9"))
            .await;

        assert!(matches!(result, Err(AnnounceError::Store(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_notification_swallows_failures() {
        let (store, announcer) = setup();
        store.set_available(false);

        let handle = announcer.spawn_notification(NewNotification {
            user_id: UserId::new("u"),
            kind: "CAMBIO_ESTATUS".into(),
            title: "t".into(),
            message: "m".into(),
            related_id: None,
        });

        // The task completes without panicking even though the write failed.
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_health_and_counts_delegate() {
        let (_store, announcer) = setup();
        assert!(announcer.is_broker_connected());

        announcer.liveness().set_healthy(false);
        assert!(!announcer.is_broker_connected());

        let user = UserId::new("u");
        let (_rx, session_id) = announcer.registry().register(&user);
        assert_eq!(announcer.active_session_count(), 1);
        announcer.registry().unregister(&user, session_id);
        assert_eq!(announcer.active_session_count(), 0);
    }
}
