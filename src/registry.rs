//! Connection registry for live notification fan-out.
//!
//! Tracks every open delivery session per user so an announced
//! notification can be pushed onto each of that user's queues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::model::{NotificationRecord, SessionId, UserId};

/// Item carried by a session queue. Shared so fan-out never clones records.
pub type QueuedNotification = Arc<NotificationRecord>;

/// Consumer end of a session queue, owned by exactly one session handler.
pub type SessionQueue = mpsc::UnboundedReceiver<QueuedNotification>;

type SessionSender = mpsc::UnboundedSender<QueuedNotification>;

/// Registry of open sessions: `user_id -> {session_id -> queue}`.
///
/// All mutations happen under one mutex that is never held across an
/// `.await`, so registration and fan-out can race freely.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<UserId, HashMap<SessionId, SessionSender>>>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, HashMap<SessionId, SessionSender>>> {
        // A panic while holding the lock cannot leave the map half-updated,
        // so a poisoned lock is still safe to use.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session for `user_id`.
    ///
    /// Returns the consumer end of a fresh queue and its session id.
    pub fn register(&self, user_id: &UserId) -> (SessionQueue, SessionId) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = SessionId::generate();

        self.lock()
            .entry(user_id.clone())
            .or_default()
            .insert(session_id, tx);

        tracing::debug!(user_id = %user_id, session_id = %session_id, "Session registered");
        (rx, session_id)
    }

    /// Unregister one session.
    ///
    /// Drops the user's entry once its last session is gone. Unregistering
    /// an unknown session is a no-op.
    pub fn unregister(&self, user_id: &UserId, session_id: SessionId) {
        let mut sessions = self.lock();
        let Some(user_sessions) = sessions.get_mut(user_id) else {
            return;
        };

        if user_sessions.remove(&session_id).is_some() {
            tracing::debug!(user_id = %user_id, session_id = %session_id, "Session unregistered");
        }
        if user_sessions.is_empty() {
            sessions.remove(user_id);
        }
    }

    /// Push `notification` onto every queue registered for `user_id`.
    ///
    /// Returns the number of queues that accepted it. Users without
    /// sessions are skipped silently.
    pub fn broadcast(&self, user_id: &UserId, notification: QueuedNotification) -> usize {
        let sessions = self.lock();
        let Some(user_sessions) = sessions.get(user_id) else {
            tracing::debug!(user_id = %user_id, "No live sessions, notification stored only");
            return 0;
        };

        user_sessions
            .iter()
            .filter(|(session_id, tx)| {
                // The receiver is gone only while its session is tearing down.
                let delivered = tx.send(Arc::clone(&notification)).is_ok();
                if !delivered {
                    tracing::trace!(session_id = %session_id, "Skipping closing session");
                }
                delivered
            })
            .count()
    }

    /// Total number of open sessions across all users.
    pub fn count_active(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    /// Number of users with at least one open session.
    pub fn count_users(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user: &str, title: &str) -> QueuedNotification {
        Arc::new(NotificationRecord {
            id: crate::generate_id(),
            user_id: UserId::new(user),
            kind: "ASIGNACION".into(),
            title: title.into(),
            message: "body".into(),
            related_id: None,
            read: false,
            created_at: crate::now_millis(),
        })
    }

    #[test]
    fn test_register_unregister() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new("alice");

        let (_rx, session_id) = registry.register(&user);
        assert_eq!(registry.count_active(), 1);

        registry.unregister(&user, session_id);
        assert_eq!(registry.count_active(), 0);
    }

    #[test]
    fn test_fanout_reaches_every_session_of_user_only() {
        let registry = ConnectionRegistry::new();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let (mut a1, _) = registry.register(&alice);
        let (mut a2, _) = registry.register(&alice);
        let (mut b1, _) = registry.register(&bob);

        let delivered = registry.broadcast(&alice, record("alice", "T1"));
        assert_eq!(delivered, 2);

        assert_eq!(a1.try_recv().unwrap().title, "T1");
        assert_eq!(a2.try_recv().unwrap().title, "T1");
        // Exactly once per session
        assert!(a1.try_recv().is_err());
        assert!(a2.try_recv().is_err());
        assert!(b1.try_recv().is_err());
    }

    #[test]
    fn test_unregister_is_isolated() {
        let registry = ConnectionRegistry::new();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let (_a1, s1) = registry.register(&alice);
        let (mut a2, _) = registry.register(&alice);
        let (mut b1, _) = registry.register(&bob);

        registry.unregister(&alice, s1);
        assert_eq!(registry.count_active(), 2);

        assert_eq!(registry.broadcast(&alice, record("alice", "after")), 1);
        assert_eq!(a2.try_recv().unwrap().title, "after");

        assert_eq!(registry.broadcast(&bob, record("bob", "bob")), 1);
        assert_eq!(b1.try_recv().unwrap().title, "bob");
    }

    #[test]
    fn test_unregister_twice_is_noop() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new("alice");

        let (_rx, session_id) = registry.register(&user);
        registry.unregister(&user, session_id);
        registry.unregister(&user, session_id);
        registry.unregister(&UserId::new("nobody"), session_id);

        assert_eq!(registry.count_active(), 0);
    }

    #[test]
    fn test_last_unregister_removes_user_entry() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new("alice");

        let (_r1, s1) = registry.register(&user);
        let (_r2, s2) = registry.register(&user);
        assert_eq!(registry.count_active(), 2);
        assert_eq!(registry.count_users(), 1);

        registry.unregister(&user, s1);
        assert_eq!(registry.count_users(), 1);

        registry.unregister(&user, s2);
        assert_eq!(registry.count_active(), 0);
        assert_eq!(registry.count_users(), 0);
    }

    #[test]
    fn test_broadcast_without_sessions() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.broadcast(&UserId::new("ghost"), record("ghost", "x")), 0);
    }

    #[test]
    fn test_broadcast_preserves_fifo_per_session() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new("alice");
        let (mut rx, _) = registry.register(&user);

        for i in 0..10 {
            registry.broadcast(&user, record("alice", &format!("m{i}")));
        }
        for i in 0..10 {
            assert_eq!(rx.try_recv().unwrap().title, format!("m{i}"));
        }
    }

    #[test]
    fn test_broadcast_skips_dropped_receiver() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new("alice");
        let (rx, _) = registry.register(&user);
        let (mut live, _) = registry.register(&user);
        drop(rx);

        assert_eq!(registry.broadcast(&user, record("alice", "x")), 1);
        assert!(live.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_register_and_broadcast() {
        let registry = Arc::new(ConnectionRegistry::new());
        let user = UserId::new("alice");

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let user = user.clone();
                tokio::spawn(async move {
                    let (rx, session_id) = registry.register(&user);
                    registry.broadcast(&user, record("alice", &format!("m{i}")));
                    registry.unregister(&user, session_id);
                    drop(rx);
                })
            })
            .collect();

        for handle in handles {
            tokio_test::assert_ok!(handle.await);
        }
        assert_eq!(registry.count_active(), 0);
        assert_eq!(registry.count_users(), 0);
    }
}
