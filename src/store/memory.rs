//! In-process Event Store.
//!
//! Keeps everything in a mutex-guarded map. Availability can be toggled to
//! exercise failure paths without a real database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{IdentityError, IdentityResolver, NotificationStore, StoreError, StoreResult};
use crate::model::{NewNotification, NotificationRecord, Principal, Role, UserId};

#[derive(Debug, Default)]
struct MemoryState {
    /// Insertion order doubles as creation order.
    notifications: Vec<NotificationRecord>,
    users: HashMap<UserId, (Role, bool)>,
    tokens: HashMap<String, UserId>,
}

/// Event Store and identity resolver backed by process memory.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing database going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Register an active user and bind `token` to it.
    pub fn add_user(&self, token: &str, user_id: &UserId, role: Role) {
        let mut state = self.lock();
        state.users.insert(user_id.clone(), (role, true));
        state.tokens.insert(token.to_string(), user_id.clone());
    }

    /// Bind `token` to a user id without creating the user.
    pub fn add_token(&self, token: &str, user_id: &UserId) {
        self.lock().tokens.insert(token.to_string(), user_id.clone());
    }

    /// All notifications ever created for `user_id`, oldest first.
    pub fn notifications_for(&self, user_id: &UserId) -> Vec<NotificationRecord> {
        self.lock()
            .notifications
            .iter()
            .filter(|n| &n.user_id == user_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    fn newest_first<F>(&self, user_id: &UserId, limit: usize, keep: F) -> Vec<NotificationRecord>
    where
        F: Fn(&NotificationRecord) -> bool,
    {
        self.lock()
            .notifications
            .iter()
            .rev()
            .filter(|n| &n.user_id == user_id && keep(n))
            .take(limit)
            .cloned()
            .collect()
    }
}

impl NotificationStore for MemoryStore {
    fn create(&self, new: &NewNotification) -> StoreResult<NotificationRecord> {
        self.check_available()?;
        let record = NotificationRecord {
            id: crate::generate_id(),
            user_id: new.user_id.clone(),
            kind: new.kind.clone(),
            title: new.title.clone(),
            message: new.message.clone(),
            related_id: new.related_id.clone(),
            read: false,
            created_at: crate::now_millis(),
        };
        self.lock().notifications.push(record.clone());
        Ok(record)
    }

    fn list_unread(&self, user_id: &UserId, limit: usize) -> StoreResult<Vec<NotificationRecord>> {
        self.check_available()?;
        Ok(self.newest_first(user_id, limit, |n| !n.read))
    }

    fn list_recent(&self, user_id: &UserId, limit: usize) -> StoreResult<Vec<NotificationRecord>> {
        self.check_available()?;
        Ok(self.newest_first(user_id, limit, |_| true))
    }

    fn unread_count(&self, user_id: &UserId) -> StoreResult<u64> {
        self.check_available()?;
        let count = self
            .lock()
            .notifications
            .iter()
            .filter(|n| &n.user_id == user_id && !n.read)
            .count();
        Ok(count as u64)
    }

    fn mark_read(&self, user_id: &UserId, notification_id: &str) -> StoreResult<bool> {
        self.check_available()?;
        let mut state = self.lock();
        match state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id && &n.user_id == user_id)
        {
            Some(n) => {
                n.read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn mark_all_read(&self, user_id: &UserId) -> StoreResult<u64> {
        self.check_available()?;
        let mut changed = 0;
        for n in self
            .lock()
            .notifications
            .iter_mut()
            .filter(|n| &n.user_id == user_id && !n.read)
        {
            n.read = true;
            changed += 1;
        }
        Ok(changed)
    }

    fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}

impl IdentityResolver for MemoryStore {
    fn resolve(&self, token: &str) -> Result<Principal, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::NotAuthenticated);
        }
        self.check_available()?;

        let state = self.lock();
        let user_id = state
            .tokens
            .get(token)
            .ok_or(IdentityError::NotAuthenticated)?;
        match state.users.get(user_id) {
            Some((role, true)) => Ok(Principal {
                user_id: user_id.clone(),
                role: *role,
            }),
            _ => Err(IdentityError::UserNotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        let user = UserId::new("alice");
        store.add_user("tok", &user, Role::User);
        store.set_available(false);

        let new = NewNotification {
            user_id: user.clone(),
            kind: "ASIGNACION".into(),
            title: "t".into(),
            message: "m".into(),
            related_id: None,
        };
        assert!(store.create(&new).is_err());
        assert!(store.ping().is_err());
        assert!(matches!(store.resolve("tok"), Err(IdentityError::Unavailable(_))));
        assert!(store.notifications_for(&user).is_empty());
    }

    #[test]
    fn test_resolve_outcomes() {
        let store = MemoryStore::new();
        store.add_user("tok", &UserId::new("alice"), Role::Admin);
        store.add_token("orphan", &UserId::new("ghost"));

        assert!(store.resolve("tok").unwrap().is_admin());
        assert_eq!(store.resolve("missing"), Err(IdentityError::NotAuthenticated));
        assert_eq!(store.resolve("orphan"), Err(IdentityError::UserNotFound));
    }
}
