//! Event Store and identity lookup contracts.
//!
//! Herald never owns the durable notification history; it talks to it
//! through [`NotificationStore`]. Callers resolve identities through
//! [`IdentityResolver`]. Both contracts are blocking and are driven from
//! `tokio::task::spawn_blocking`, so a pooled connection is held only for
//! the span of a single call.
//!
//! Provides:
//! - [`sqlite::SqliteStore`]: r2d2-pooled SQLite backend
//! - [`memory::MemoryStore`]: in-process backend for tests and demos

pub mod memory;
pub mod schema;
pub mod sqlite;

use thiserror::Error;

use crate::model::{NewNotification, NotificationRecord, Principal, UserId};

/// Error type for Event Store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reasons an identity could not be resolved.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("identity store unavailable: {0}")]
    Unavailable(String),

    #[error("user not found")]
    UserNotFound,
}

impl From<StoreError> for IdentityError {
    fn from(e: StoreError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Durable notification history.
pub trait NotificationStore: Send + Sync + 'static {
    /// Persist a new unread notification.
    fn create(&self, new: &NewNotification) -> StoreResult<NotificationRecord>;

    /// Unread notifications for `user_id`, newest first.
    fn list_unread(&self, user_id: &UserId, limit: usize) -> StoreResult<Vec<NotificationRecord>>;

    /// Read and unread notifications for `user_id`, newest first.
    fn list_recent(&self, user_id: &UserId, limit: usize) -> StoreResult<Vec<NotificationRecord>>;

    fn unread_count(&self, user_id: &UserId) -> StoreResult<u64>;

    /// Mark one notification owned by `user_id` as read.
    ///
    /// Returns false if no such notification belongs to the user.
    fn mark_read(&self, user_id: &UserId, notification_id: &str) -> StoreResult<bool>;

    /// Mark every unread notification of `user_id` as read.
    ///
    /// Returns the number of notifications that changed.
    fn mark_all_read(&self, user_id: &UserId) -> StoreResult<u64>;

    /// Cheap round-trip used by the liveness probe.
    fn ping(&self) -> StoreResult<()>;
}

/// Maps a session credential to a caller.
pub trait IdentityResolver: Send + Sync + 'static {
    fn resolve(&self, token: &str) -> Result<Principal, IdentityError>;
}
