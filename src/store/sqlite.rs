//! Pooled SQLite backend for notifications and identities.
//!
//! Uses r2d2 with r2d2_sqlite. The pool is sized small on purpose: live
//! streams never hold a connection, so it only has to cover short
//! request/response work.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

use super::schema::{apply_pragmas, initialize_schema};
use super::{IdentityError, IdentityResolver, NotificationStore, StoreResult};
use crate::model::{NewNotification, NotificationRecord, Principal, Role, UserId};

const RECORD_COLUMNS: &str =
    "id, user_id, kind, title, message, related_id, read, created_at";

/// SQLite-backed Event Store and identity resolver.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    ///
    /// # Arguments
    ///
    /// * `db_path` - Path to the SQLite database file
    /// * `max_size` - Maximum number of connections in the pool
    /// * `acquire_timeout` - How long a caller waits for a free connection
    ///   before the call fails as unavailable
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        max_size: u32,
        acquire_timeout: Duration,
    ) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(db_path);

        let pool = Pool::builder()
            .max_size(max_size)
            .connection_timeout(acquire_timeout)
            .connection_customizer(Box::new(PragmaCustomizer))
            .build(manager)?;

        let conn = pool.get()?;
        initialize_schema(&conn)?;

        Ok(Self { pool })
    }

    fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Get the current pool state for monitoring.
    pub fn state(&self) -> r2d2::State {
        self.pool.state()
    }

    /// Insert or update a user in the identity tables.
    pub fn upsert_user(&self, user_id: &UserId, display_name: &str, role: Role) -> StoreResult<()> {
        let role = match role {
            Role::Admin => "ADMIN",
            Role::User => "USER",
        };
        self.conn()?.execute(
            "INSERT INTO users (id, display_name, role, active) VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name, role = excluded.role",
            params![user_id.as_str(), display_name, role],
        )?;
        Ok(())
    }

    /// Enable or disable a user. Disabled users fail identity resolution.
    pub fn set_user_active(&self, user_id: &UserId, active: bool) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE users SET active = ?2 WHERE id = ?1",
            params![user_id.as_str(), active],
        )?;
        Ok(())
    }

    /// Bind a session token to a user.
    pub fn issue_token(&self, token: &str, user_id: &UserId) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO auth_tokens (token, user_id) VALUES (?1, ?2)",
            params![token, user_id.as_str()],
        )?;
        Ok(())
    }

    fn query_records(
        &self,
        filter: &str,
        user_id: &UserId,
        limit: usize,
    ) -> StoreResult<Vec<NotificationRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM notifications
             WHERE user_id = ?1 {filter}
             ORDER BY created_at DESC, id DESC
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![user_id.as_str(), limit as i64], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    Ok(NotificationRecord {
        id: row.get(0)?,
        user_id: UserId::new(row.get::<_, String>(1)?),
        kind: row.get(2)?,
        title: row.get(3)?,
        message: row.get(4)?,
        related_id: row.get(5)?,
        read: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl NotificationStore for SqliteStore {
    fn create(&self, new: &NewNotification) -> StoreResult<NotificationRecord> {
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

        self.conn()?.execute(
            "INSERT INTO notifications (id, user_id, kind, title, message, related_id, read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                record.id,
                record.user_id.as_str(),
                record.kind,
                record.title,
                record.message,
                record.related_id,
                record.created_at,
            ],
        )?;

        Ok(record)
    }

    fn list_unread(&self, user_id: &UserId, limit: usize) -> StoreResult<Vec<NotificationRecord>> {
        self.query_records("AND read = 0", user_id, limit)
    }

    fn list_recent(&self, user_id: &UserId, limit: usize) -> StoreResult<Vec<NotificationRecord>> {
        self.query_records("", user_id, limit)
    }

    fn unread_count(&self, user_id: &UserId) -> StoreResult<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND read = 0",
            params![user_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn mark_read(&self, user_id: &UserId, notification_id: &str) -> StoreResult<bool> {
        let changed = self.conn()?.execute(
            "UPDATE notifications SET read = 1 WHERE id = ?1 AND user_id = ?2",
            params![notification_id, user_id.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn mark_all_read(&self, user_id: &UserId) -> StoreResult<u64> {
        let changed = self.conn()?.execute(
            "UPDATE notifications SET read = 1 WHERE user_id = ?1 AND read = 0",
            params![user_id.as_str()],
        )?;
        Ok(changed as u64)
    }

    fn ping(&self) -> StoreResult<()> {
        self.conn()?.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

impl IdentityResolver for SqliteStore {
    fn resolve(&self, token: &str) -> Result<Principal, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::NotAuthenticated);
        }

        // The connection goes back to the pool when this scope ends.
        let conn = self.conn()?;
        let row: Option<(String, Option<String>, Option<bool>)> = conn
            .query_row(
                "SELECT t.user_id, u.role, u.active
                 FROM auth_tokens t LEFT JOIN users u ON u.id = t.user_id
                 WHERE t.token = ?1",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;

        match row {
            None => Err(IdentityError::NotAuthenticated),
            Some((user_id, Some(role), Some(true))) => Ok(Principal {
                user_id: UserId::new(user_id),
                role: Role::from_db(&role),
            }),
            Some(_) => Err(IdentityError::UserNotFound),
        }
    }
}

/// Connection customizer that applies pragmas on acquire.
#[derive(Debug)]
struct PragmaCustomizer;

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        apply_pragmas(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(temp_dir: &TempDir) -> SqliteStore {
        SqliteStore::open(temp_dir.path().join("test.db"), 4, Duration::from_secs(1)).unwrap()
    }

    fn new_notification(user: &str, title: &str) -> NewNotification {
        NewNotification {
            user_id: UserId::new(user),
            kind: "ASIGNACION".into(),
            title: title.into(),
            message: format!("{title} body"),
            related_id: Some("op-1".into()),
        }
    }

    #[test]
    fn test_reopen_keeps_rows_and_frees_schema_connection() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");
        let user = UserId::new("alice");

        let store = SqliteStore::open(&path, 1, Duration::from_millis(200)).unwrap();
        store.create(&new_notification("alice", "kept")).unwrap();
        drop(store);

        // A single-connection pool only works if schema setup handed its
        // connection back.
        let reopened = SqliteStore::open(&path, 1, Duration::from_millis(200)).unwrap();
        let recent = reopened.list_recent(&user, 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].title, "kept");
    }

    #[test]
    fn test_create_and_list_newest_first() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let user = UserId::new("alice");

        let first = store.create(&new_notification("alice", "first")).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = store.create(&new_notification("alice", "second")).unwrap();
        store.create(&new_notification("bob", "other")).unwrap();

        assert!(!first.read);
        assert_eq!(first.related_id.as_deref(), Some("op-1"));

        let unread = store.list_unread(&user, 10).unwrap();
        let ids: Vec<_> = unread.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, vec![second.id.clone(), first.id.clone()]);

        assert_eq!(store.list_unread(&user, 1).unwrap().len(), 1);
        assert_eq!(store.unread_count(&user).unwrap(), 2);
    }

    #[test]
    fn test_mark_read_scoped_to_owner() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let n = store.create(&new_notification("alice", "mine")).unwrap();

        assert!(!store.mark_read(&bob, &n.id).unwrap());
        assert_eq!(store.unread_count(&alice).unwrap(), 1);

        assert!(store.mark_read(&alice, &n.id).unwrap());
        assert_eq!(store.unread_count(&alice).unwrap(), 0);

        // Still listed, now read
        let recent = store.list_recent(&alice, 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].read);
        assert!(store.list_unread(&alice, 10).unwrap().is_empty());
    }

    #[test]
    fn test_mark_all_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let alice = UserId::new("alice");

        for i in 0..3 {
            store.create(&new_notification("alice", &format!("n{i}"))).unwrap();
        }
        store.create(&new_notification("bob", "keep")).unwrap();

        assert_eq!(store.mark_all_read(&alice).unwrap(), 3);
        assert_eq!(store.mark_all_read(&alice).unwrap(), 0);
        assert_eq!(store.unread_count(&UserId::new("bob")).unwrap(), 1);
    }

    #[test]
    fn test_resolve_identity() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);
        let alice = UserId::new("alice");

        store.upsert_user(&alice, "Alice", Role::Admin).unwrap();
        store.issue_token("tok-alice", &alice).unwrap();
        store.issue_token("tok-orphan", &UserId::new("ghost")).unwrap();

        let principal = store.resolve("tok-alice").unwrap();
        assert_eq!(principal.user_id, alice);
        assert!(principal.is_admin());

        assert_eq!(store.resolve(""), Err(IdentityError::NotAuthenticated));
        assert_eq!(store.resolve("nope"), Err(IdentityError::NotAuthenticated));
        assert_eq!(store.resolve("tok-orphan"), Err(IdentityError::UserNotFound));

        store.set_user_active(&alice, false).unwrap();
        assert_eq!(store.resolve("tok-alice"), Err(IdentityError::UserNotFound));
    }

    #[test]
    fn test_resolve_releases_connection() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::open(
            temp_dir.path().join("test.db"),
            1,
            Duration::from_millis(200),
        )
        .unwrap();
        let alice = UserId::new("alice");
        store.upsert_user(&alice, "Alice", Role::User).unwrap();
        store.issue_token("tok", &alice).unwrap();

        // A single-connection pool serves repeated lookups only if each one
        // hands its connection back.
        for _ in 0..5 {
            assert!(store.resolve("tok").is_ok());
        }
        assert_eq!(store.state().connections - store.state().idle_connections, 0);
    }

    #[test]
    fn test_exhausted_pool_reports_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::open(
            temp_dir.path().join("test.db"),
            1,
            Duration::from_millis(50),
        )
        .unwrap();

        let _held = store.conn().unwrap();
        assert!(matches!(store.resolve("tok"), Err(IdentityError::Unavailable(_))));
        assert!(store.ping().is_err());
    }
}
