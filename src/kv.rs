use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::errors::AppResult;

/// SQLite-backed key-value store with per-entry expiry.
///
/// Backs both the resolution cache and the intermediate hand-off store.
/// The connection is shared behind a mutex so concurrent pipeline workers
/// can read and write safely; every operation holds the lock only for the
/// duration of one statement.
#[derive(Clone)]
pub struct KvStore {
    conn: Arc<Mutex<Connection>>,
}

impl KvStore {
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let connection = Connection::open(path.as_ref())?;
        let store = Self::from_connection(connection)?;
        debug!(path = %path.as_ref().display(), "kv store opened");
        Ok(store)
    }

    /// In-memory scratch store, used by tests.
    pub fn in_memory() -> AppResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> AppResult<Self> {
        migrate(&connection)?;
        let store = Self {
            conn: Arc::new(Mutex::new(connection)),
        };
        store.purge_expired()?;
        Ok(store)
    }

    pub fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2",
            (key, Utc::now().timestamp()),
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> AppResult<()> {
        let expires_at = Utc::now().timestamp() + ttl_secs as i64;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at",
            (key, value, expires_at),
        )?;
        Ok(())
    }

    /// Unexpired keys beginning with `prefix`, in lexicographic order.
    pub fn scan_prefix(&self, prefix: &str) -> AppResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key FROM kv
            WHERE key LIKE ?1 || '%' AND expires_at > ?2
            ORDER BY key ASC",
        )?;
        let keys = stmt
            .query_map((prefix, Utc::now().timestamp()), |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn delete(&self, keys: &[String]) -> AppResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Expired rows are already invisible to reads; this reclaims the space.
    fn purge_expired(&self) -> AppResult<()> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM kv WHERE expires_at <= ?1",
            [Utc::now().timestamp()],
        )?;
        if removed > 0 {
            debug!(removed, "purged expired kv entries");
        }
        Ok(())
    }
}

fn migrate(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrip() {
        let store = KvStore::in_memory().unwrap();
        store.set_ex("ns:0", "payload", 60).unwrap();
        assert_eq!(store.get("ns:0").unwrap().as_deref(), Some("payload"));
        assert_eq!(store.get("ns:1").unwrap(), None);
    }

    #[test]
    fn overwrites_existing_key() {
        let store = KvStore::in_memory().unwrap();
        store.set_ex("ns:0", "first", 60).unwrap();
        store.set_ex("ns:0", "second", 60).unwrap();
        assert_eq!(store.get("ns:0").unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn expired_entries_are_invisible() {
        let store = KvStore::in_memory().unwrap();
        store.set_ex("ns:0", "stale", 0).unwrap();
        assert_eq!(store.get("ns:0").unwrap(), None);
        assert!(store.scan_prefix("ns:").unwrap().is_empty());
    }

    #[test]
    fn scan_prefix_is_namespace_scoped() {
        let store = KvStore::in_memory().unwrap();
        store.set_ex("runs/a:0", "x", 60).unwrap();
        store.set_ex("runs/a:1", "y", 60).unwrap();
        store.set_ex("runs/b:0", "z", 60).unwrap();

        let keys = store.scan_prefix("runs/a:").unwrap();
        assert_eq!(keys, vec!["runs/a:0".to_string(), "runs/a:1".to_string()]);
    }

    #[test]
    fn delete_removes_only_requested_keys() {
        let store = KvStore::in_memory().unwrap();
        store.set_ex("ns:0", "x", 60).unwrap();
        store.set_ex("ns:1", "y", 60).unwrap();

        store.delete(&["ns:0".to_string()]).unwrap();
        assert_eq!(store.get("ns:0").unwrap(), None);
        assert_eq!(store.get("ns:1").unwrap().as_deref(), Some("y"));
    }
}
