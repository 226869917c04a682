//! Persistent cache tier backed by SQLite.
//! Blocking rusqlite calls run on the blocking thread pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::store::{now_millis, PersistentStore, StoreError, StoredEntry};

/// SQLite-backed key-value store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: &'static str,
}

impl SqliteStore {
    pub const DEFAULT_TABLE: &'static str = "translation_cache";

    /// Open (or create) the database at `db_path` using the default table.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        Self::open_table(db_path, Self::DEFAULT_TABLE)
    }

    /// Open using a specific table, so independent stores can share one file.
    pub fn open_table(db_path: &Path, table: &'static str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;

        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::init(conn, table)?;
        info!(path = %db_path.display(), table, "SQLite store opened");
        Ok(store)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, Self::DEFAULT_TABLE)
    }

    fn init(conn: Connection, table: &'static str) -> Result<Self, StoreError> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                cache_key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                written_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_written
                ON {table}(written_at);"
        ))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table,
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &'static str) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = self.table;
        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn, table)
        })
        .await?;
        Ok(result?)
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        let value = self
            .with_conn(move |conn, table| {
                conn.query_row(
                    &format!("SELECT value FROM {table} WHERE cache_key = ?1"),
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;
        if value.is_some() {
            debug!("persistent tier hit");
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        let now = now_millis();
        // REPLACE deletes the old row, so the rewritten key gets a fresh rowid.
        self.with_conn(move |conn, table| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO {table} (cache_key, value, written_at)
                     VALUES (?1, ?2, ?3)"
                ),
                params![key, value, now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn, table| {
            conn.execute(&format!("DELETE FROM {table} WHERE cache_key = ?1"), params![key])
                .map(|_| ())
        })
        .await
    }

    async fn all(&self) -> Result<Vec<StoredEntry>, StoreError> {
        self.with_conn(|conn, table| {
            let mut stmt = conn.prepare(&format!(
                "SELECT cache_key, value, written_at FROM {table}
                 ORDER BY written_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok(StoredEntry {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    written_at: row.get(2)?,
                })
            })?;
            let entries = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.with_conn(|conn, table| conn.execute(&format!("DELETE FROM {table}"), []).map(|_| ()))
            .await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn, table| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
        })
        .await
    }

    async fn prune_oldest(&self, keep: usize) -> Result<usize, StoreError> {
        let removed = self
            .with_conn(move |conn, table| {
                conn.execute(
                    &format!(
                        "DELETE FROM {table} WHERE rowid IN (
                            SELECT rowid FROM {table}
                            ORDER BY written_at ASC, rowid ASC
                            LIMIT MAX((SELECT COUNT(*) FROM {table}) - ?1, 0)
                        )"
                    ),
                    params![keep as i64],
                )
            })
            .await?;
        if removed > 0 {
            info!(removed, keep, "persistent tier pruned");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_overwrite_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("hello", "你好").await.unwrap();
        assert_eq!(store.get("hello").await.unwrap().as_deref(), Some("你好"));

        store.set("hello", "您好").await.unwrap();
        assert_eq!(store.get("hello").await.unwrap().as_deref(), Some("您好"));
        assert_eq!(store.count().await.unwrap(), 1);

        store.delete("hello").await.unwrap();
        assert_eq!(store.get("hello").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prune_keeps_most_recent_writes() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..20 {
            store.set(&format!("k{i:02}"), "v").await.unwrap();
        }
        assert_eq!(store.prune_oldest(5).await.unwrap(), 15);

        let keys: Vec<String> = store.all().await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["k15", "k16", "k17", "k18", "k19"]);
        assert_eq!(store.prune_oldest(5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn separate_tables_in_one_file_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let cache = SqliteStore::open(&path).unwrap();
        let counters = SqliteStore::open_table(&path, "counters").unwrap();

        cache.set("k", "cached").await.unwrap();
        counters.set("k", "7").await.unwrap();
        cache.clear().await.unwrap();

        assert_eq!(cache.count().await.unwrap(), 0);
        assert_eq!(counters.get("k").await.unwrap().as_deref(), Some("7"));
    }
}
