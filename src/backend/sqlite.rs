//! Embedded store on a single SQLite table.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use super::{check_key, Backend, Result};
use crate::error::BackendError;

pub const DB_NAME: &str = "dockhand.db";

const SCHEMA_SQL: &str = "
PRAGMA journal_mode = WAL;
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
);
";

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DB_NAME);
        debug!("Using sqlite store at {}", path.display());
        Self::init(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection off the async executor.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| BackendError::Config("sqlite connection poisoned".into()))?;
            f(&conn)
        })
        .await
        .map_err(|e| BackendError::Config(format!("sqlite task failed: {}", e)))?
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        check_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?
            .ok_or(BackendError::NotFound(key))
        })
        .await
    }

    async fn get_prefixed(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        check_key(prefix)?;
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            let mut values = Vec::new();
            for row in rows {
                let (key, value) = row?;
                if !key.starts_with(&prefix) {
                    break;
                }
                values.push(value);
            }
            Ok(values)
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        check_key(key)?;
        let key = key.to_string();
        let value = value.to_vec();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch("PRAGMA optimize;")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> SqliteBackend {
        SqliteBackend::open_in_memory().expect("open in-memory store")
    }

    #[tokio::test]
    async fn test_crud() {
        let store = make_store();
        store.put("testKey1", b"test data").await.expect("put");
        assert_eq!(store.get("testKey1").await.expect("get"), b"test data");

        store.put("testKey1", b"replaced").await.expect("upsert");
        assert_eq!(store.get("testKey1").await.expect("get"), b"replaced");

        store.delete("testKey1").await.expect("delete");
        assert!(store.get("testKey1").await.unwrap_err().is_not_found());
        store.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_prefixed() {
        let store = make_store();
        store.put("dockhand/apps/demo", b"1").await.unwrap();
        store.put("dockhand/apps/demo_feature", b"2").await.unwrap();
        store.put("dockhand/configuration", b"3").await.unwrap();

        let values = store.get_prefixed("dockhand/apps/").await.unwrap();
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn test_on_disk_database() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SqliteBackend::open(dir.path()).unwrap();
            store.put("k", b"v").await.unwrap();
        }
        let store = SqliteBackend::open(dir.path()).unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"v");
    }
}
