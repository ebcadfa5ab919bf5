//! Key-value persistence for client state that must survive restarts

use dashmap::DashMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const TOKEN_KEY: &str = "token";
pub const USERNAME_KEY: &str = "username";

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS client_state (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);";

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Writes `set` and deletes `remove` as one unit.
    fn apply(&self, set: &[(&str, &str)], remove: &[&str]) -> anyhow::Result<()>;
}

/// SQLite-backed store, one row per key.
pub struct SqliteKvStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteKvStore {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening session store at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(2)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        {
            let conn = pool.get()?;
            conn.execute_batch(SCHEMA_SQL)?;
            conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    /// A private in-memory database; a single pooled connection keeps it alive.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(SCHEMA_SQL)?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM client_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn apply(&self, set: &[(&str, &str)], remove: &[&str]) -> anyhow::Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        for (key, value) in set {
            tx.execute(
                "INSERT INTO client_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        for key in remove {
            tx.execute("DELETE FROM client_state WHERE key = ?1", params![key])?;
        }
        tx.commit()?;
        debug!("Session store: wrote {} key(s), removed {}", set.len(), remove.len());
        Ok(())
    }
}

/// Non-persistent store for tests and throwaway sessions.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    store: Arc<DashMap<String, String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.store.get(key).map(|v| v.value().clone()))
    }

    fn apply(&self, set: &[(&str, &str)], remove: &[&str]) -> anyhow::Result<()> {
        for (key, value) in set {
            self.store.insert(key.to_string(), value.to_string());
        }
        for key in remove {
            self.store.remove(*key);
        }
        Ok(())
    }
}
