//! Storage engine.
//!
//! One SQLite database holds the memory index, the transcript index, and
//! the externally managed messages table. WAL mode and a generous busy
//! timeout absorb contention between the two indexer writers.

mod migrations;
pub mod memory;
pub mod transcript;

pub use migrations::SCHEMA_VERSION;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::error::Result;
use migrations::run_migrations;

/// Storage handle wrapping a single pooled connection
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a database at `path` and migrate it to the current
    /// schema version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for tests)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        configure_pragmas(&conn)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a function with the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function inside a transaction.
    ///
    /// Any error rolls the whole transaction back; readers observe either
    /// the state before or the state after, never a mixture.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

fn configure_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        PRAGMA temp_store=MEMORY;
        PRAGMA foreign_keys=ON;
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_migrates() {
        let store = Store::open_in_memory().unwrap();
        let version: String = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT value FROM schema_meta WHERE key = 'schema_version'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_open_on_disk_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keeper.sqlite");
        let store = Store::open(&path).unwrap();
        store.with_conn(|_| Ok(())).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_with_tx_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();

        let result: Result<()> = store.with_tx(|conn| {
            conn.execute(
                "INSERT INTO memory_meta (key, value) VALUES ('probe', '1')",
                [],
            )?;
            Err(crate::error::KeeperError::Internal("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM memory_meta WHERE key = 'probe'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
