//! Read-only connection pool for status and debug queries
//!
//! The collector core is the only writer. Readers go through this pool so
//! they never contend with the writer's connection and, with WAL journaling,
//! only ever observe committed transactions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tokio::task;
use tracing::debug;

use crate::errors::{IndexError, Result};

#[derive(Clone)]
pub struct ReadPool {
    pool: Pool<SqliteConnectionManager>,
}

impl ReadPool {
    /// Create a pool over an existing database file with default settings
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().path(path).build()
    }

    pub fn builder() -> DatabasePoolBuilder {
        DatabasePoolBuilder::new()
    }

    /// Run a read query on a pooled connection off the async executor
    pub async fn read<F, R, E>(&self, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&Connection) -> std::result::Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<IndexError> + Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| IndexError::Pool(format!("Failed to get connection: {}", e)))?;
            f(&conn)
        })
        .await
        .map_err(|e| IndexError::Pool(format!("Task join error: {}", e)))?
    }

    /// Total and idle connections
    pub fn pool_stats(&self) -> (u32, u32) {
        let state = self.pool.state();
        (state.connections, state.idle_connections)
    }
}

pub struct DatabasePoolBuilder {
    path: Option<PathBuf>,
    max_size: u32,
    connection_timeout: Duration,
}

impl DatabasePoolBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            max_size: 4,
            connection_timeout: Duration::from_secs(30),
        }
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Build the pool; the database must already have been created by the writer
    pub fn build(self) -> Result<ReadPool> {
        let path = self.path.ok_or_else(|| {
            IndexError::Pool("Path is required for the read pool".to_string())
        })?;

        let manager = SqliteConnectionManager::file(&path)
            .with_init(|conn| conn.execute_batch("PRAGMA query_only = ON;"));

        let pool = Pool::builder()
            .max_size(self.max_size)
            .connection_timeout(self.connection_timeout)
            .build(manager)
            .map_err(|e| IndexError::Pool(format!("Pool creation failed: {}", e)))?;

        debug!("Read pool ready for {}", path.display());
        Ok(ReadPool { pool })
    }
}

impl Default for DatabasePoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::ids::Sid;
    use crate::stores::{self, StoreMultiplicity};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_reader_sees_only_committed_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("collector.db");
        let mut db = Database::open(&path).unwrap();
        db.add_store(Sid::generate(), StoreMultiplicity::Single).unwrap();

        let pool = ReadPool::new(&path).unwrap();

        let tx = db.begin_transaction().unwrap();
        stores::add_store(&tx, Sid::generate(), StoreMultiplicity::Multi).unwrap();

        let during = pool
            .read(|conn| stores::list_stores(conn))
            .await
            .unwrap();
        assert_eq!(during.len(), 1);

        tx.commit().unwrap();

        let after = pool
            .read(|conn| stores::list_stores(conn))
            .await
            .unwrap();
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn test_reader_cannot_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("collector.db");
        let _writer = Database::open(&path).unwrap();

        let pool = ReadPool::new(&path).unwrap();
        let result = pool
            .read(|conn| -> Result<()> {
                conn.execute("DELETE FROM stores", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_requires_path() {
        assert!(ReadPool::builder().max_size(2).build().is_err());
    }
}
