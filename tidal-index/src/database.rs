use std::path::{Path, PathBuf};

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::errors::Result;
use crate::ids::{SIndex, Sid};
use crate::migrations::run_migrations;
use crate::schema::PRAGMAS;
use crate::stores::{self, StoreMultiplicity};

/// Single-writer handle on the collector database
///
/// Exactly one connection is used for all mutations, so only one transaction
/// can be open at a time: [`Database::begin_transaction`] borrows the handle
/// mutably until the transaction is committed or dropped.
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut conn = Connection::open(&path)?;
        conn.execute_batch(PRAGMAS)?;
        run_migrations(&mut conn)?;

        info!("Opened collector database at {}", path.display());
        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        run_migrations(&mut conn)?;

        debug!("Opened in-memory collector database");
        Ok(Self { conn, path: None })
    }

    /// Path of the backing file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Begin the transaction that all co-occurring mutations must share
    pub fn begin_transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    /// Read access outside of any transaction
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Register a store in its own transaction
    pub fn add_store(&mut self, sid: Sid, multiplicity: StoreMultiplicity) -> Result<SIndex> {
        let tx = self.begin_transaction()?;
        let sidx = stores::add_store(&tx, sid, multiplicity)?;
        tx.commit()?;
        Ok(sidx)
    }
}
