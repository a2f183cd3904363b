//! Schema migrations for the collector database
//!
//! Every database, fresh or old, reaches [`SCHEMA_VERSION`] by replaying the
//! registered migrations in order inside one transaction each. A fresh
//! database simply starts at version 0.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::errors::{IndexError, Result};
use crate::schema::{BASE_SCHEMA, PARKED_ENTRIES_SCHEMA, SCHEMA_VERSION, VERSION_TABLE};

/// A single database migration
pub struct Migration {
    pub version: u32,
    pub description: String,
    /// SQL batches applied in order
    pub up: Vec<String>,
    /// SQL batches applied in reverse order on rollback, if supported
    pub down: Option<Vec<String>>,
}

impl Migration {
    pub fn new(
        version: u32,
        description: impl Into<String>,
        up: Vec<String>,
        down: Option<Vec<String>>,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            up,
            down,
        }
    }

    /// Apply this migration and record its version atomically
    pub fn apply(&self, conn: &mut Connection) -> Result<()> {
        info!("Applying migration {}: {}", self.version, self.description);

        let tx = conn.transaction()?;
        for statement in &self.up {
            tx.execute_batch(statement)?;
        }
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![self.version],
        )?;
        tx.commit()?;

        Ok(())
    }

    /// Roll this migration back and forget its version atomically
    pub fn rollback(&self, conn: &mut Connection) -> Result<()> {
        let down = self.down.as_ref().ok_or_else(|| {
            IndexError::Migration(format!(
                "Migration {} does not support rollback",
                self.version
            ))
        })?;

        info!(
            "Rolling back migration {}: {}",
            self.version, self.description
        );

        let tx = conn.transaction()?;
        for statement in down.iter().rev() {
            tx.execute_batch(statement)?;
        }
        tx.execute(
            "DELETE FROM schema_version WHERE version = ?1",
            params![self.version],
        )?;
        tx.commit()?;

        Ok(())
    }
}

/// Ordered set of migrations with a target version
pub struct MigrationManager {
    migrations: BTreeMap<u32, Migration>,
    target_version: u32,
}

impl MigrationManager {
    /// Create a manager preloaded with the collector's migrations
    pub fn new(target_version: u32) -> Self {
        let mut manager = Self::empty(target_version);
        manager.add_migration(Migration::new(
            1,
            "Stores, version vectors, collector queue and aliases",
            vec![BASE_SCHEMA.to_string()],
            None,
        ));
        manager.add_migration(Migration::new(
            2,
            "Parked collector entries",
            vec![PARKED_ENTRIES_SCHEMA.to_string()],
            Some(vec!["DROP TABLE IF EXISTS parked_entries".to_string()]),
        ));
        manager
    }

    /// Create a manager with no registered migrations
    pub fn empty(target_version: u32) -> Self {
        Self {
            migrations: BTreeMap::new(),
            target_version,
        }
    }

    pub fn add_migration(&mut self, migration: Migration) {
        let version = migration.version;
        if self.migrations.insert(version, migration).is_some() {
            warn!("Replacing existing migration for version {}", version);
        }
    }

    /// Highest applied version, 0 for a fresh database
    pub fn current_version(&self, conn: &Connection) -> Result<u32> {
        conn.execute_batch(VERSION_TABLE)?;
        let version = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, Option<u32>>(0)
            })?
            .unwrap_or(0);
        Ok(version)
    }

    pub fn needs_migration(&self, conn: &Connection) -> Result<bool> {
        Ok(self.current_version(conn)? != self.target_version)
    }

    /// Migrate up or down to the target version
    pub fn migrate(&self, conn: &mut Connection) -> Result<()> {
        let current = self.current_version(conn)?;

        if current == self.target_version {
            return Ok(());
        }

        if current > self.target_version {
            self.migrate_down(conn, current, self.target_version)
        } else {
            self.migrate_up(conn, current, self.target_version)
        }
    }

    fn migrate_up(&self, conn: &mut Connection, from: u32, to: u32) -> Result<()> {
        info!("Migrating database from version {} to {}", from, to);

        for version in (from + 1)..=to {
            let migration = self
                .migrations
                .get(&version)
                .ok_or_else(|| IndexError::Migration(format!("Missing migration {}", version)))?;
            migration.apply(conn)?;
        }

        Ok(())
    }

    fn migrate_down(&self, conn: &mut Connection, from: u32, to: u32) -> Result<()> {
        info!("Rolling back database from version {} to {}", from, to);

        for version in ((to + 1)..=from).rev() {
            let migration = self
                .migrations
                .get(&version)
                .ok_or_else(|| IndexError::Migration(format!("Missing migration {}", version)))?;
            migration.rollback(conn)?;
        }

        Ok(())
    }

    pub fn pending_migrations(&self, conn: &Connection) -> Result<Vec<u32>> {
        let current = self.current_version(conn)?;
        Ok(self
            .migrations
            .keys()
            .copied()
            .filter(|&v| v > current && v <= self.target_version)
            .collect())
    }

    /// Versions must start at 1 and have no gaps up to the target
    pub fn validate(&self) -> Result<()> {
        let mut expected = 1;
        for &version in self.migrations.keys() {
            if version != expected {
                return Err(IndexError::Migration(format!(
                    "Migration version gap: expected {}, found {}",
                    expected, version
                )));
            }
            expected += 1;
        }

        if self.target_version > 0 && !self.migrations.contains_key(&self.target_version) {
            return Err(IndexError::Migration(format!(
                "Target version {} not found in migrations",
                self.target_version
            )));
        }

        Ok(())
    }
}

/// Bring a connection's schema to [`SCHEMA_VERSION`]
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let manager = MigrationManager::new(SCHEMA_VERSION);
    manager.validate()?;

    let current = manager.current_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(IndexError::SchemaVersionMismatch {
            expected: SCHEMA_VERSION,
            actual: current,
        });
    }

    if current < SCHEMA_VERSION {
        manager.migrate(conn)?;
    }

    Ok(())
}
