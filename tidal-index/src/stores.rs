//! Store registry
//!
//! Maps global store ids to the local [`SIndex`] handles every other table is
//! keyed by, and records whether a store is still within sync scope.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{IndexError, Result};
use crate::ids::{SIndex, Sid};

/// Sharing topology of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreMultiplicity {
    /// Only the devices of a single user replicate this store
    Single,
    /// Shared between several users
    Multi,
}

impl StoreMultiplicity {
    fn as_i64(self) -> i64 {
        match self {
            StoreMultiplicity::Single => 0,
            StoreMultiplicity::Multi => 1,
        }
    }

    fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(StoreMultiplicity::Single),
            1 => Some(StoreMultiplicity::Multi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord {
    pub sidx: SIndex,
    pub sid: Sid,
    pub multiplicity: StoreMultiplicity,
    pub expelled: bool,
}

/// Register a store and initialise its collector counter
pub fn add_store(tx: &Transaction<'_>, sid: Sid, multiplicity: StoreMultiplicity) -> Result<SIndex> {
    if store_index(tx, sid)?.is_some() {
        return Err(IndexError::DuplicateStore(sid));
    }

    let next: u32 = tx.query_row("SELECT COALESCE(MAX(sidx), 0) + 1 FROM stores", [], |row| {
        row.get(0)
    })?;
    let sidx = SIndex(next);

    tx.execute(
        "INSERT INTO stores (sidx, sid, multiplicity, expelled) VALUES (?1, ?2, ?3, 0)",
        params![sidx, sid, multiplicity.as_i64()],
    )?;
    tx.execute(
        "INSERT INTO collector_counters (sidx, next_cs) VALUES (?1, 1)",
        params![sidx],
    )?;

    info!(%sidx, %sid, ?multiplicity, "Registered store");
    Ok(sidx)
}

pub fn store_index(conn: &Connection, sid: Sid) -> Result<Option<SIndex>> {
    Ok(conn
        .query_row(
            "SELECT sidx FROM stores WHERE sid = ?1",
            params![sid],
            |row| row.get(0),
        )
        .optional()?)
}

/// Look up a store, failing with [`IndexError::UnknownStore`] if absent
pub fn store(conn: &Connection, sidx: SIndex) -> Result<StoreRecord> {
    let row = conn
        .query_row(
            "SELECT sid, multiplicity, expelled FROM stores WHERE sidx = ?1",
            params![sidx],
            |row| {
                Ok((
                    row.get::<_, Sid>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            },
        )
        .optional()?;

    let (sid, multiplicity, expelled) = row.ok_or(IndexError::UnknownStore(sidx))?;
    let multiplicity =
        StoreMultiplicity::from_i64(multiplicity).ok_or_else(|| IndexError::CorruptRow {
            table: "stores",
            detail: format!("multiplicity {} for {}", multiplicity, sidx),
        })?;

    Ok(StoreRecord {
        sidx,
        sid,
        multiplicity,
        expelled,
    })
}

pub fn list_stores(conn: &Connection) -> Result<Vec<SIndex>> {
    let mut stmt = conn.prepare("SELECT sidx FROM stores ORDER BY sidx")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
}

pub fn is_store_expelled(conn: &Connection, sidx: SIndex) -> Result<bool> {
    Ok(store(conn, sidx)?.expelled)
}

/// Take a store out of sync scope; its queued work becomes irrelevant
pub fn set_store_expelled(tx: &Transaction<'_>, sidx: SIndex, expelled: bool) -> Result<()> {
    let changed = tx.execute(
        "UPDATE stores SET expelled = ?2 WHERE sidx = ?1",
        params![sidx, expelled],
    )?;
    if changed == 0 {
        return Err(IndexError::UnknownStore(sidx));
    }
    info!(%sidx, expelled, "Store scope changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn test_store_registration() {
        let mut db = Database::open_in_memory().unwrap();
        let sid = Sid::generate();

        let tx = db.begin_transaction().unwrap();
        let sidx = add_store(&tx, sid, StoreMultiplicity::Multi).unwrap();
        tx.commit().unwrap();

        let record = store(db.connection(), sidx).unwrap();
        assert_eq!(record.sid, sid);
        assert_eq!(record.multiplicity, StoreMultiplicity::Multi);
        assert!(!record.expelled);
        assert_eq!(store_index(db.connection(), sid).unwrap(), Some(sidx));
    }

    #[test]
    fn test_duplicate_store_is_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        let sid = Sid::generate();

        let tx = db.begin_transaction().unwrap();
        add_store(&tx, sid, StoreMultiplicity::Single).unwrap();
        let result = add_store(&tx, sid, StoreMultiplicity::Single);
        assert!(matches!(result, Err(IndexError::DuplicateStore(_))));
    }

    #[test]
    fn test_unknown_store() {
        let db = Database::open_in_memory().unwrap();
        let result = store(db.connection(), SIndex(7));
        assert!(matches!(result, Err(IndexError::UnknownStore(SIndex(7)))));
    }

    #[test]
    fn test_expel_store() {
        let mut db = Database::open_in_memory().unwrap();
        let sidx = db
            .add_store(Sid::generate(), StoreMultiplicity::Single)
            .unwrap();

        let tx = db.begin_transaction().unwrap();
        set_store_expelled(&tx, sidx, true).unwrap();
        tx.commit().unwrap();

        assert!(is_store_expelled(db.connection(), sidx).unwrap());
    }
}
