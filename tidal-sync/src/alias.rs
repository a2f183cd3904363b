//! Persistent alias map
//!
//! When two devices independently create the same logical object, one of the
//! two identities is superseded by the other. Chains are collapsed on
//! insertion so every stored mapping points directly at a final target.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use tidal_index::{Oid, SIndex};

use crate::errors::{Result, SyncError};

/// Upper bound on lookups while dereferencing; collapsed chains need one
const MAX_ALIAS_HOPS: usize = 32;

pub struct AliasMap;

impl AliasMap {
    /// Record that `alias` is superseded by `target` and return the final target
    ///
    /// Every existing alias that pointed at `alias` is redirected to the final
    /// target in the same transaction. Re-adding an identical mapping is a
    /// no-op; remapping an alias to a different final target is refused.
    pub fn add(tx: &Transaction<'_>, sidx: SIndex, alias: Oid, target: Oid) -> Result<Oid> {
        let resolved = Self::dereference(tx, sidx, target)?;
        if resolved == alias {
            return Err(SyncError::AliasCycle {
                sidx,
                alias,
                target,
            });
        }

        if let Some(existing) = Self::target_of(tx, sidx, alias)? {
            let existing = Self::dereference(tx, sidx, existing)?;
            if existing == resolved {
                return Ok(resolved);
            }
            return Err(SyncError::AliasRedirect {
                sidx,
                alias,
                existing,
                requested: resolved,
            });
        }

        tx.execute(
            "INSERT INTO aliases (sidx, alias_oid, target_oid) VALUES (?1, ?2, ?3)",
            params![sidx, alias, resolved],
        )?;
        let redirected = tx.execute(
            "UPDATE aliases SET target_oid = ?3 WHERE sidx = ?1 AND target_oid = ?2",
            params![sidx, alias, resolved],
        )?;

        info!(%sidx, %alias, target = %resolved, redirected, "Added alias");
        Ok(resolved)
    }

    /// Final target of `oid`, or `oid` itself if it is not aliased
    pub fn dereference(conn: &Connection, sidx: SIndex, oid: Oid) -> Result<Oid> {
        let mut current = oid;
        for _ in 0..MAX_ALIAS_HOPS {
            match Self::target_of(conn, sidx, current)? {
                Some(next) if next == oid => {
                    return Err(SyncError::AliasCycle {
                        sidx,
                        alias: oid,
                        target: current,
                    })
                }
                Some(next) => current = next,
                None => {
                    if current != oid {
                        debug!(%sidx, alias = %oid, target = %current, "Dereferenced alias");
                    }
                    return Ok(current);
                }
            }
        }

        Err(SyncError::AliasCycle {
            sidx,
            alias: oid,
            target: current,
        })
    }

    pub fn is_aliased(conn: &Connection, sidx: SIndex, oid: Oid) -> Result<bool> {
        Ok(Self::target_of(conn, sidx, oid)?.is_some())
    }

    /// Direct mapping of `alias`, without following chains
    pub fn target_of(conn: &Connection, sidx: SIndex, alias: Oid) -> Result<Option<Oid>> {
        Ok(conn
            .prepare_cached("SELECT target_oid FROM aliases WHERE sidx = ?1 AND alias_oid = ?2")?
            .query_row(params![sidx, alias], |row| row.get(0))
            .optional()?)
    }

    /// Every identity that resolves to `target`
    pub fn aliases_of(conn: &Connection, sidx: SIndex, target: Oid) -> Result<Vec<Oid>> {
        let mut stmt = conn.prepare_cached(
            "SELECT alias_oid FROM aliases WHERE sidx = ?1 AND target_oid = ?2 ORDER BY alias_oid",
        )?;
        let rows = stmt.query_map(params![sidx, target], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<Oid>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_index::{Database, Sid, StoreMultiplicity};

    fn setup() -> (Database, SIndex) {
        let mut db = Database::open_in_memory().unwrap();
        let sidx = db
            .add_store(Sid::generate(), StoreMultiplicity::Single)
            .unwrap();
        (db, sidx)
    }

    fn oid(n: u8) -> Oid {
        Oid::from_bytes([n; 16])
    }

    #[test]
    fn test_unaliased_dereferences_to_itself() {
        let (db, sidx) = setup();
        assert_eq!(AliasMap::dereference(db.connection(), sidx, oid(1)).unwrap(), oid(1));
        assert!(!AliasMap::is_aliased(db.connection(), sidx, oid(1)).unwrap());
    }

    #[test]
    fn test_transitive_chain_collapses() {
        let (mut db, sidx) = setup();
        let (a, b, c) = (oid(1), oid(2), oid(3));

        let tx = db.begin_transaction().unwrap();
        AliasMap::add(&tx, sidx, a, b).unwrap();
        AliasMap::add(&tx, sidx, b, c).unwrap();
        tx.commit().unwrap();

        let conn = db.connection();
        assert_eq!(AliasMap::dereference(conn, sidx, a).unwrap(), c);
        assert_eq!(AliasMap::dereference(conn, sidx, b).unwrap(), c);
        assert_eq!(AliasMap::target_of(conn, sidx, a).unwrap(), Some(c));
        assert_eq!(AliasMap::aliases_of(conn, sidx, c).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_alias_onto_aliased_target_points_at_final() {
        let (mut db, sidx) = setup();
        let (a, b, c) = (oid(1), oid(2), oid(3));

        let tx = db.begin_transaction().unwrap();
        AliasMap::add(&tx, sidx, b, c).unwrap();
        assert_eq!(AliasMap::add(&tx, sidx, a, b).unwrap(), c);
        assert_eq!(AliasMap::target_of(&tx, sidx, a).unwrap(), Some(c));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let (mut db, sidx) = setup();
        let (a, b, c) = (oid(1), oid(2), oid(3));

        let tx = db.begin_transaction().unwrap();
        AliasMap::add(&tx, sidx, a, b).unwrap();
        AliasMap::add(&tx, sidx, b, c).unwrap();

        let err = AliasMap::add(&tx, sidx, c, a).unwrap_err();
        assert!(matches!(err, SyncError::AliasCycle { .. }));
        assert!(err.is_invariant_violation());

        assert!(matches!(
            AliasMap::add(&tx, sidx, a, a),
            Err(SyncError::AliasCycle { .. })
        ));

        // the map is untouched by the rejected insertions
        assert_eq!(AliasMap::dereference(&tx, sidx, a).unwrap(), c);
        assert!(!AliasMap::is_aliased(&tx, sidx, c).unwrap());
    }

    #[test]
    fn test_redirect_is_rejected_but_repeat_is_noop() {
        let (mut db, sidx) = setup();
        let tx = db.begin_transaction().unwrap();
        AliasMap::add(&tx, sidx, oid(1), oid(2)).unwrap();

        assert_eq!(AliasMap::add(&tx, sidx, oid(1), oid(2)).unwrap(), oid(2));
        assert!(matches!(
            AliasMap::add(&tx, sidx, oid(1), oid(9)),
            Err(SyncError::AliasRedirect { .. })
        ));
    }

    #[test]
    fn test_aliases_are_store_scoped() {
        let (mut db, sidx) = setup();
        let other = db
            .add_store(Sid::generate(), StoreMultiplicity::Multi)
            .unwrap();

        let tx = db.begin_transaction().unwrap();
        AliasMap::add(&tx, sidx, oid(4), oid(3)).unwrap();
        tx.commit().unwrap();

        assert!(AliasMap::is_aliased(db.connection(), sidx, oid(4)).unwrap());
        assert!(!AliasMap::is_aliased(db.connection(), other, oid(4)).unwrap());
    }
}
