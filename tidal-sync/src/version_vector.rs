//! Version vectors and their persistence
//!
//! A [`VersionVector`] maps devices to the highest tick of theirs that a
//! replica has incorporated for one SOCID. The [`VersionStore`] keeps two kinds
//! of vectors in the database:
//!
//! - the local vector, describing what this replica holds, and
//! - per-peer announcements, describing what each peer claims to hold.
//!
//! The union of both is the device's knowledge for that SOCID. Every write is
//! a pointwise max, so stored vectors never move backwards.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use tidal_index::{Did, Socid, Tick};

use crate::errors::Result;

/// Causal relationship between two vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrdering {
    Equal,
    Dominates,
    DominatedBy,
    Concurrent,
}

/// Result of merging a remote vector into a local one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    /// Remote was strictly newer and compatible
    Applied,
    /// Remote added nothing
    NoOp,
    /// Neither side dominates; conflict resolution must run
    Conflicting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    ticks: BTreeMap<Did, Tick>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tick for a device, zero if the device never contributed
    pub fn get(&self, did: &Did) -> Tick {
        self.ticks.get(did).copied().unwrap_or(Tick::ZERO)
    }

    /// Raise a device's tick; lower values are ignored
    pub fn observe(&mut self, did: Did, tick: Tick) {
        if tick == Tick::ZERO {
            return;
        }
        let entry = self.ticks.entry(did).or_insert(Tick::ZERO);
        if tick > *entry {
            *entry = tick;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Did, &Tick)> {
        self.ticks.iter()
    }

    /// Sum of all ticks, used by tie-break policies
    pub fn total_ticks(&self) -> u128 {
        self.ticks.values().map(|t| u128::from(t.0)).sum()
    }

    pub fn compare(&self, other: &VersionVector) -> VectorOrdering {
        let mut greater = false;
        let mut less = false;

        for did in self.ticks.keys().chain(other.ticks.keys()) {
            match self.get(did).cmp(&other.get(did)) {
                Ordering::Greater => greater = true,
                Ordering::Less => less = true,
                Ordering::Equal => {}
            }
            if greater && less {
                return VectorOrdering::Concurrent;
            }
        }

        match (greater, less) {
            (false, false) => VectorOrdering::Equal,
            (true, false) => VectorOrdering::Dominates,
            (false, true) => VectorOrdering::DominatedBy,
            (true, true) => VectorOrdering::Concurrent,
        }
    }

    /// Strict domination: at least as new everywhere, newer somewhere
    pub fn dominates(&self, other: &VersionVector) -> bool {
        self.compare(other) == VectorOrdering::Dominates
    }

    /// True if `self` adds nothing over `other`
    pub fn is_covered_by(&self, other: &VersionVector) -> bool {
        matches!(
            self.compare(other),
            VectorOrdering::Equal | VectorOrdering::DominatedBy
        )
    }

    pub fn union(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.clone();
        for (did, tick) in other.iter() {
            merged.observe(*did, *tick);
        }
        merged
    }

    /// Fold `remote` in with a pointwise max and classify what happened
    pub fn merge(&mut self, remote: &VersionVector) -> MergeOutcome {
        let outcome = match self.compare(remote) {
            VectorOrdering::Equal | VectorOrdering::Dominates => MergeOutcome::NoOp,
            VectorOrdering::DominatedBy => MergeOutcome::Applied,
            VectorOrdering::Concurrent => MergeOutcome::Conflicting,
        };

        if outcome != MergeOutcome::NoOp {
            for (did, tick) in remote.iter() {
                self.observe(*did, *tick);
            }
        }
        outcome
    }
}

impl FromIterator<(Did, Tick)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (Did, Tick)>>(iter: I) -> Self {
        let mut vector = VersionVector::new();
        for (did, tick) in iter {
            vector.observe(did, tick);
        }
        vector
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (did, tick)) in self.ticks.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", did, tick)?;
        }
        write!(f, "}}")
    }
}

/// Database access to local vectors, device tick counters and announcements
pub struct VersionStore;

impl VersionStore {
    /// Local vector for a SOCID, empty if nothing is held
    pub fn local(conn: &Connection, socid: Socid) -> Result<VersionVector> {
        let mut stmt = conn.prepare_cached(
            "SELECT did, tick FROM versions WHERE sidx = ?1 AND oid = ?2 AND cid = ?3",
        )?;
        let rows = stmt.query_map(params![socid.sidx, socid.oid, socid.cid], |row| {
            Ok((row.get::<_, Did>(0)?, row.get::<_, Tick>(1)?))
        })?;

        let mut vector = VersionVector::new();
        for row in rows {
            let (did, tick) = row?;
            vector.observe(did, tick);
        }
        Ok(vector)
    }

    /// Raise the stored local vector to at least `vector`
    fn raise_local(tx: &Transaction<'_>, socid: Socid, vector: &VersionVector) -> Result<()> {
        let mut stmt = tx.prepare_cached(
            r#"
            INSERT INTO versions (sidx, oid, cid, did, tick)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(sidx, oid, cid, did) DO UPDATE SET
                tick = MAX(tick, excluded.tick)
            "#,
        )?;
        for (did, tick) in vector.iter() {
            stmt.execute(params![socid.sidx, socid.oid, socid.cid, did, tick])?;
        }
        Ok(())
    }

    /// Record a local mutation of `socid` by `device`
    ///
    /// Must run in the same transaction as the mutation itself.
    pub fn advance(tx: &Transaction<'_>, device: Did, socid: Socid) -> Result<Tick> {
        let counter: Option<Tick> = tx
            .query_row(
                "SELECT tick FROM device_ticks WHERE did = ?1",
                params![device],
                |row| row.get(0),
            )
            .optional()?;

        let current = Self::local(tx, socid)?.get(&device);
        let tick = counter.unwrap_or(Tick::ZERO).max(current).next();

        tx.execute(
            r#"
            INSERT INTO device_ticks (did, tick) VALUES (?1, ?2)
            ON CONFLICT(did) DO UPDATE SET tick = excluded.tick
            "#,
            params![device, tick],
        )?;

        let mut bump = VersionVector::new();
        bump.observe(device, tick);
        Self::raise_local(tx, socid, &bump)?;

        trace!(%socid, %device, %tick, "Advanced local version");
        Ok(tick)
    }

    /// Merge a remote vector into the local one
    pub fn merge(tx: &Transaction<'_>, socid: Socid, remote: &VersionVector) -> Result<MergeOutcome> {
        let mut local = Self::local(tx, socid)?;
        let outcome = local.merge(remote);
        if outcome != MergeOutcome::NoOp {
            Self::raise_local(tx, socid, &local)?;
        }
        debug!(%socid, ?outcome, %remote, "Merged remote version");
        Ok(outcome)
    }

    /// Remember what `peer` claims to hold for `socid`
    pub fn record_announcement(
        tx: &Transaction<'_>,
        peer: Did,
        socid: Socid,
        vector: &VersionVector,
    ) -> Result<()> {
        let mut stmt = tx.prepare_cached(
            r#"
            INSERT INTO announcements (sidx, oid, cid, peer, did, tick)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(sidx, oid, cid, peer, did) DO UPDATE SET
                tick = MAX(tick, excluded.tick)
            "#,
        )?;
        for (did, tick) in vector.iter() {
            stmt.execute(params![socid.sidx, socid.oid, socid.cid, peer, did, tick])?;
        }
        Ok(())
    }

    /// Every peer's announced vector for `socid`, ordered by peer
    pub fn announcements(conn: &Connection, socid: Socid) -> Result<Vec<(Did, VersionVector)>> {
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT peer, did, tick FROM announcements
            WHERE sidx = ?1 AND oid = ?2 AND cid = ?3
            ORDER BY peer
            "#,
        )?;
        let rows = stmt.query_map(params![socid.sidx, socid.oid, socid.cid], |row| {
            Ok((
                row.get::<_, Did>(0)?,
                row.get::<_, Did>(1)?,
                row.get::<_, Tick>(2)?,
            ))
        })?;

        let mut by_peer: BTreeMap<Did, VersionVector> = BTreeMap::new();
        for row in rows {
            let (peer, did, tick) = row?;
            by_peer.entry(peer).or_default().observe(did, tick);
        }
        Ok(by_peer.into_iter().collect())
    }

    /// Union of the local vector and everything peers announced
    pub fn knowledge(conn: &Connection, socid: Socid) -> Result<VersionVector> {
        let mut knowledge = Self::local(conn, socid)?;
        for (_, announced) in Self::announcements(conn, socid)? {
            knowledge = knowledge.union(&announced);
        }
        Ok(knowledge)
    }

    /// Peers holding something the local replica lacks
    pub fn candidates(conn: &Connection, socid: Socid) -> Result<Vec<(Did, VersionVector)>> {
        let local = Self::local(conn, socid)?;
        Ok(Self::announcements(conn, socid)?
            .into_iter()
            .filter(|(_, announced)| !announced.is_covered_by(&local))
            .collect())
    }

    /// True if any peer announced a version the local replica has not incorporated
    pub fn is_stale(conn: &Connection, socid: Socid) -> Result<bool> {
        Ok(!Self::candidates(conn, socid)?.is_empty())
    }
}
