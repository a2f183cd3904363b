//! Persistent collector queue
//!
//! Every store owns a strictly increasing counter. Enqueuing a SOCID stamps
//! it with the next collector sequence number (CS); re-enqueuing a SOCID that
//! is still pending moves it to the fresh CS instead of adding a second entry.
//! Entries survive restarts and are consumed in CS order by
//! [`CollectorIterator`].

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use tidal_index::{Cid, IndexError, Oid, SIndex, Socid};

use crate::errors::{Result, SyncError};

/// Collector sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cs(pub u64);

impl fmt::Display for Cs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cs{}", self.0)
    }
}

impl ToSql for Cs {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let raw = i64::try_from(self.0)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(raw))
    }
}

impl FromSql for Cs {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_i64()?;
        u64::try_from(raw)
            .map(Cs)
            .map_err(|_| FromSqlError::OutOfRange(raw))
    }
}

/// One pending unit of collection work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectorEntry {
    pub cs: Cs,
    pub socid: Socid,
}

/// Whether a queued entry still needs attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relevance {
    Relevant,
    /// The object was aliased to another identity
    Superseded,
    /// The object or its store left sync scope
    Expelled,
}

/// An entry withdrawn from collection after a structural defect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedEntry {
    pub socid: Socid,
    pub reason: String,
    pub parked_at: DateTime<Utc>,
}

pub struct CollectorSequence;

impl CollectorSequence {
    /// Stamp `socid` with the next CS of its store
    ///
    /// Runs inside the caller's transaction so the queue commits together
    /// with whatever mutation made the object worth collecting.
    pub fn enqueue(tx: &Transaction<'_>, socid: Socid) -> Result<Cs> {
        let next: Option<Cs> = tx
            .query_row(
                "SELECT next_cs FROM collector_counters WHERE sidx = ?1",
                params![socid.sidx],
                |row| row.get(0),
            )
            .optional()?;
        let cs = next.ok_or(IndexError::UnknownStore(socid.sidx))?;

        tx.execute(
            "UPDATE collector_counters SET next_cs = ?2 WHERE sidx = ?1",
            params![socid.sidx, Cs(cs.0 + 1)],
        )?;
        tx.execute(
            r#"
            INSERT INTO collector_queue (sidx, cs, oid, cid, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(sidx, oid, cid) DO UPDATE SET cs = excluded.cs
            "#,
            params![socid.sidx, cs, socid.oid, socid.cid, Utc::now().to_rfc3339()],
        )?;

        trace!(%socid, %cs, "Enqueued for collection");
        Ok(cs)
    }

    /// Remove the entry stamped `cs`
    ///
    /// Returns false if the entry was re-enqueued under a newer CS in the
    /// meantime, in which case the newer entry stays pending.
    pub fn dequeue(tx: &Transaction<'_>, sidx: SIndex, cs: Cs) -> Result<bool> {
        let removed = tx.execute(
            "DELETE FROM collector_queue WHERE sidx = ?1 AND cs = ?2",
            params![sidx, cs],
        )?;
        Ok(removed > 0)
    }

    /// Current CS of a pending SOCID
    pub fn cs_of(conn: &Connection, socid: Socid) -> Result<Option<Cs>> {
        Ok(conn
            .query_row(
                "SELECT cs FROM collector_queue WHERE sidx = ?1 AND oid = ?2 AND cid = ?3",
                params![socid.sidx, socid.oid, socid.cid],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// First entry with a CS strictly greater than `after`
    pub fn first_after(conn: &Connection, sidx: SIndex, after: Option<Cs>) -> Result<Option<CollectorEntry>> {
        let floor = after.map_or(0, |cs| cs.0);
        let row = conn
            .prepare_cached(
                r#"
                SELECT cs, oid, cid FROM collector_queue
                WHERE sidx = ?1 AND cs > ?2
                ORDER BY cs ASC
                LIMIT 1
                "#,
            )?
            .query_row(params![sidx, Cs(floor)], |row| {
                Ok((row.get::<_, Cs>(0)?, row.get::<_, Oid>(1)?, row.get::<_, Cid>(2)?))
            })
            .optional()?;

        Ok(row.map(|(cs, oid, cid)| CollectorEntry {
            cs,
            socid: Socid::new(sidx, oid, cid),
        }))
    }

    pub fn pending_count(conn: &Connection, sidx: SIndex) -> Result<u64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM collector_queue WHERE sidx = ?1",
            params![sidx],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// When the longest-waiting pending entry was first enqueued
    pub fn oldest_enqueued_at(conn: &Connection, sidx: SIndex) -> Result<Option<DateTime<Utc>>> {
        let oldest: Option<String> = conn.query_row(
            "SELECT MIN(enqueued_at) FROM collector_queue WHERE sidx = ?1",
            params![sidx],
            |row| row.get(0),
        )?;
        oldest.map(|s| parse_timestamp("collector_queue", &s)).transpose()
    }

    /// Withdraw an entry from collection pending administrative recovery
    pub fn park(tx: &Transaction<'_>, socid: Socid, reason: &str) -> Result<()> {
        tx.execute(
            "DELETE FROM collector_queue WHERE sidx = ?1 AND oid = ?2 AND cid = ?3",
            params![socid.sidx, socid.oid, socid.cid],
        )?;
        tx.execute(
            r#"
            INSERT INTO parked_entries (sidx, oid, cid, reason, parked_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(sidx, oid, cid) DO UPDATE SET
                reason = excluded.reason,
                parked_at = excluded.parked_at
            "#,
            params![socid.sidx, socid.oid, socid.cid, reason, Utc::now().to_rfc3339()],
        )?;

        error!(%socid, reason, "Parked collector entry after consistency defect");
        Ok(())
    }

    pub fn is_parked(conn: &Connection, socid: Socid) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM parked_entries WHERE sidx = ?1 AND oid = ?2 AND cid = ?3",
            params![socid.sidx, socid.oid, socid.cid],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Return a parked entry to the queue with a fresh CS
    pub fn unpark(tx: &Transaction<'_>, socid: Socid) -> Result<Option<Cs>> {
        let removed = tx.execute(
            "DELETE FROM parked_entries WHERE sidx = ?1 AND oid = ?2 AND cid = ?3",
            params![socid.sidx, socid.oid, socid.cid],
        )?;
        if removed == 0 {
            return Ok(None);
        }

        let cs = Self::enqueue(tx, socid)?;
        debug!(%socid, %cs, "Unparked collector entry");
        Ok(Some(cs))
    }

    pub fn parked(conn: &Connection, sidx: SIndex) -> Result<Vec<ParkedEntry>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT oid, cid, reason, parked_at FROM parked_entries
            WHERE sidx = ?1
            ORDER BY parked_at ASC
            "#,
        )?;
        let rows = stmt.query_map(params![sidx], |row| {
            Ok((
                row.get::<_, Oid>(0)?,
                row.get::<_, Cid>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut parked = Vec::new();
        for row in rows {
            let (oid, cid, reason, parked_at) = row?;
            parked.push(ParkedEntry {
                socid: Socid::new(sidx, oid, cid),
                reason,
                parked_at: parse_timestamp("parked_entries", &parked_at)?,
            });
        }
        Ok(parked)
    }
}

fn parse_timestamp(table: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            SyncError::Index(IndexError::CorruptRow {
                table,
                detail: format!("timestamp {:?}: {}", raw, e),
            })
        })
}

/// Walks one store's queue in increasing CS order
///
/// The iterator keeps no database cursor between calls, only the last CS it
/// returned, so it can be driven across many short transactions. Entries the
/// relevance check rejects are deleted inside the caller's transaction and
/// never returned.
#[derive(Debug)]
pub struct CollectorIterator {
    sidx: SIndex,
    last: Option<Cs>,
    closed: bool,
    discarded: u64,
}

impl CollectorIterator {
    pub fn new(sidx: SIndex) -> Self {
        Self {
            sidx,
            last: None,
            closed: false,
            discarded: 0,
        }
    }

    pub fn sidx(&self) -> SIndex {
        self.sidx
    }

    /// Last CS handed out by this run
    pub fn position(&self) -> Option<Cs> {
        self.last
    }

    /// Entries dropped as no longer relevant during this run
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next relevant entry, or `None` once the queue is exhausted
    pub fn next<F>(&mut self, tx: &Transaction<'_>, mut relevance: F) -> Result<Option<CollectorEntry>>
    where
        F: FnMut(&Transaction<'_>, &CollectorEntry) -> Result<Relevance>,
    {
        if self.closed {
            return Ok(None);
        }

        while let Some(entry) = CollectorSequence::first_after(tx, self.sidx, self.last)? {
            self.last = Some(entry.cs);

            match relevance(tx, &entry)? {
                Relevance::Relevant => return Ok(Some(entry)),
                irrelevant => {
                    CollectorSequence::dequeue(tx, self.sidx, entry.cs)?;
                    self.discarded += 1;
                    debug!(socid = %entry.socid, cs = %entry.cs, ?irrelevant, "Dropped collector entry");
                }
            }
        }

        Ok(None)
    }

    /// Release the iterator; further calls to `next` return `None`
    pub fn close(&mut self) {
        self.closed = true;
    }
}
