//! Backlog reporting for the sync-status indicator

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use tidal_index::{ReadPool, SIndex};

use crate::collector_sequence::CollectorSequence;
use crate::errors::{Result, SyncError};

/// Pending collection work for one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogStatus {
    pub store: SIndex,
    pub pending: u64,
    pub parked: u64,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
}

impl BacklogStatus {
    pub fn load(conn: &Connection, store: SIndex) -> Result<Self> {
        Ok(Self {
            store,
            pending: CollectorSequence::pending_count(conn, store)?,
            parked: CollectorSequence::parked(conn, store)?.len() as u64,
            oldest_enqueued_at: CollectorSequence::oldest_enqueued_at(conn, store)?,
        })
    }

    /// How long the oldest pending entry has been waiting
    pub fn oldest_pending_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.oldest_enqueued_at
            .map(|at| now.signed_duration_since(at).max(Duration::zero()))
    }

    pub fn is_idle(&self) -> bool {
        self.pending == 0
    }
}

/// Read a store's backlog through the reader pool
pub async fn backlog(pool: &ReadPool, store: SIndex) -> Result<BacklogStatus> {
    pool.read(move |conn| BacklogStatus::load(conn, store))
        .await
}

/// Backlog of every registered store
pub async fn backlog_all(pool: &ReadPool) -> Result<Vec<BacklogStatus>> {
    pool.read(|conn| {
        tidal_index::stores::list_stores(conn)?
            .into_iter()
            .map(|sidx| BacklogStatus::load(conn, sidx))
            .collect::<std::result::Result<Vec<_>, SyncError>>()
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tidal_index::{Cid, Database, Oid, Sid, Socid, StoreMultiplicity};

    #[tokio::test]
    async fn test_backlog_counts_pending_and_parked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("collector.db");
        let mut db = Database::open(&path).unwrap();
        let sidx = db
            .add_store(Sid::generate(), StoreMultiplicity::Single)
            .unwrap();

        let tx = db.begin_transaction().unwrap();
        for _ in 0..3 {
            CollectorSequence::enqueue(&tx, Socid::new(sidx, Oid::generate(), Cid::Meta)).unwrap();
        }
        let stuck = Socid::new(sidx, Oid::generate(), Cid::Content);
        CollectorSequence::enqueue(&tx, stuck).unwrap();
        CollectorSequence::park(&tx, stuck, "ancestor missing").unwrap();
        tx.commit().unwrap();

        let pool = ReadPool::new(&path).unwrap();
        let status = backlog(&pool, sidx).await.unwrap();
        assert_eq!(status.pending, 3);
        assert_eq!(status.parked, 1);
        assert!(!status.is_idle());

        let age = status.oldest_pending_age(Utc::now()).unwrap();
        assert!(age >= Duration::zero());

        let all = backlog_all(&pool).await.unwrap();
        assert_eq!(all, vec![status]);
    }

    #[test]
    fn test_empty_store_is_idle() {
        let mut db = Database::open_in_memory().unwrap();
        let sidx = db
            .add_store(Sid::generate(), StoreMultiplicity::Multi)
            .unwrap();

        let status = BacklogStatus::load(db.connection(), sidx).unwrap();
        assert!(status.is_idle());
        assert_eq!(status.oldest_pending_age(Utc::now()), None);
    }
}
