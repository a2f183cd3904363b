//! Error types for collection

use thiserror::Error;

use tidal_index::{IndexError, Oid, SIndex, Socid};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Alias cycle: {alias} -> {target} in {sidx}")]
    AliasCycle { sidx: SIndex, alias: Oid, target: Oid },

    #[error("Alias {alias} in {sidx} already points at {existing}, refusing {requested}")]
    AliasRedirect {
        sidx: SIndex,
        alias: Oid,
        existing: Oid,
        requested: Oid,
    },

    #[error("Dependency walk from {socid} exceeded max depth {max_depth}")]
    DependencyDepthExceeded { socid: Socid, max_depth: usize },

    #[error("Collector entry {socid} references an unknown store")]
    OrphanEntry { socid: Socid },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Conflict resolution failed for {socid}: {reason}")]
    ConflictResolution { socid: Socid, reason: String },
}

impl SyncError {
    /// Corruption-class defects that must abort the unit of work loudly
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            SyncError::AliasCycle { .. }
                | SyncError::AliasRedirect { .. }
                | SyncError::DependencyDepthExceeded { .. }
                | SyncError::OrphanEntry { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Outcome of a failed fetch as reported by the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Object not found at peer")]
    NotFound,

    #[error("Peer unreachable")]
    Unreachable,

    #[error("Fetch timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_index::Cid;

    #[test]
    fn test_invariant_classification() {
        let sidx = SIndex(1);
        let cycle = SyncError::AliasCycle {
            sidx,
            alias: Oid::generate(),
            target: Oid::generate(),
        };
        assert!(cycle.is_invariant_violation());

        let depth = SyncError::DependencyDepthExceeded {
            socid: Socid::new(sidx, Oid::generate(), Cid::Meta),
            max_depth: 4,
        };
        assert!(depth.is_invariant_violation());

        assert!(!SyncError::Storage("disk full".to_string()).is_invariant_violation());
    }
}
