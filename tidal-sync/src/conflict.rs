//! Conflict resolution for concurrent versions

use std::cmp::Ordering;

use rusqlite::Transaction;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::collaborators::{ConflictContext, ConflictResolver};
use crate::errors::Result;
use crate::version_vector::VersionVector;

/// What a resolver decided for a conflicting component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Keep our payload; the local device re-stamps it so it wins everywhere
    KeepLocal,
    /// Replace our payload with the fetched one
    TakeRemote,
    /// The resolver preserved both sides itself, e.g. as a renamed branch
    Branched,
}

/// Deterministic choice between two concurrent vectors
///
/// Must give mirrored answers on both devices for the same pair, otherwise
/// replicas settle on different payloads under equal vectors.
pub trait TieBreakPolicy: Send + Sync {
    fn prefer_remote(&self, local: &VersionVector, remote: &VersionVector) -> bool;
}

/// Highest aggregate tick wins, then the side ahead on the greatest differing DID
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestTickTieBreak;

impl HighestTickTieBreak {
    fn order(a: &VersionVector, b: &VersionVector) -> Ordering {
        a.total_ticks().cmp(&b.total_ticks()).then_with(|| {
            let differing = a
                .iter()
                .chain(b.iter())
                .map(|(did, _)| *did)
                .filter(|did| a.get(did) != b.get(did))
                .max();
            match differing {
                Some(did) => a.get(&did).cmp(&b.get(&did)),
                None => Ordering::Equal,
            }
        })
    }
}

impl TieBreakPolicy for HighestTickTieBreak {
    fn prefer_remote(&self, local: &VersionVector, remote: &VersionVector) -> bool {
        Self::order(remote, local) == Ordering::Greater
    }
}

/// Resolver that keeps whichever side the tie-break policy favours
pub struct TieBreakResolver<P = HighestTickTieBreak> {
    policy: P,
}

impl<P: TieBreakPolicy> TieBreakResolver<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }
}

impl Default for TieBreakResolver<HighestTickTieBreak> {
    fn default() -> Self {
        Self::new(HighestTickTieBreak)
    }
}

impl<P: TieBreakPolicy> ConflictResolver for TieBreakResolver<P> {
    fn resolve(&self, _tx: &Transaction<'_>, conflict: &ConflictContext<'_>) -> Result<Resolution> {
        let resolution = if self
            .policy
            .prefer_remote(conflict.local_vector, conflict.remote_vector)
        {
            Resolution::TakeRemote
        } else {
            Resolution::KeepLocal
        };

        info!(
            socid = %conflict.socid,
            local = %conflict.local_vector,
            remote = %conflict.remote_vector,
            ?resolution,
            "Resolved concurrent update"
        );
        Ok(resolution)
    }
}
