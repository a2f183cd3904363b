//! Contracts the collector needs from the rest of the daemon
//!
//! Transport, directory, storage, conflict resolution and presence are
//! implemented elsewhere; the collector only depends on these traits.

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{Connection, Transaction};

use tidal_index::{Did, Oid, SIndex, Socid, Soid};

use crate::conflict::Resolution;
use crate::errors::{FetchError, Result};
use crate::version_vector::VersionVector;

/// A component as returned by a peer
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedComponent {
    pub payload: Bytes,
    pub version: VersionVector,
}

/// Moves component payloads between devices
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `socid` from `device` at `min_version` or newer
    async fn fetch(
        &self,
        device: Did,
        socid: Socid,
        min_version: VersionVector,
    ) -> std::result::Result<FetchedComponent, FetchError>;
}

/// Read-only view of the local object tree
pub trait DirectoryService: Send + Sync {
    /// Parent of an object as currently known, `None` at the store root
    fn parent_of(&self, soid: Soid) -> Option<Oid>;

    /// Whether the object's metadata is present locally
    fn exists_locally(&self, soid: Soid) -> bool;

    /// Whether the object has been removed from sync scope
    fn is_expelled(&self, _soid: Soid) -> bool {
        false
    }
}

/// Durable application of fetched payloads
///
/// Every write happens inside the collector's transaction so payload and
/// version state commit or roll back together.
pub trait StorageApply: Send + Sync {
    fn apply(&self, tx: &Transaction<'_>, socid: Socid, payload: &Bytes) -> Result<()>;

    fn expel(&self, tx: &Transaction<'_>, socid: Socid) -> Result<()>;

    /// Current local payload, if any
    fn read(&self, conn: &Connection, socid: Socid) -> Result<Option<Bytes>>;
}

/// Both sides of a concurrent update
#[derive(Debug, Clone)]
pub struct ConflictContext<'a> {
    pub socid: Socid,
    pub local_vector: &'a VersionVector,
    pub remote_vector: &'a VersionVector,
    pub local_payload: Option<Bytes>,
    pub remote_payload: &'a Bytes,
}

pub trait ConflictResolver: Send + Sync {
    /// Decide a concurrent update; runs inside the collector's transaction
    fn resolve(&self, tx: &Transaction<'_>, conflict: &ConflictContext<'_>) -> Result<Resolution>;
}

pub trait Presence: Send + Sync {
    /// Devices currently reachable for `sidx`
    fn reachable_devices(&self, sidx: SIndex) -> Vec<Did>;
}
