//! In-memory collaborators shared by the end-to-end tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{Connection, Transaction};

use tidal::index::{Cid, Did, Oid, SIndex, Socid, Soid, Tick};
use tidal::sync::{
    Collaborators, DirectoryService, FetchError, FetchedComponent, Presence, StorageApply,
    TieBreakResolver, Transport, VersionVector,
};

pub fn did(n: u8) -> Did {
    Did::from_bytes([n; 16])
}

pub fn oid(n: u8) -> Oid {
    Oid::from_bytes([n; 16])
}

pub fn vv(entries: &[(u8, u64)]) -> VersionVector {
    entries.iter().map(|(d, t)| (did(*d), Tick(*t))).collect()
}

/// Local object tree and payload store of the device under test
#[derive(Default)]
pub struct MemoryTree {
    parents: Mutex<HashMap<Oid, Oid>>,
    objects: Mutex<HashMap<Socid, Bytes>>,
    applied: Mutex<Vec<Socid>>,
}

impl MemoryTree {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the parent carried by an object's metadata
    pub fn link(&self, child: Oid, parent: Oid) {
        self.parents.lock().unwrap().insert(child, parent);
    }

    /// Order in which components were written
    pub fn applied(&self) -> Vec<Socid> {
        self.applied.lock().unwrap().clone()
    }

    pub fn payload(&self, socid: Socid) -> Option<Bytes> {
        self.objects.lock().unwrap().get(&socid).cloned()
    }
}

impl DirectoryService for MemoryTree {
    fn parent_of(&self, soid: Soid) -> Option<Oid> {
        self.parents.lock().unwrap().get(&soid.oid).copied()
    }

    fn exists_locally(&self, soid: Soid) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&soid.with_cid(Cid::Meta))
    }
}

impl StorageApply for MemoryTree {
    fn apply(&self, _tx: &Transaction<'_>, socid: Socid, payload: &Bytes) -> tidal::sync::Result<()> {
        self.objects.lock().unwrap().insert(socid, payload.clone());
        self.applied.lock().unwrap().push(socid);
        Ok(())
    }

    fn expel(&self, _tx: &Transaction<'_>, socid: Socid) -> tidal::sync::Result<()> {
        self.objects.lock().unwrap().remove(&socid);
        Ok(())
    }

    fn read(&self, _conn: &Connection, socid: Socid) -> tidal::sync::Result<Option<Bytes>> {
        Ok(self.payload(socid))
    }
}

/// Fixed set of reachable peers
pub struct StaticPresence(pub Vec<Did>);

impl Presence for StaticPresence {
    fn reachable_devices(&self, _sidx: SIndex) -> Vec<Did> {
        self.0.clone()
    }
}

pub fn collaborators(tree: &Arc<MemoryTree>, peers: Vec<Did>) -> Collaborators {
    Collaborators {
        directory: tree.clone(),
        storage: tree.clone(),
        resolver: Arc::new(TieBreakResolver::default()),
        presence: Arc::new(StaticPresence(peers)),
    }
}

/// Peers' holdings, with scripted failures and an optional delay
#[derive(Default)]
pub struct ScriptedTransport {
    holdings: Mutex<HashMap<(Did, Socid), FetchedComponent>>,
    failures: Mutex<HashMap<Socid, (FetchError, usize)>>,
    requests: Mutex<Vec<(Did, Socid)>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hold(&self, device: Did, socid: Socid, payload: &'static [u8], version: VersionVector) {
        self.holdings.lock().unwrap().insert(
            (device, socid),
            FetchedComponent {
                payload: Bytes::from_static(payload),
                version,
            },
        );
    }

    /// Fail the next `times` fetches of `socid`
    pub fn fail(&self, socid: Socid, error: FetchError, times: usize) {
        self.failures.lock().unwrap().insert(socid, (error, times));
    }

    pub fn stall(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<(Did, Socid)> {
        self.requests.lock().unwrap().clone()
    }

    /// Answer a fetch synchronously, as the transport task would
    pub fn answer(&self, device: Did, socid: Socid) -> Result<FetchedComponent, FetchError> {
        self.requests.lock().unwrap().push((device, socid));

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some((error, remaining)) = failures.get_mut(&socid) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
        }

        self.holdings
            .lock()
            .unwrap()
            .get(&(device, socid))
            .cloned()
            .ok_or(FetchError::NotFound)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(
        &self,
        device: Did,
        socid: Socid,
        _min_version: VersionVector,
    ) -> Result<FetchedComponent, FetchError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.answer(device, socid)
    }
}
