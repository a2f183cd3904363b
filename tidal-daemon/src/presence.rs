//! Peer presence and summary exchange
//!
//! Tracks which devices are reachable for each store and the object summary
//! each of them last sent. Summaries let us skip offering objects a peer
//! already holds; a false positive only costs an extra round trip later.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tidal_index::{Did, Oid, SIndex, Sid};
use tidal_sync::Presence;

use crate::bloom::{BloomError, BloomFilter};

/// Objects one device holds in one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSummary {
    pub device: Did,
    pub store: Sid,
    pub objects: BloomFilter,
}

impl PresenceSummary {
    pub fn build<I>(
        device: Did,
        store: Sid,
        oids: I,
        bit_length: usize,
        num_partitions: usize,
    ) -> Result<Self, BloomError>
    where
        I: IntoIterator<Item = Oid>,
    {
        let mut objects = BloomFilter::new(bit_length, num_partitions)?;
        for oid in oids {
            objects.add(&oid);
        }
        Ok(Self {
            device,
            store,
            objects,
        })
    }

    /// Summary with the default filter parameters
    pub fn from_objects<I>(device: Did, store: Sid, oids: I) -> Self
    where
        I: IntoIterator<Item = Oid>,
    {
        let mut objects = BloomFilter::default();
        for oid in oids {
            objects.add(&oid);
        }
        Self {
            device,
            store,
            objects,
        }
    }

    pub fn may_hold(&self, oid: &Oid) -> bool {
        self.objects.contains(oid)
    }

    /// Fold in a later summary from the same device and store
    pub fn absorb(&mut self, other: &PresenceSummary) -> Result<(), BloomError> {
        self.objects.union(&other.objects)
    }
}

/// Stores a device participates in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub device: Did,
    pub stores: BloomFilter,
}

impl StoreSummary {
    pub fn from_stores<I>(device: Did, sids: I) -> Self
    where
        I: IntoIterator<Item = Sid>,
    {
        let mut stores = BloomFilter::default();
        for sid in sids {
            stores.add(&sid);
        }
        Self { device, stores }
    }

    pub fn may_share(&self, sid: &Sid) -> bool {
        self.stores.contains(sid)
    }
}

#[derive(Default)]
struct PeerSetInner {
    reachable: HashMap<SIndex, BTreeSet<Did>>,
    summaries: HashMap<(Did, SIndex), PresenceSummary>,
}

/// Reachable peers per store, shared between the core and its collector
#[derive(Default)]
pub struct PeerSet {
    inner: RwLock<PeerSetInner>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, PeerSetInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PeerSetInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `device` reachable for the given stores
    pub fn peer_online(&self, device: Did, stores: &[SIndex]) {
        let mut inner = self.write();
        for sidx in stores {
            inner.reachable.entry(*sidx).or_default().insert(device);
        }
        info!(%device, stores = stores.len(), "Peer online");
    }

    /// Mark `device` reachable for every local store its summary may share
    ///
    /// Returns the stores that matched.
    pub fn peer_online_with_summary(&self, summary: &StoreSummary, local: &[(SIndex, Sid)]) -> Vec<SIndex> {
        let shared: Vec<SIndex> = local
            .iter()
            .filter(|(_, sid)| summary.may_share(sid))
            .map(|(sidx, _)| *sidx)
            .collect();
        self.peer_online(summary.device, &shared);
        shared
    }

    pub fn peer_offline(&self, device: Did) {
        let mut inner = self.write();
        for peers in inner.reachable.values_mut() {
            peers.remove(&device);
        }
        inner.reachable.retain(|_, peers| !peers.is_empty());
        inner.summaries.retain(|(peer, _), _| *peer != device);
        info!(%device, "Peer offline");
    }

    /// Keep the latest object summary a peer sent for a store
    pub fn record_summary(&self, sidx: SIndex, summary: PresenceSummary) -> Result<(), BloomError> {
        let mut inner = self.write();
        let key = (summary.device, sidx);
        match inner.summaries.entry(key) {
            Entry::Occupied(mut existing) if existing.get().store == summary.store => {
                existing.get_mut().absorb(&summary)?
            }
            Entry::Occupied(mut existing) => {
                existing.insert(summary);
            }
            Entry::Vacant(slot) => {
                slot.insert(summary);
            }
        }
        debug!(device = %key.0, %sidx, "Recorded presence summary");
        Ok(())
    }

    pub fn summary(&self, device: Did, sidx: SIndex) -> Option<PresenceSummary> {
        self.read().summaries.get(&(device, sidx)).cloned()
    }

    /// Objects worth offering to `peer`, dropping those its summary says it holds
    ///
    /// Without a summary everything is offered.
    pub fn objects_to_offer<I>(&self, peer: Did, sidx: SIndex, oids: I) -> Vec<Oid>
    where
        I: IntoIterator<Item = Oid>,
    {
        let inner = self.read();
        match inner.summaries.get(&(peer, sidx)) {
            Some(summary) => oids.into_iter().filter(|oid| !summary.may_hold(oid)).collect(),
            None => oids.into_iter().collect(),
        }
    }

    pub fn forget_store(&self, sidx: SIndex) {
        let mut inner = self.write();
        inner.reachable.remove(&sidx);
        inner.summaries.retain(|(_, store), _| *store != sidx);
    }

    pub fn peer_count(&self) -> usize {
        let inner = self.read();
        inner
            .reachable
            .values()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len()
    }
}

impl Presence for PeerSet {
    fn reachable_devices(&self, sidx: SIndex) -> Vec<Did> {
        self.read()
            .reachable
            .get(&sidx)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_and_offline() {
        let peers = PeerSet::new();
        let (a, b) = (Did::generate(), Did::generate());
        peers.peer_online(a, &[SIndex(1), SIndex(2)]);
        peers.peer_online(b, &[SIndex(1)]);

        assert_eq!(peers.reachable_devices(SIndex(1)).len(), 2);
        assert_eq!(peers.reachable_devices(SIndex(2)), vec![a]);
        assert_eq!(peers.peer_count(), 2);

        peers.peer_offline(a);
        assert_eq!(peers.reachable_devices(SIndex(1)), vec![b]);
        assert!(peers.reachable_devices(SIndex(2)).is_empty());
    }

    #[test]
    fn test_store_summary_matches_shared_stores() {
        let peers = PeerSet::new();
        let (shared, private) = (Sid::generate(), Sid::generate());
        let device = Did::generate();
        let summary = StoreSummary::from_stores(device, [shared]);

        let matched = peers.peer_online_with_summary(&summary, &[(SIndex(1), shared)]);
        assert_eq!(matched, vec![SIndex(1)]);
        assert!(summary.may_share(&shared));
        // a random identity is overwhelmingly unlikely to collide in a default-size filter
        assert!(!summary.may_share(&private));
    }

    #[test]
    fn test_offers_skip_objects_peer_holds() {
        let peers = PeerSet::new();
        let (device, store) = (Did::generate(), Sid::generate());
        let held = Oid::generate();
        let missing = Oid::generate();

        assert_eq!(
            peers.objects_to_offer(device, SIndex(1), [held, missing]),
            vec![held, missing]
        );

        peers
            .record_summary(SIndex(1), PresenceSummary::from_objects(device, store, [held]))
            .unwrap();
        assert_eq!(peers.objects_to_offer(device, SIndex(1), [held, missing]), vec![missing]);
    }

    #[test]
    fn test_later_summaries_accumulate() {
        let peers = PeerSet::new();
        let (device, store) = (Did::generate(), Sid::generate());
        let (first, second) = (Oid::generate(), Oid::generate());

        peers
            .record_summary(SIndex(3), PresenceSummary::from_objects(device, store, [first]))
            .unwrap();
        peers
            .record_summary(SIndex(3), PresenceSummary::from_objects(device, store, [second]))
            .unwrap();

        let summary = peers.summary(device, SIndex(3)).unwrap();
        assert!(summary.may_hold(&first));
        assert!(summary.may_hold(&second));

        peers.forget_store(SIndex(3));
        assert!(peers.summary(device, SIndex(3)).is_none());
    }

    #[test]
    fn test_mismatched_summary_parameters_are_rejected() {
        let peers = PeerSet::new();
        let (device, store) = (Did::generate(), Sid::generate());
        peers
            .record_summary(SIndex(1), PresenceSummary::from_objects(device, store, std::iter::empty()))
            .unwrap();

        let small = PresenceSummary::build(device, store, [Oid::generate()], 64, 4).unwrap();
        assert!(peers.record_summary(SIndex(1), small).is_err());
    }
}
