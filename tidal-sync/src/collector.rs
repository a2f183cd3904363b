//! Collection state machine
//!
//! The [`Collector`] walks every store's queue, decides which entries can be
//! fetched now, and applies fetch results transactionally. It never performs
//! I/O itself: [`Collector::next_fetches`] hands out [`FetchRequest`]s and the
//! caller reports each outcome back through [`Collector::complete_fetch`].
//!
//! Per entry the states are `Pending -> Checking -> Fetching -> Applying ->
//! Done`, or `Pending -> Checking -> Skipped -> Done` when the entry no longer
//! needs work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use tidal_index::stores;
use tidal_index::{Cid, Database, Did, IndexError, Oid, SIndex, Socid, Soid};

use crate::alias::AliasMap;
use crate::collaborators::{
    ConflictContext, ConflictResolver, DirectoryService, FetchedComponent, Presence, StorageApply,
};
use crate::collector_sequence::{CollectorEntry, CollectorIterator, CollectorSequence, Cs, Relevance};
use crate::conflict::Resolution;
use crate::dependency::{Dependency, DependencyEdge, DependencyGraph};
use crate::errors::{FetchError, Result, SyncError};
use crate::scheduler::RetrySchedule;
use crate::strategy::StoreStrategy;
use crate::version_vector::{MergeOutcome, VectorOrdering, VersionStore, VersionVector};

/// Tuning for the collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Fetches outstanding at once across all stores
    pub max_in_flight: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Passes an entry may stay blocked on an unresolvable edge before it is parked
    pub park_after_blocked_passes: u32,
    /// Minimum time blocked on an unresolvable edge before parking
    pub park_after_blocked_for: Duration,
    pub max_tree_depth: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(300),
            park_after_blocked_passes: 16,
            park_after_blocked_for: Duration::from_secs(60),
            max_tree_depth: 256,
        }
    }
}

/// The collaborators the collector calls synchronously
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn DirectoryService>,
    pub storage: Arc<dyn StorageApply>,
    pub resolver: Arc<dyn ConflictResolver>,
    pub presence: Arc<dyn Presence>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Expelled,
    Superseded,
    UpToDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Pending,
    Checking,
    Fetching,
    Applying,
    Skipped(SkipReason),
    Parked,
    Done,
}

/// A fetch the caller must perform on the collector's behalf
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub socid: Socid,
    pub cs: Cs,
    pub device: Did,
    pub min_version: VersionVector,
}

/// What applying a fetched component did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    NoOp,
    Conflict(Resolution),
}

/// Result of reporting a fetch back to the collector
#[derive(Debug, Clone, PartialEq)]
pub enum FetchDisposition {
    Applied(ApplyOutcome),
    /// Left pending; retried once the delay has passed
    Retrying { delay: Duration },
    /// Left pending behind an unsatisfied edge; the blocker was enqueued
    Blocked(DependencyEdge),
    /// Result thrown away without touching local state
    Discarded(SkipReason),
    /// No fetch for this SOCID was outstanding
    Unsolicited,
}

#[derive(Debug, Clone, Copy)]
struct BlockedEntry {
    edge: DependencyEdge,
    /// Consecutive passes with nothing underway that could satisfy the edge
    passes: u32,
    since: Instant,
}

pub struct Collector {
    config: CollectorConfig,
    local_device: Did,
    collaborators: Collaborators,
    strategies: HashMap<SIndex, StoreStrategy>,
    in_flight: HashMap<Socid, FetchRequest>,
    retries: RetrySchedule,
    blocked: HashMap<Socid, BlockedEntry>,
}

impl Collector {
    pub fn new(config: CollectorConfig, local_device: Did, collaborators: Collaborators) -> Self {
        let retries = RetrySchedule::new(config.retry_base_delay, config.retry_max_delay);
        Self {
            config,
            local_device,
            collaborators,
            strategies: HashMap::new(),
            in_flight: HashMap::new(),
            retries,
            blocked: HashMap::new(),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn local_device(&self) -> Did {
        self.local_device
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, socid: &Socid) -> bool {
        self.in_flight.contains_key(socid)
    }

    /// Consecutive fetch failures recorded for `socid`
    pub fn failures(&self, socid: &Socid) -> u32 {
        self.retries.failures(socid)
    }

    /// When the earliest backed-off entry becomes eligible again
    pub fn next_retry_due(&self) -> Option<Instant> {
        self.retries.next_due()
    }

    /// Queue `socid` for collection
    ///
    /// Returns `None` when the entry is parked or its store is expelled.
    pub fn enqueue(&self, tx: &Transaction<'_>, socid: Socid) -> Result<Option<Cs>> {
        let store = stores::store(tx, socid.sidx).map_err(|e| orphan(e, socid))?;
        if store.expelled {
            debug!(%socid, "Store expelled, not enqueuing");
            return Ok(None);
        }
        if CollectorSequence::is_parked(tx, socid)? {
            debug!(%socid, "Entry is parked, not enqueuing");
            return Ok(None);
        }
        CollectorSequence::enqueue(tx, socid).map(Some)
    }

    /// Record a peer's announced version and queue the SOCID if we are behind
    pub fn announce(
        &self,
        tx: &Transaction<'_>,
        peer: Did,
        socid: Socid,
        version: &VersionVector,
    ) -> Result<Option<Cs>> {
        let oid = AliasMap::dereference(tx, socid.sidx, socid.oid)?;
        let socid = Socid::new(socid.sidx, oid, socid.cid);

        VersionStore::record_announcement(tx, peer, socid, version)?;
        let cs = if VersionStore::is_stale(tx, socid)? {
            self.enqueue(tx, socid)?
        } else {
            debug!(%socid, %peer, "Announcement already covered locally");
            None
        };
        self.revive_parked(tx, socid)?;
        Ok(cs)
    }

    /// Return parked entries waiting on `blocker` to the queue
    ///
    /// Edges are re-derived for every parked entry of the store; those now
    /// collectible or blocked on `blocker` itself are unparked.
    fn revive_parked(&self, tx: &Transaction<'_>, blocker: Socid) -> Result<()> {
        if blocker.cid != Cid::Meta {
            return Ok(());
        }
        for parked in CollectorSequence::parked(tx, blocker.sidx)? {
            let revive = match self.check(tx, parked.socid)? {
                Dependency::Collectible => true,
                Dependency::Blocked(edge) => edge.blocker(blocker.sidx) == blocker,
            };
            if revive {
                CollectorSequence::unpark(tx, parked.socid)?;
                info!(socid = %parked.socid, %blocker, "Revived parked entry");
            }
        }
        Ok(())
    }

    /// Declare `alias` superseded by `target` and carry its pending work over
    pub fn add_alias(&self, tx: &Transaction<'_>, sidx: SIndex, alias: Oid, target: Oid) -> Result<Oid> {
        let resolved = AliasMap::add(tx, sidx, alias, target)?;

        for cid in [Cid::Meta, Cid::Content] {
            let from = Socid::new(sidx, alias, cid);
            let to = Socid::new(sidx, resolved, cid);
            for (peer, announced) in VersionStore::announcements(tx, from)? {
                VersionStore::record_announcement(tx, peer, to, &announced)?;
            }
            if CollectorSequence::cs_of(tx, from)?.is_some() && VersionStore::is_stale(tx, to)? {
                self.enqueue(tx, to)?;
            }
        }
        Ok(resolved)
    }

    /// Remove a store from sync scope
    ///
    /// Queued entries are dropped by the next pass and outstanding fetches are
    /// discarded when they complete.
    pub fn expel_store(&mut self, tx: &Transaction<'_>, sidx: SIndex) -> Result<()> {
        stores::set_store_expelled(tx, sidx, true)?;
        self.strategies.remove(&sidx);
        self.blocked.retain(|socid, _| socid.sidx != sidx);
        info!(%sidx, "Store expelled from collection");
        Ok(())
    }

    /// Take one object out of sync scope
    ///
    /// Its queued components are dropped and the local copy is handed to
    /// storage for removal. A fetch still outstanding for it completes as
    /// [`FetchDisposition::Unsolicited`] and is ignored.
    pub fn expel_object(&mut self, tx: &Transaction<'_>, soid: Soid) -> Result<()> {
        for cid in [Cid::Meta, Cid::Content] {
            let socid = soid.with_cid(cid);
            if let Some(cs) = CollectorSequence::cs_of(tx, socid)? {
                CollectorSequence::dequeue(tx, soid.sidx, cs)?;
            }
            self.collaborators.storage.expel(tx, socid)?;
            self.in_flight.remove(&socid);
            self.retries.clear(&socid);
            self.blocked.remove(&socid);
        }
        info!(%soid, "Object expelled from collection");
        Ok(())
    }

    /// Where `socid` currently is in its lifecycle
    pub fn state_of(&self, conn: &Connection, socid: Socid) -> Result<EntryState> {
        if self.in_flight.contains_key(&socid) {
            return Ok(EntryState::Fetching);
        }
        if CollectorSequence::cs_of(conn, socid)?.is_some() {
            return Ok(EntryState::Pending);
        }
        if CollectorSequence::is_parked(conn, socid)? {
            return Ok(EntryState::Parked);
        }
        Ok(EntryState::Done)
    }

    fn relevance(&self, tx: &Transaction<'_>, entry: &CollectorEntry) -> Result<Relevance> {
        let socid = entry.socid;
        let store = stores::store(tx, socid.sidx).map_err(|e| orphan(e, socid))?;
        if store.expelled || self.collaborators.directory.is_expelled(socid.soid()) {
            return Ok(Relevance::Expelled);
        }

        if AliasMap::is_aliased(tx, socid.sidx, socid.oid)? {
            let target = Socid::new(
                socid.sidx,
                AliasMap::dereference(tx, socid.sidx, socid.oid)?,
                socid.cid,
            );
            if VersionStore::is_stale(tx, target)? && CollectorSequence::cs_of(tx, target)?.is_none() {
                self.enqueue(tx, target)?;
            }
            return Ok(Relevance::Superseded);
        }

        Ok(Relevance::Relevant)
    }

    fn check(&self, conn: &Connection, socid: Socid) -> Result<Dependency> {
        DependencyGraph::check(
            conn,
            self.collaborators.directory.as_ref(),
            socid,
            self.config.max_tree_depth,
        )
    }

    fn strategy(&mut self, conn: &Connection, sidx: SIndex) -> Result<&mut StoreStrategy> {
        if !self.strategies.contains_key(&sidx) {
            let store = stores::store(conn, sidx)?;
            self.strategies
                .insert(sidx, StoreStrategy::for_multiplicity(store.multiplicity));
        }
        self.strategies
            .get_mut(&sidx)
            .ok_or(SyncError::Index(IndexError::UnknownStore(sidx)))
    }

    /// Queue the component that unblocks `edge`, unless it is already being fetched
    fn enqueue_blocker(&self, tx: &Transaction<'_>, sidx: SIndex, edge: &DependencyEdge) -> Result<()> {
        let blocker = edge.blocker(sidx);
        if self.in_flight.contains_key(&blocker) {
            return Ok(());
        }
        self.enqueue(tx, blocker)?;
        Ok(())
    }

    /// Whether anything is queued, underway or announced that could satisfy `blocker`
    fn blocker_resolvable(&self, tx: &Transaction<'_>, blocker: Socid) -> Result<bool> {
        if self.in_flight.contains_key(&blocker) || self.retries.failures(&blocker) > 0 {
            return Ok(true);
        }
        if CollectorSequence::cs_of(tx, blocker)?.is_some() {
            return Ok(true);
        }
        Ok(!VersionStore::announcements(tx, blocker)?.is_empty())
    }

    fn note_blocked(
        &mut self,
        tx: &Transaction<'_>,
        entry: &CollectorEntry,
        edge: DependencyEdge,
        now: Instant,
    ) -> Result<()> {
        let blocker = edge.blocker(entry.socid.sidx);
        let blocked = if self.blocker_resolvable(tx, blocker)? {
            BlockedEntry { edge, passes: 0, since: now }
        } else {
            match self.blocked.get(&entry.socid) {
                Some(previous) if previous.edge == edge && previous.passes > 0 => BlockedEntry {
                    passes: previous.passes + 1,
                    ..*previous
                },
                _ => BlockedEntry { edge, passes: 1, since: now },
            }
        };
        let passes = blocked.passes;

        if passes > 0
            && passes >= self.config.park_after_blocked_passes
            && now.saturating_duration_since(blocked.since) >= self.config.park_after_blocked_for
        {
            let reason = format!(
                "blocked on {:?} edge to {} for {} passes",
                edge.kind, edge.target, passes
            );
            CollectorSequence::park(tx, entry.socid, &reason)?;
            self.blocked.remove(&entry.socid);
            self.retries.clear(&entry.socid);
            return Ok(());
        }

        debug!(
            socid = %entry.socid,
            cs = %entry.cs,
            blocker = %edge.target,
            kind = ?edge.kind,
            passes,
            "Entry blocked"
        );
        self.blocked.insert(entry.socid, blocked);
        self.enqueue_blocker(tx, entry.socid.sidx, &edge)
    }

    /// Run one collection pass over every store and return the fetches to start
    pub fn next_fetches(&mut self, db: &mut Database, now: Instant) -> Result<Vec<FetchRequest>> {
        let tx = db.begin_transaction()?;
        let mut requests = Vec::new();

        for sidx in stores::list_stores(&tx)? {
            if self.in_flight.len() >= self.config.max_in_flight {
                break;
            }
            self.collect_store(&tx, sidx, now, &mut requests)?;
        }

        tx.commit()?;
        if !requests.is_empty() {
            debug!(count = requests.len(), in_flight = self.in_flight.len(), "Dispatching fetches");
        }
        Ok(requests)
    }

    fn collect_store(
        &mut self,
        tx: &Transaction<'_>,
        sidx: SIndex,
        now: Instant,
        requests: &mut Vec<FetchRequest>,
    ) -> Result<()> {
        let mut iter = CollectorIterator::new(sidx);

        while self.in_flight.len() < self.config.max_in_flight {
            let Some(entry) = iter.next(tx, |tx, entry| self.relevance(tx, entry))? else {
                break;
            };
            if self.in_flight.contains_key(&entry.socid) || !self.retries.is_due(&entry.socid, now) {
                continue;
            }

            match self.check(tx, entry.socid)? {
                Dependency::Blocked(edge) => {
                    self.note_blocked(tx, &entry, edge, now)?;
                    continue;
                }
                Dependency::Collectible => {
                    self.blocked.remove(&entry.socid);
                }
            }

            let candidates = VersionStore::candidates(tx, entry.socid)?;
            if candidates.is_empty() {
                CollectorSequence::dequeue(tx, sidx, entry.cs)?;
                self.retries.clear(&entry.socid);
                debug!(socid = %entry.socid, reason = ?SkipReason::UpToDate, "Skipped entry");
                continue;
            }

            let reachable = self.collaborators.presence.reachable_devices(sidx);
            let Some((device, min_version)) = self.strategy(tx, sidx)?.select(&candidates, &reachable) else {
                debug!(socid = %entry.socid, "No reachable device holds a newer version");
                continue;
            };

            let request = FetchRequest {
                socid: entry.socid,
                cs: entry.cs,
                device,
                min_version,
            };
            debug!(socid = %entry.socid, cs = %entry.cs, %device, "Fetching");
            self.retries.dispatched(&entry.socid);
            self.in_flight.insert(entry.socid, request.clone());
            requests.push(request);
        }

        iter.close();
        Ok(())
    }

    /// Report the outcome of a fetch previously returned by [`Collector::next_fetches`]
    ///
    /// Transport failures leave the entry pending behind an exponential
    /// backoff. Invariant violations abort the transaction and propagate.
    pub fn complete_fetch(
        &mut self,
        db: &mut Database,
        socid: Socid,
        result: std::result::Result<FetchedComponent, FetchError>,
        now: Instant,
    ) -> Result<FetchDisposition> {
        let Some(request) = self.in_flight.remove(&socid) else {
            warn!(%socid, "Fetch completed with no matching request");
            return Ok(FetchDisposition::Unsolicited);
        };

        let fetched = match result {
            Ok(fetched) => fetched,
            Err(err) => {
                let delay = self.retries.record_failure(socid, now);
                warn!(
                    %socid,
                    device = %request.device,
                    error = %err,
                    failures = self.retries.failures(&socid),
                    ?delay,
                    "Fetch failed, will retry"
                );
                return Ok(FetchDisposition::Retrying { delay });
            }
        };

        match self.commit_fetch(db, &request, &fetched) {
            Ok(disposition) => {
                if !matches!(disposition, FetchDisposition::Blocked(_)) {
                    self.retries.clear(&socid);
                    self.blocked.remove(&socid);
                }
                Ok(disposition)
            }
            Err(err) if err.is_invariant_violation() => {
                error!(%socid, error = %err, "Invariant violated while applying fetch");
                Err(err)
            }
            Err(SyncError::Storage(reason)) => {
                let delay = self.retries.record_failure(socid, now);
                warn!(%socid, %reason, ?delay, "Apply failed, will retry");
                Ok(FetchDisposition::Retrying { delay })
            }
            Err(err) => Err(err),
        }
    }

    fn commit_fetch(
        &self,
        db: &mut Database,
        request: &FetchRequest,
        fetched: &FetchedComponent,
    ) -> Result<FetchDisposition> {
        let socid = request.socid;
        let tx = db.begin_transaction()?;
        let entry = CollectorEntry {
            cs: request.cs,
            socid,
        };

        let reason = match self.relevance(&tx, &entry)? {
            Relevance::Relevant => None,
            Relevance::Superseded => Some(SkipReason::Superseded),
            Relevance::Expelled => Some(SkipReason::Expelled),
        };
        if let Some(reason) = reason {
            if let Some(cs) = CollectorSequence::cs_of(&tx, socid)? {
                CollectorSequence::dequeue(&tx, socid.sidx, cs)?;
            }
            tx.commit()?;
            info!(%socid, ?reason, "Discarded fetch result");
            return Ok(FetchDisposition::Discarded(reason));
        }

        if let Dependency::Blocked(edge) = self.check(&tx, socid)? {
            self.enqueue_blocker(&tx, socid.sidx, &edge)?;
            if CollectorSequence::cs_of(&tx, socid)?.is_none() {
                self.enqueue(&tx, socid)?;
            }
            tx.commit()?;
            debug!(%socid, blocker = %edge.target, kind = ?edge.kind, "Fetched entry blocked at commit");
            return Ok(FetchDisposition::Blocked(edge));
        }

        let outcome = self.apply(&tx, socid, fetched)?;

        if CollectorSequence::cs_of(&tx, socid)? == Some(request.cs) {
            CollectorSequence::dequeue(&tx, socid.sidx, request.cs)?;
        }
        if VersionStore::is_stale(&tx, socid)? && CollectorSequence::cs_of(&tx, socid)?.is_none() {
            self.enqueue(&tx, socid)?;
        }

        self.revive_parked(&tx, socid)?;

        tx.commit()?;
        info!(%socid, device = %request.device, ?outcome, version = %fetched.version, "Applied fetch");
        Ok(FetchDisposition::Applied(outcome))
    }

    fn apply(&self, tx: &Transaction<'_>, socid: Socid, fetched: &FetchedComponent) -> Result<ApplyOutcome> {
        let storage = self.collaborators.storage.as_ref();
        let local = VersionStore::local(tx, socid)?;

        match local.compare(&fetched.version) {
            VectorOrdering::Equal | VectorOrdering::Dominates => Ok(ApplyOutcome::NoOp),
            VectorOrdering::DominatedBy => {
                storage.apply(tx, socid, &fetched.payload)?;
                VersionStore::merge(tx, socid, &fetched.version)?;
                Ok(ApplyOutcome::Applied)
            }
            VectorOrdering::Concurrent => {
                let conflict = ConflictContext {
                    socid,
                    local_vector: &local,
                    remote_vector: &fetched.version,
                    local_payload: storage.read(tx, socid)?,
                    remote_payload: &fetched.payload,
                };
                let resolution = self.collaborators.resolver.resolve(tx, &conflict)?;

                if resolution == Resolution::TakeRemote {
                    storage.apply(tx, socid, &fetched.payload)?;
                }
                let merged = VersionStore::merge(tx, socid, &fetched.version)?;
                debug_assert_eq!(merged, MergeOutcome::Conflicting);
                if resolution == Resolution::KeepLocal {
                    VersionStore::advance(tx, self.local_device, socid)?;
                }

                info!(%socid, ?resolution, "Conflict resolved");
                Ok(ApplyOutcome::Conflict(resolution))
            }
        }
    }
}

fn orphan(err: IndexError, socid: Socid) -> SyncError {
    match err {
        IndexError::UnknownStore(_) => SyncError::OrphanEntry { socid },
        other => SyncError::Index(other),
    }
}
