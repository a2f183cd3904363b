//! Actor-based collector core
//!
//! All collector state lives on one tokio task that drains a message queue,
//! so every database mutation happens on a single worker and only one
//! transaction is ever open. Network fetches run as separate tasks and
//! re-enter the queue as [`CoreMessage::FetchCompleted`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout};
use tracing::{debug, error, info, warn};

use tidal_index::stores;
use tidal_index::{Database, Did, IndexError, Oid, SIndex, Sid, Socid, Soid};
use tidal_sync::{
    BacklogStatus, Collaborators, Collector, CollectorConfig, ConflictResolver, DirectoryService,
    FetchError, FetchRequest, FetchedComponent, StorageApply, SyncError, Transport, VersionVector,
};

use crate::bloom::BloomError;
use crate::presence::{PeerSet, PresenceSummary, StoreSummary};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Bloom filter error: {0}")]
    Bloom(#[from] BloomError),

    #[error("Message names unknown store {0}")]
    UnknownStore(SIndex),

    #[error("Collector core is not running")]
    ChannelClosed,
}

impl CoreError {
    /// Errors that stop the core instead of being logged and skipped
    pub fn is_fatal(&self) -> bool {
        match self {
            CoreError::Sync(err) => {
                err.is_invariant_violation() || matches!(err, SyncError::Database(_) | SyncError::Index(_))
            }
            CoreError::Index(_) => true,
            CoreError::Bloom(_) | CoreError::UnknownStore(_) | CoreError::ChannelClosed => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Configuration for the collector core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub collector: CollectorConfig,
    /// Capacity of the core's message queue
    pub channel_capacity: usize,
    /// Upper bound on a single fetch before it counts as timed out
    pub fetch_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            collector: CollectorConfig::default(),
            channel_capacity: 256,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Messages that can be sent to the core
#[derive(Debug)]
pub enum CoreMessage {
    /// Queue a component for collection
    Enqueue { socid: Socid },

    /// A peer announced a version of a component
    Announce {
        peer: Did,
        socid: Socid,
        version: VersionVector,
    },

    /// Conflict resolution decided `alias` is superseded by `target`
    AddAlias { sidx: SIndex, alias: Oid, target: Oid },

    /// A peer connected and told us which stores it holds
    PeerOnline { summary: StoreSummary },

    /// A peer disconnected
    PeerOffline { device: Did },

    /// A peer sent the objects it holds in a store
    PresenceReceived { summary: PresenceSummary },

    /// Remove a store from sync scope
    ExpelStore { sidx: SIndex },

    /// Remove one object from sync scope
    ExpelObject { soid: Soid },

    /// A fetch task finished
    FetchCompleted {
        socid: Socid,
        result: std::result::Result<FetchedComponent, FetchError>,
    },

    /// Get current status
    GetStatus(oneshot::Sender<CoreStatus>),

    /// Graceful shutdown
    Shutdown,
}

/// Status information from the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreStatus {
    pub running: bool,
    pub in_flight: usize,
    pub reachable_peers: usize,
    pub stores: Vec<BacklogStatus>,
    pub next_retry_in: Option<Duration>,
}

impl CoreStatus {
    pub fn pending(&self) -> u64 {
        self.stores.iter().map(|store| store.pending).sum()
    }
}

/// Implementations the core drives
#[derive(Clone)]
pub struct CoreServices {
    pub transport: Arc<dyn Transport>,
    pub directory: Arc<dyn DirectoryService>,
    pub storage: Arc<dyn StorageApply>,
    pub resolver: Arc<dyn ConflictResolver>,
}

/// Single-threaded owner of the database and the collector
pub struct CollectorCore {
    config: CoreConfig,
    receiver: mpsc::Receiver<CoreMessage>,
    sender: mpsc::Sender<CoreMessage>,

    db: Database,
    collector: Collector,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerSet>,

    running: bool,
}

impl CollectorCore {
    pub fn new(config: CoreConfig, db: Database, local_device: Did, services: CoreServices) -> (Self, CoreHandle) {
        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let peers = Arc::new(PeerSet::new());

        let collaborators = Collaborators {
            directory: services.directory,
            storage: services.storage,
            resolver: services.resolver,
            presence: peers.clone(),
        };
        let collector = Collector::new(config.collector.clone(), local_device, collaborators);

        let handle = CoreHandle {
            sender: sender.clone(),
        };
        let core = Self {
            config,
            receiver,
            sender,
            db,
            collector,
            transport: services.transport,
            peers,
            running: false,
        };
        (core, handle)
    }

    /// Presence state shared with the collector
    pub fn peers(&self) -> Arc<PeerSet> {
        self.peers.clone()
    }

    /// Run until shutdown or a fatal error
    pub async fn run(mut self) -> Result<()> {
        info!("Starting collector core");
        self.running = true;

        // work persisted before a restart is picked up straight away
        self.run_pass()?;

        loop {
            let wake = self.retry_wake();
            let message = tokio::select! {
                message = self.receiver.recv() => message,
                _ = wait_until(wake) => {
                    self.run_pass()?;
                    continue;
                }
            };

            match message {
                None | Some(CoreMessage::Shutdown) => break,
                Some(message) => {
                    if let Err(err) = self.handle_message(message) {
                        if err.is_fatal() {
                            error!(error = %err, "Collector core stopping on fatal error");
                            return Err(err);
                        }
                        warn!(error = %err, "Message handling failed");
                    }
                }
            }

            self.run_pass()?;
        }

        self.running = false;
        info!(in_flight = self.collector.in_flight(), "Collector core stopped");
        Ok(())
    }

    /// Next retry wake-up, never sooner than one base delay from now
    fn retry_wake(&self) -> Option<tokio::time::Instant> {
        let floor = Instant::now() + self.config.collector.retry_base_delay;
        self.collector
            .next_retry_due()
            .map(|due| tokio::time::Instant::from_std(due.max(floor)))
    }

    fn handle_message(&mut self, message: CoreMessage) -> Result<()> {
        match message {
            CoreMessage::Enqueue { socid } => {
                self.require_store(socid.sidx)?;
                let tx = self.db.begin_transaction()?;
                self.collector.enqueue(&tx, socid)?;
                tx.commit().map_err(IndexError::from)?;
            }
            CoreMessage::Announce {
                peer,
                socid,
                version,
            } => {
                self.require_store(socid.sidx)?;
                let tx = self.db.begin_transaction()?;
                self.collector.announce(&tx, peer, socid, &version)?;
                tx.commit().map_err(IndexError::from)?;
            }
            CoreMessage::AddAlias {
                sidx,
                alias,
                target,
            } => {
                self.require_store(sidx)?;
                let tx = self.db.begin_transaction()?;
                self.collector.add_alias(&tx, sidx, alias, target)?;
                tx.commit().map_err(IndexError::from)?;
            }
            CoreMessage::PeerOnline { summary } => {
                let local = self.active_stores()?;
                let shared = self.peers.peer_online_with_summary(&summary, &local);
                debug!(device = %summary.device, shared = shared.len(), "Matched peer stores");
            }
            CoreMessage::PeerOffline { device } => {
                self.peers.peer_offline(device);
            }
            CoreMessage::PresenceReceived { summary } => {
                match stores::store_index(self.db.connection(), summary.store)? {
                    Some(sidx) => self.peers.record_summary(sidx, summary)?,
                    None => debug!(store = %summary.store, "Presence summary for unknown store"),
                }
            }
            CoreMessage::ExpelStore { sidx } => {
                self.require_store(sidx)?;
                let tx = self.db.begin_transaction()?;
                self.collector.expel_store(&tx, sidx)?;
                tx.commit().map_err(IndexError::from)?;
                self.peers.forget_store(sidx);
            }
            CoreMessage::ExpelObject { soid } => {
                self.require_store(soid.sidx)?;
                let tx = self.db.begin_transaction()?;
                self.collector.expel_object(&tx, soid)?;
                tx.commit().map_err(IndexError::from)?;
            }
            CoreMessage::FetchCompleted { socid, result } => {
                let disposition = self
                    .collector
                    .complete_fetch(&mut self.db, socid, result, Instant::now())?;
                debug!(%socid, ?disposition, "Fetch completed");
            }
            CoreMessage::GetStatus(reply) => {
                let status = self.status()?;
                if reply.send(status).is_err() {
                    debug!("Status requester went away");
                }
            }
            CoreMessage::Shutdown => {}
        }
        Ok(())
    }

    /// Refuse work for a store this device never registered
    fn require_store(&self, sidx: SIndex) -> Result<()> {
        match stores::store(self.db.connection(), sidx) {
            Ok(_) => Ok(()),
            Err(IndexError::UnknownStore(sidx)) => Err(CoreError::UnknownStore(sidx)),
            Err(err) => Err(err.into()),
        }
    }

    fn active_stores(&self) -> Result<Vec<(SIndex, Sid)>> {
        let conn = self.db.connection();
        let mut active = Vec::new();
        for sidx in stores::list_stores(conn)? {
            let store = stores::store(conn, sidx)?;
            if !store.expelled {
                active.push((sidx, store.sid));
            }
        }
        Ok(active)
    }

    fn status(&self) -> Result<CoreStatus> {
        let conn = self.db.connection();
        let stores = stores::list_stores(conn)?
            .into_iter()
            .map(|sidx| BacklogStatus::load(conn, sidx))
            .collect::<std::result::Result<Vec<_>, SyncError>>()?;

        let now = Instant::now();
        Ok(CoreStatus {
            running: self.running,
            in_flight: self.collector.in_flight(),
            reachable_peers: self.peers.peer_count(),
            stores,
            next_retry_in: self
                .collector
                .next_retry_due()
                .map(|due| due.saturating_duration_since(now)),
        })
    }

    /// One collection pass; dispatches whatever became fetchable
    fn run_pass(&mut self) -> Result<()> {
        let requests = self.collector.next_fetches(&mut self.db, Instant::now())?;
        for request in requests {
            self.dispatch(request);
        }
        Ok(())
    }

    fn dispatch(&self, request: FetchRequest) {
        let transport = self.transport.clone();
        let sender = self.sender.clone();
        let fetch_timeout = self.config.fetch_timeout;

        tokio::spawn(async move {
            let FetchRequest {
                socid,
                device,
                min_version,
                ..
            } = request;

            let result = match timeout(fetch_timeout, transport.fetch(device, socid, min_version)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            };

            if sender
                .send(CoreMessage::FetchCompleted { socid, result })
                .await
                .is_err()
            {
                debug!(%socid, "Core stopped before fetch completed");
            }
        });
    }
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable front end for talking to a running core
#[derive(Clone)]
pub struct CoreHandle {
    sender: mpsc::Sender<CoreMessage>,
}

impl CoreHandle {
    async fn send(&self, message: CoreMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| CoreError::ChannelClosed)
    }

    pub async fn enqueue(&self, socid: Socid) -> Result<()> {
        self.send(CoreMessage::Enqueue { socid }).await
    }

    pub async fn announce(&self, peer: Did, socid: Socid, version: VersionVector) -> Result<()> {
        self.send(CoreMessage::Announce {
            peer,
            socid,
            version,
        })
        .await
    }

    pub async fn add_alias(&self, sidx: SIndex, alias: Oid, target: Oid) -> Result<()> {
        self.send(CoreMessage::AddAlias {
            sidx,
            alias,
            target,
        })
        .await
    }

    pub async fn peer_online(&self, summary: StoreSummary) -> Result<()> {
        self.send(CoreMessage::PeerOnline { summary }).await
    }

    pub async fn peer_offline(&self, device: Did) -> Result<()> {
        self.send(CoreMessage::PeerOffline { device }).await
    }

    pub async fn presence_received(&self, summary: PresenceSummary) -> Result<()> {
        self.send(CoreMessage::PresenceReceived { summary }).await
    }

    pub async fn expel_store(&self, sidx: SIndex) -> Result<()> {
        self.send(CoreMessage::ExpelStore { sidx }).await
    }

    pub async fn expel_object(&self, soid: Soid) -> Result<()> {
        self.send(CoreMessage::ExpelObject { soid }).await
    }

    pub async fn status(&self) -> Result<CoreStatus> {
        let (reply, response) = oneshot::channel();
        self.send(CoreMessage::GetStatus(reply)).await?;
        response.await.map_err(|_| CoreError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(CoreMessage::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_index::Cid;

    #[test]
    fn test_fatal_classification() {
        let orphan = CoreError::Sync(SyncError::OrphanEntry {
            socid: Socid::new(SIndex(1), Oid::generate(), Cid::Meta),
        });
        assert!(orphan.is_fatal());

        let storage = CoreError::Sync(SyncError::Storage("busy".to_string()));
        assert!(!storage.is_fatal());

        assert!(!CoreError::Bloom(BloomError::Empty).is_fatal());
        assert!(!CoreError::UnknownStore(SIndex(7)).is_fatal());
        assert!(CoreError::Index(IndexError::Pool("gone".to_string())).is_fatal());
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: CoreConfig = serde_json::from_str(r#"{"channel_capacity": 8}"#).unwrap();
        assert_eq!(config.channel_capacity, 8);
        assert_eq!(config.fetch_timeout, CoreConfig::default().fetch_timeout);
        assert_eq!(config.collector, CollectorConfig::default());
    }
}
