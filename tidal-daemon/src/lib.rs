//! Collector core for the tidal daemon
//!
//! Hosts the single-threaded actor that owns the collector database, the
//! peer presence table it consults for fetch sources, and the Bloom filter
//! summaries peers exchange to avoid re-offering data.

pub mod bloom;
pub mod orchestrator;
pub mod presence;

pub use bloom::{BloomError, BloomFilter, BloomKey};
pub use orchestrator::{
    CollectorCore, CoreConfig, CoreError, CoreHandle, CoreMessage, CoreServices, CoreStatus,
};
pub use presence::{PeerSet, PresenceSummary, StoreSummary};
