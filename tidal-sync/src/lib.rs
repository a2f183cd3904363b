//! Reconciliation engine for the tidal collector
//!
//! This crate decides, for every shared object, whether the local replica is
//! stale and how to bring it up to date:
//! - Version vectors and their persistence
//! - The persistent collector queue and its iterator
//! - Alias resolution for superseded identities
//! - Dependency ordering between objects
//! - Conflict tie-breaking, retry backoff and source selection
//! - The collection state machine tying these together

pub mod alias;
pub mod collaborators;
pub mod collector;
pub mod collector_sequence;
pub mod conflict;
pub mod dependency;
pub mod errors;
pub mod progress;
pub mod scheduler;
pub mod strategy;
pub mod version_vector;

pub use alias::AliasMap;
pub use collaborators::{
    ConflictContext, ConflictResolver, DirectoryService, FetchedComponent, Presence, StorageApply,
    Transport,
};
pub use collector::{
    ApplyOutcome, Collaborators, Collector, CollectorConfig, EntryState, FetchDisposition,
    FetchRequest, SkipReason,
};
pub use collector_sequence::{
    CollectorEntry, CollectorIterator, CollectorSequence, Cs, ParkedEntry, Relevance,
};
pub use conflict::{HighestTickTieBreak, Resolution, TieBreakPolicy, TieBreakResolver};
pub use dependency::{Dependency, DependencyEdge, DependencyGraph, EdgeKind};
pub use errors::{FetchError, Result, SyncError};
pub use progress::{backlog, backlog_all, BacklogStatus};
pub use scheduler::RetrySchedule;
pub use strategy::StoreStrategy;
pub use version_vector::{MergeOutcome, VectorOrdering, VersionStore, VersionVector};
