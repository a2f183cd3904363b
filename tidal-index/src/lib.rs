//! Identifiers and persistence for the tidal collector
//!
//! Everything the reconciliation engine persists lives in one SQLite
//! database: the store registry, version vectors, peer announcements, the
//! collector queue, the alias map and parked entries.

pub mod database;
pub mod database_pool;
pub mod errors;
pub mod ids;
pub mod migrations;
pub mod schema;
pub mod stores;

pub use database::Database;
pub use database_pool::{DatabasePoolBuilder, ReadPool};
pub use errors::{IndexError, Result};
pub use ids::{Cid, Did, Oid, SIndex, Sid, Socid, Soid, Tick, UNIQUE_ID_LEN};
pub use migrations::{run_migrations, Migration, MigrationManager};
pub use schema::SCHEMA_VERSION;
pub use stores::{StoreMultiplicity, StoreRecord};
