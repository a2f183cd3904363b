//! Tidal workspace root
//!
//! Re-exports the collector crates and hosts the end-to-end tests that
//! exercise them together.

pub use tidal_daemon as daemon;
pub use tidal_index as index;
pub use tidal_sync as sync;
