//! Persistence Module
//!
//! Point-in-time snapshots of the whole keyspace.
//!
//! - [`snapshot`]: the versioned binary file format
//! - [`manager`]: save/load, `BGSAVE`, and the dirty-triggered background loop

pub mod manager;
pub mod snapshot;

pub use manager::{LoadReport, Persistence, PersistenceError, SaveReport};
pub use snapshot::{SnapshotError, SnapshotHeader, SnapshotReader, SnapshotRecord};
