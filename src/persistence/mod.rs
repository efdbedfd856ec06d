//! Session recovery persistence
//!
//! - Snapshot model with freshness and integrity validation
//! - Keyed snapshot stores (file-backed and in-memory)

pub mod recovery;
pub mod store;

pub use recovery::{validate, IntegrityError, RecoveryStore, SessionSnapshot, SNAPSHOT_SCHEMA_VERSION};
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
