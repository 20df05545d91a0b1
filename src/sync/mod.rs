//! Catalog gossip, host discovery, and replication decisioning

pub mod discovery;
pub mod gossip;
pub mod replication;

pub use discovery::{Discovery, DISCOVER_PATH, NETWORK_ID};
pub use gossip::{CycleOutcome, SyncEngine, SyncError};
pub use replication::{
    Coverage, HttpProbe, LivenessProbe, ReplicationEngine, ReplicationError,
};
