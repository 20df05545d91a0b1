//! veilshare - a node in a decentralized file-sharing network
//!
//! Independent servers each host files and keep the network coherent by:
//! - signing resource catalogs over a canonical serialization and
//!   verifying peers' catalogs against locally stored keys
//! - gossiping catalog pages on a timer and merging what verifies
//! - discovering new hosts transitively from catalog entries
//! - replicating files locally when live network coverage drops below a
//!   configured target
//! - settling disputed peer-reported numbers with median-gated consensus

pub mod catalog;
pub mod config;
pub mod crypto;
pub mod files;
pub mod net;
pub mod protocol;
pub mod sync;
pub mod trust;

// Re-export commonly used types
pub use catalog::{
    CatalogItem, CatalogPage, NewResource, PeerDirectory, PeerRecord, ResourceCatalog,
    ResourceRecord, ResourceStatus, StorageType, StoreError, UpsertOutcome,
};
pub use config::{Config, ConfigError};
pub use crypto::{content_hash, is_valid_hash, Envelope, EnvelopeError, NodeIdentity, TokenStore};
pub use files::{FileStore, FileStoreError, StoredFile};
pub use net::{
    normalize_host, AbuseReport, Broadcast, BroadcastBody, Delivery, DeliveryResult, NetEvent,
    Network, PeerResolver, RateDecision, RateLimitConfig, RateLimiter,
};
pub use protocol::{KeyResolver, KeySource, ProtocolError, Verification};
pub use sync::{
    Coverage, CycleOutcome, Discovery, HttpProbe, LivenessProbe, ReplicationEngine,
    ReplicationError, SyncEngine, SyncError, NETWORK_ID,
};
pub use trust::{consensus, ConsensusOutcome, TrustVote};
