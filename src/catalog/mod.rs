//! Persistent peer directory and resource catalog
//!
//! Both stores live in one sled database with a tree per concern. All
//! accessors return typed records; nothing above this boundary branches
//! on row shape.

pub mod peers;
pub mod resources;

pub use peers::{PeerDirectory, PeerRecord};
pub use resources::{
    CatalogItem, CatalogPage, NewResource, ResourceCatalog, ResourceRecord, ResourceStatus,
    StorageType, UpsertOutcome,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("transaction failed: {0}")]
    Transaction(String),
    #[error("record encoding error: {0}")]
    Codec(String),
    #[error("not a usable host: {0}")]
    InvalidHost(String),
    #[error("not a usable content hash: {0}")]
    InvalidHash(String),
}

pub(crate) fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
