//! Gossip synchronization engine
//!
//! A timer drives one cycle at a time: pick the stalest non-blocked peer,
//! pull a page of its resource catalog from the stored cursor, verify the
//! page's signature against the key we already hold for that peer, and
//! merge what survives. Hosts embedded in merged entries feed discovery,
//! so the topology grows transitively. The peer's sync cursor only moves
//! after a fully merged page, which keeps failed cycles retryable.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{
    CatalogItem, NewResource, PeerDirectory, ResourceCatalog, StorageType, StoreError,
    UpsertOutcome,
};
use crate::config::Config;
use crate::crypto::{is_valid_hash, NodeIdentity};
use crate::net::host::normalize_host;
use crate::protocol::{self, KeySource, ProtocolError};
use crate::sync::discovery::Discovery;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("peer {0} answered with an error response")]
    Rejected(String),
    #[error("catalog from {0} failed signature verification")]
    Verification(String),
    #[error("no stored key for peer {0}")]
    UnknownPeer(String),
    #[error("resource {0} not found")]
    NotFound(u64),
    #[error("resource {0} is stored locally and cannot be resynced from a peer")]
    LocalResource(u64),
    #[error("peer reports a different hash for resource {0}")]
    HashMismatch(u64),
    #[error("metadata from {0} is incomplete")]
    IncompleteMetadata(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What a finished cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No peer was due for a sync.
    NoPeer,
    Synced {
        host: String,
        merged: usize,
        discovered: usize,
    },
}

pub struct SyncEngine {
    config: Arc<Config>,
    peers: Arc<PeerDirectory>,
    resources: Arc<ResourceCatalog>,
    identity: Arc<NodeIdentity>,
    discovery: Arc<Discovery>,
    client: reqwest::Client,
}

impl SyncEngine {
    pub fn new(
        config: Arc<Config>,
        peers: Arc<PeerDirectory>,
        resources: Arc<ResourceCatalog>,
        identity: Arc<NodeIdentity>,
        discovery: Arc<Discovery>,
    ) -> Self {
        Self {
            config,
            peers,
            resources,
            identity,
            discovery,
            client: reqwest::Client::new(),
        }
    }

    /// Run sync cycles on the configured interval until the task is
    /// dropped. Each cycle is independent and idempotent.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.sync_cycle(None).await {
                Ok(CycleOutcome::NoPeer) => debug!("sync cycle: no peer due"),
                Ok(CycleOutcome::Synced {
                    host,
                    merged,
                    discovered,
                }) => {
                    info!("synced {merged} entries from {host} ({discovered} hosts discovered)")
                }
                Err(err) => warn!("sync cycle failed: {err}"),
            }
        }
    }

    /// One pull-verify-merge cycle against an explicit host, or against
    /// the stalest peer when none is given.
    pub async fn sync_cycle(&self, explicit_host: Option<&str>) -> Result<CycleOutcome, SyncError> {
        let peer = match explicit_host {
            Some(host) => {
                let normalized =
                    normalize_host(host).ok_or_else(|| SyncError::UnknownPeer(host.to_string()))?;
                self.peers
                    .get(&normalized)?
                    .ok_or(SyncError::UnknownPeer(normalized))?
            }
            None => match self.peers.next_sync_candidate(self.config.sync_interval())? {
                Some(peer) => peer,
                None => return Ok(CycleOutcome::NoPeer),
            },
        };
        let host = peer.host.clone();

        // fetch, resuming from the stored cursor
        let path = format!("/resources/{}/{}", self.config.host, peer.sync_index);
        let url = self.config.peer_url(&host, &path);
        let response = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "{host} answered {}",
                response.status()
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;

        if payload.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(SyncError::Rejected(host));
        }

        // the signing key comes from the directory, never from the response
        let verified = protocol::verify(&payload, KeySource::Fixed(&peer.public_key), None)
            .await?
            .all_valid();
        if !verified {
            warn!("catalog page from {host} failed verification, discarding");
            return Err(SyncError::Verification(host));
        }

        let items: Vec<CatalogItem> = match payload.get("items") {
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|err| SyncError::Transport(format!("malformed items from {host}: {err}")))?,
            None => Vec::new(),
        };

        let mut merged = 0;
        let mut discovered = 0;
        for item in &items {
            discovered += self.discover_embedded_hosts(item).await;
            if self.merge_item(&host, item)? {
                merged += 1;
            }
        }

        // only a fully merged page advances the cursor
        let index = payload
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(peer.sync_index);
        self.peers.mark_synced(&host, index)?;

        Ok(CycleOutcome::Synced {
            host,
            merged,
            discovered,
        })
    }

    /// Every host embedded in a catalog entry is a discovery candidate;
    /// probing already-known hosts is harmless.
    async fn discover_embedded_hosts(&self, item: &CatalogItem) -> usize {
        let mut discovered = 0;
        for embedded in &item.hosts {
            if normalize_host(embedded).as_deref() == Some(self.config.host.as_str()) {
                continue;
            }
            if self.discovery.discover_host(embedded).await {
                discovered += 1;
            }
        }
        discovered
    }

    fn merge_item(&self, peer_host: &str, item: &CatalogItem) -> Result<bool, SyncError> {
        let file_hash = item.file_hash.to_ascii_lowercase();
        if !is_valid_hash(&file_hash) {
            warn!("skipping catalog entry with malformed hash from {peer_host}");
            return Ok(false);
        }
        let Some(hash_ref) = item.hash_ref.clone().filter(|r| !r.is_empty()) else {
            warn!("skipping catalog entry {file_hash} without a storage reference");
            return Ok(false);
        };

        let outcome = self.resources.upsert(
            NewResource {
                host: peer_host.to_string(),
                file_hash,
                hash_ref,
                size_bytes: item.size_bytes.unwrap_or(0),
                mime: item
                    .mime
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                title: item.title.clone(),
            },
            true,
        )?;
        Ok(!matches!(outcome, UpsertOutcome::Unchanged(_)))
    }

    /// Re-fetch one known resource from its owning host and refresh the
    /// stored entry. A hash that no longer matches what we recorded is a
    /// trust signal: the update is rejected and logged, nothing more.
    pub async fn sync_single_resource(&self, id: u64) -> Result<(), SyncError> {
        let record = self.resources.get_by_id(id)?.ok_or(SyncError::NotFound(id))?;
        if record.storage_type == StorageType::Local {
            return Err(SyncError::LocalResource(id));
        }
        let host = record.host.clone();
        let peer = self.peers.get(&host)?.ok_or(SyncError::UnknownPeer(host.clone()))?;

        let url = self
            .config
            .peer_url(&host, &format!("/file/{}/json", record.file_hash));
        let response = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "{host} answered {}",
                response.status()
            )));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| SyncError::Transport(err.to_string()))?;
        if payload.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(SyncError::Rejected(host));
        }

        let verified = protocol::verify(&payload, KeySource::Fixed(&peer.public_key), None)
            .await?
            .all_valid();
        if !verified {
            warn!("resource metadata from {host} failed verification");
            return Err(SyncError::Verification(host));
        }

        let file_hash = payload.get("file_hash").and_then(Value::as_str);
        let hash_ref = payload.get("hash_ref").and_then(Value::as_str);
        let size_bytes = payload.get("size_bytes").and_then(Value::as_u64);
        let mime = payload.get("type").and_then(Value::as_str);
        let title = payload.get("title").and_then(Value::as_str);
        let (Some(file_hash), Some(hash_ref), Some(size_bytes), Some(mime), Some(title)) =
            (file_hash, hash_ref, size_bytes, mime, title)
        else {
            return Err(SyncError::IncompleteMetadata(host));
        };

        if !file_hash.eq_ignore_ascii_case(&record.file_hash) {
            // an owner answering ok with a different hash is either
            // corrupt or substituting content
            warn!("{host} now reports a different hash for resource {id}");
            return Err(SyncError::HashMismatch(id));
        }

        self.resources.upsert(
            NewResource {
                host,
                file_hash: file_hash.to_string(),
                hash_ref: hash_ref.to_string(),
                size_bytes,
                mime: mime.to_string(),
                title: Some(title.to_string()),
            },
            true,
        )?;
        Ok(())
    }

    /// A signed catalog page, in the shape peers expect to pull.
    pub fn signed_catalog_page(&self, after_id: u64) -> Result<Value, SyncError> {
        let page = self.resources.page(after_id, self.config.sync.page_limit)?;
        let mut payload = serde_json::json!({
            "ok": true,
            "items": page.items,
            "more_data": page.more_data,
            "index": page.index,
        });
        protocol::sign(&mut payload, &self.identity, None)?;
        Ok(payload)
    }
}
