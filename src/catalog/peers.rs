//! Peer directory
//!
//! One record per remote node, keyed by normalized host. Peers enter
//! through the discovery handshake and are never hard-deleted; blocking
//! is a soft flag. A discovery probe can never overwrite the key of an
//! already-known peer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use super::{now_epoch_secs, StoreError};
use crate::net::fanout::PeerResolver;
use crate::net::host::normalize_host;

/// Default trust assigned to a freshly discovered peer.
pub const INITIAL_TRUST: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub host: String,
    pub public_key: String,
    pub trust_level: f64,
    pub connection_errors: u32,
    /// Catalog cursor for incremental pulls.
    pub sync_index: u64,
    pub is_blocked: bool,
    pub last_seen: Option<u64>,
    pub last_sync: Option<u64>,
    pub created_at: u64,
}

pub struct PeerDirectory {
    tree: sled::Tree,
}

impl PeerDirectory {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree("peers")?,
        })
    }

    /// Register a newly discovered peer. Returns `true` when inserted,
    /// `false` when the host was already known (its key is untouched).
    pub fn insert_if_absent(&self, host: &str, public_key: &str) -> Result<bool, StoreError> {
        let host = canonical(host)?;
        let now = now_epoch_secs();
        let record = PeerRecord {
            host: host.clone(),
            public_key: public_key.to_string(),
            trust_level: INITIAL_TRUST,
            connection_errors: 0,
            sync_index: 0,
            is_blocked: false,
            last_seen: Some(now),
            last_sync: None,
            created_at: now,
        };
        let outcome = self.tree.compare_and_swap(
            host.as_bytes(),
            None::<&[u8]>,
            Some(encode(&record)?),
        )?;
        Ok(outcome.is_ok())
    }

    pub fn get(&self, host: &str) -> Result<Option<PeerRecord>, StoreError> {
        let host = canonical(host)?;
        self.tree
            .get(host.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// Hosts of every non-blocked peer.
    pub fn active_hosts(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .iter_all()?
            .into_iter()
            .filter(|p| !p.is_blocked)
            .map(|p| p.host)
            .collect())
    }

    /// Number of non-blocked peers, the denominator for coverage.
    pub fn count_active(&self) -> Result<usize, StoreError> {
        Ok(self.iter_all()?.iter().filter(|p| !p.is_blocked).count())
    }

    /// The non-blocked peer most overdue for a sync: `last_sync` unset
    /// first, then oldest. Peers synced within `stale_after` are skipped.
    pub fn next_sync_candidate(
        &self,
        stale_after: Duration,
    ) -> Result<Option<PeerRecord>, StoreError> {
        let cutoff = now_epoch_secs().saturating_sub(stale_after.as_secs());
        Ok(self
            .iter_all()?
            .into_iter()
            .filter(|p| !p.is_blocked)
            .filter(|p| p.last_sync.map_or(true, |t| t < cutoff))
            .min_by_key(|p| p.last_sync.unwrap_or(0)))
    }

    /// Advance the sync cursor after a fully merged catalog page.
    pub fn mark_synced(&self, host: &str, sync_index: u64) -> Result<(), StoreError> {
        self.update(host, |p| {
            let now = now_epoch_secs();
            p.last_sync = Some(now);
            p.last_seen = Some(now);
            p.sync_index = sync_index;
        })
    }

    pub fn touch_seen(&self, host: &str) -> Result<(), StoreError> {
        self.update(host, |p| p.last_seen = Some(now_epoch_secs()))
    }

    pub fn record_error(&self, host: &str) -> Result<(), StoreError> {
        self.update(host, |p| p.connection_errors += 1)
    }

    pub fn set_blocked(&self, host: &str, blocked: bool) -> Result<(), StoreError> {
        self.update(host, |p| p.is_blocked = blocked)
    }

    pub fn set_trust(&self, host: &str, trust_level: f64) -> Result<(), StoreError> {
        self.update(host, |p| p.trust_level = trust_level.clamp(0.0, 1.0))
    }

    fn update(&self, host: &str, apply: impl FnOnce(&mut PeerRecord)) -> Result<(), StoreError> {
        let host = canonical(host)?;
        let Some(raw) = self.tree.get(host.as_bytes())? else {
            return Ok(());
        };
        let mut record = decode(&raw)?;
        apply(&mut record);
        self.tree.insert(host.as_bytes(), encode(&record)?)?;
        Ok(())
    }

    fn iter_all(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let mut peers = Vec::new();
        for item in self.tree.iter() {
            let (_, raw) = item?;
            match decode(&raw) {
                Ok(record) => peers.push(record),
                Err(err) => warn!("skipping undecodable peer record: {err}"),
            }
        }
        Ok(peers)
    }
}

#[async_trait]
impl PeerResolver for PeerDirectory {
    async fn list_peers(&self) -> Vec<String> {
        self.active_hosts().unwrap_or_default()
    }
}

fn canonical(host: &str) -> Result<String, StoreError> {
    normalize_host(host).ok_or_else(|| StoreError::InvalidHost(host.to_string()))
}

fn encode(record: &PeerRecord) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(record).map_err(|err| StoreError::Codec(err.to_string()))
}

fn decode(raw: &[u8]) -> Result<PeerRecord, StoreError> {
    serde_json::from_slice(raw).map_err(|err| StoreError::Codec(err.to_string()))
}
