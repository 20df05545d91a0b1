//! Host discovery
//!
//! An unauthenticated probe of a candidate's well-known discovery path.
//! The candidate becomes a peer only when it confirms success, echoes the
//! host we asked for, identifies as a member of this network, and supplies
//! a usable public key. Anything less is silently not-a-peer: no error, no
//! retry, no directory change. Discovery never overwrites the stored key
//! of an already-known peer.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::PeerDirectory;
use crate::config::Config;
use crate::crypto::is_usable_public_key;
use crate::net::host::normalize_host;

/// Identifier this network's nodes answer discovery probes with.
pub const NETWORK_ID: &str = "veilshare";

/// Path probed on candidate hosts.
pub const DISCOVER_PATH: &str = "/sync/discover";

#[derive(Debug, Deserialize)]
struct DiscoverResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    host: Option<String>,
    #[serde(rename = "publicKey", default)]
    public_key: Option<String>,
    #[serde(default)]
    whoami: Option<String>,
}

pub struct Discovery {
    config: Arc<Config>,
    peers: Arc<PeerDirectory>,
    client: reqwest::Client,
}

impl Discovery {
    pub fn new(config: Arc<Config>, peers: Arc<PeerDirectory>) -> Self {
        Self {
            config,
            peers,
            client: reqwest::Client::new(),
        }
    }

    /// The response body this node serves on its own discovery path.
    pub fn handshake_payload(&self, public_key_pem: &str) -> serde_json::Value {
        serde_json::json!({
            "ok": true,
            "host": self.config.host,
            "publicKey": public_key_pem,
            "whoami": NETWORK_ID,
        })
    }

    /// Probe a candidate host and register it when it checks out.
    /// Returns whether the host is an accepted member of the network.
    /// Safe to call for hosts that are already known.
    pub async fn discover_host(&self, host: &str) -> bool {
        let Some(host) = normalize_host(host) else {
            return false;
        };
        if host == self.config.host {
            return false;
        }

        let url = self.config.peer_url(&host, DISCOVER_PATH);
        let response = match self
            .client
            .get(&url)
            .timeout(self.config.request_timeout())
            .send()
            .await
        {
            Ok(r) => r,
            Err(err) => {
                debug!("discovery probe of {host} failed: {err}");
                return false;
            }
        };
        if !response.status().is_success() {
            debug!("discovery probe of {host} answered {}", response.status());
            return false;
        }
        let body: DiscoverResponse = match response.json().await {
            Ok(b) => b,
            Err(err) => {
                debug!("discovery probe of {host} returned garbage: {err}");
                return false;
            }
        };

        if !body.ok {
            return false;
        }
        // the candidate must claim the exact host we probed
        if body.host.as_deref().and_then(normalize_host) != Some(host.clone()) {
            debug!("discovery: {host} echoed a different host");
            return false;
        }
        if body.whoami.as_deref() != Some(NETWORK_ID) {
            debug!("discovery: {host} is not a member of this network");
            return false;
        }
        let Some(public_key) = body.public_key.as_deref().filter(|k| is_usable_public_key(k))
        else {
            debug!("discovery: {host} supplied no usable public key");
            return false;
        };

        match self.peers.insert_if_absent(&host, public_key) {
            Ok(true) => {
                info!("discovered new peer {host}");
                true
            }
            Ok(false) => {
                // already known; the probe still proves liveness
                let _ = self.peers.touch_seen(&host);
                true
            }
            Err(err) => {
                warn!("could not store discovered peer {host}: {err}");
                false
            }
        }
    }
}
