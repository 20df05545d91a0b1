//! Replication coverage engine
//!
//! Decides whether a file is under-replicated across the known network
//! and pulls it locally when it is. Coverage only counts holders that
//! answer a liveness probe within the latency budget; a download is
//! accepted only after the owner's signature, the advertised size, the
//! advertised hash, and the recomputed digest of the received bytes all
//! check out.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{NewResource, PeerDirectory, ResourceCatalog, StoreError};
use crate::config::Config;
use crate::crypto::content_hash;
use crate::files::{FileStore, FileStoreError};
use crate::net::host::normalize_host;
use crate::protocol::{self, KeySource, ProtocolError};
use crate::sync::discovery::DISCOVER_PATH;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("peer {0} answered with an error response")]
    Rejected(String),
    #[error("no stored key for peer {0}")]
    UnknownPeer(String),
    #[error("metadata from {0} failed signature verification")]
    Verification(String),
    #[error("metadata from {0} is incomplete")]
    IncompleteMetadata(String),
    #[error("peer advertises hash {advertised}, requested {requested}")]
    HashMismatch {
        requested: String,
        advertised: String,
    },
    #[error("advertised size {size_bytes} exceeds the {max_bytes} byte limit")]
    TooLarge { size_bytes: u64, max_bytes: u64 },
    #[error("downloaded bytes hash to {actual}, expected {expected}")]
    Integrity { expected: String, actual: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Files(#[from] FileStoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Whether a file should be pulled locally, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    pub should_replicate: bool,
    /// reachable holders / known non-blocked peers, as a percentage.
    pub coverage_percent: u32,
}

/// Answers whether a host is alive, and how fast.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, host: &str) -> Option<Duration>;
}

/// Probes a host's discovery path over HTTP and reports the round trip.
pub struct HttpProbe {
    config: Arc<Config>,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self, host: &str) -> Option<Duration> {
        let url = self.config.peer_url(host, DISCOVER_PATH);
        let started = Instant::now();
        let response = self
            .client
            .get(&url)
            .timeout(self.config.ping_budget())
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        Some(started.elapsed())
    }
}

pub struct ReplicationEngine {
    config: Arc<Config>,
    peers: Arc<PeerDirectory>,
    resources: Arc<ResourceCatalog>,
    files: Arc<FileStore>,
    probe: Arc<dyn LivenessProbe>,
    client: reqwest::Client,
}

impl ReplicationEngine {
    pub fn new(
        config: Arc<Config>,
        peers: Arc<PeerDirectory>,
        resources: Arc<ResourceCatalog>,
        files: Arc<FileStore>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            config,
            peers,
            resources,
            files,
            probe,
            client: reqwest::Client::new(),
        }
    }

    /// Measure how much of the reachable network holds `file_hash` and
    /// recommend replication while coverage sits at or below the target.
    pub async fn should_replicate(&self, file_hash: &str) -> Result<Coverage, ReplicationError> {
        if !self.config.sync.files.enabled {
            debug!("file replication is turned off");
            return Ok(Coverage {
                should_replicate: false,
                coverage_percent: 0,
            });
        }

        let total_peers = self.peers.count_active()?;
        if total_peers == 0 {
            // nobody to pull from, nothing to measure against
            return Ok(Coverage {
                should_replicate: false,
                coverage_percent: 0,
            });
        }

        let holders = self.resources.hosts_for_hash(file_hash)?;
        let budget = self.config.ping_budget();
        let probes = holders.iter().map(|host| {
            let probe = Arc::clone(&self.probe);
            async move { probe.probe(host).await }
        });
        let reachable = join_all(probes)
            .await
            .into_iter()
            .flatten()
            .filter(|latency| *latency < budget)
            .count();

        let coverage_percent =
            ((reachable as f64 / total_peers as f64) * 100.0).round() as u32;
        Ok(Coverage {
            should_replicate: coverage_percent <= self.config.sync.files.coverage_target_percent,
            coverage_percent,
        })
    }

    /// Pull one file from the peer that owns it, verifying everything the
    /// peer claims before bytes touch the store. Returns the stored path,
    /// or `None` when there was nothing to do.
    pub async fn download_from(
        &self,
        host: &str,
        file_hash: &str,
    ) -> Result<Option<PathBuf>, ReplicationError> {
        let Some(host) = normalize_host(host) else {
            return Err(ReplicationError::UnknownPeer(host.to_string()));
        };
        if host == self.config.host {
            return Ok(None);
        }
        let file_hash = file_hash.to_ascii_lowercase();

        // metadata first
        let url = self
            .config
            .peer_url(&host, &format!("/file/{file_hash}/json"));
        let response = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|err| ReplicationError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ReplicationError::Transport(format!(
                "{host} answered {} for metadata",
                response.status()
            )));
        }
        let meta: Value = response
            .json()
            .await
            .map_err(|err| ReplicationError::Transport(err.to_string()))?;
        if meta.get("ok").and_then(Value::as_bool) == Some(false) {
            return Err(ReplicationError::Rejected(host));
        }

        // the verification key is the one we stored at discovery time,
        // never one the response carries
        let peer = self
            .peers
            .get(&host)?
            .ok_or_else(|| ReplicationError::UnknownPeer(host.clone()))?;
        let verified = protocol::verify(&meta, KeySource::Fixed(&peer.public_key), None)
            .await?
            .all_valid();
        if !verified {
            warn!("file metadata from {host} failed verification");
            return Err(ReplicationError::Verification(host));
        }

        let advertised_hash = meta.get("file_hash").and_then(Value::as_str);
        let hash_ref = meta.get("hash_ref").and_then(Value::as_str);
        let size_bytes = meta.get("size_bytes").and_then(Value::as_u64);
        let (Some(advertised_hash), Some(hash_ref), Some(size_bytes)) =
            (advertised_hash, hash_ref, size_bytes)
        else {
            return Err(ReplicationError::IncompleteMetadata(host));
        };

        let max_bytes = self.config.max_file_bytes();
        if size_bytes > max_bytes {
            return Err(ReplicationError::TooLarge {
                size_bytes,
                max_bytes,
            });
        }
        if !advertised_hash.eq_ignore_ascii_case(&file_hash) {
            // an owner advertising a different hash under this path is a
            // trust signal, not a transport hiccup
            warn!("{host} advertises a different hash for {file_hash}");
            return Err(ReplicationError::HashMismatch {
                requested: file_hash,
                advertised: advertised_hash.to_string(),
            });
        }

        if self.files.exists(hash_ref).await? {
            debug!("{hash_ref} already stored, skipping download");
            return Ok(None);
        }

        let url = self
            .config
            .peer_url(&host, &format!("/file/{file_hash}/download"));
        let response = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout())
            .send()
            .await
            .map_err(|err| ReplicationError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ReplicationError::Transport(format!(
                "{host} answered {} for download",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ReplicationError::Transport(err.to_string()))?;

        let actual = content_hash(&bytes);
        if actual != file_hash {
            return Err(ReplicationError::Integrity {
                expected: file_hash,
                actual,
            });
        }

        let mime = meta
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream");
        let title = meta.get("title").and_then(Value::as_str);

        let Some(path) = self.files.save_new(hash_ref, &bytes).await? else {
            return Ok(None);
        };

        // record the local replica in the catalog
        self.resources.upsert(
            NewResource {
                host: self.config.host.clone(),
                file_hash: file_hash.clone(),
                hash_ref: hash_ref.to_string(),
                size_bytes: bytes.len() as u64,
                mime: mime.to_string(),
                title: title.map(str::to_string),
            },
            false,
        )?;

        info!("replicated {file_hash} from {host}");
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::UpsertOutcome;
    use crate::crypto::NodeIdentity;
    use crate::net::testserver::{self, Reply};
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::tempdir;

    const SELF_HOST: &str = "self.example.com";

    struct StubProbe(HashMap<String, Duration>);

    #[async_trait]
    impl LivenessProbe for StubProbe {
        async fn probe(&self, host: &str) -> Option<Duration> {
            self.0.get(host).copied()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        peers: Arc<PeerDirectory>,
        resources: Arc<ResourceCatalog>,
        files: Arc<FileStore>,
        engine: ReplicationEngine,
    }

    fn fixture_with(probe: StubProbe, max_size_mb: u64) -> Fixture {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();

        let mut config = Config::default();
        config.host = SELF_HOST.to_string();
        config.network.insecure_http = true;
        config.network.timeout_ms = 2_000;
        config.sync.files.max_size_mb = max_size_mb;
        let config = Arc::new(config);

        let peers = Arc::new(PeerDirectory::open(&db).unwrap());
        let resources = Arc::new(ResourceCatalog::open(&db, SELF_HOST).unwrap());
        let files = Arc::new(FileStore::open(dir.path().join("files"), 1 << 30).unwrap());
        let engine = ReplicationEngine::new(
            Arc::clone(&config),
            Arc::clone(&peers),
            Arc::clone(&resources),
            Arc::clone(&files),
            Arc::new(probe),
        );
        Fixture {
            _dir: dir,
            peers,
            resources,
            files,
            engine,
        }
    }

    fn add_resource(f: &Fixture, host: &str, hash: &str) {
        let outcome = f
            .resources
            .upsert(
                NewResource {
                    host: host.to_string(),
                    file_hash: hash.to_string(),
                    hash_ref: format!("{hash}.bin"),
                    size_bytes: 4,
                    mime: "text/plain".to_string(),
                    title: None,
                },
                false,
            )
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Inserted(_)));
    }

    #[tokio::test]
    async fn test_coverage_counts_only_reachable_holders() {
        let hash = content_hash(b"data");
        let mut latencies = HashMap::new();
        latencies.insert("a.example.com".to_string(), Duration::from_millis(20));
        // b never answers; c answers too slowly
        latencies.insert("c.example.com".to_string(), Duration::from_millis(900));
        let f = fixture_with(StubProbe(latencies), 200);

        for host in ["a.example.com", "b.example.com", "c.example.com", "d.example.com"] {
            f.peers.insert_if_absent(host, "key").unwrap();
        }
        for host in ["a.example.com", "b.example.com", "c.example.com"] {
            add_resource(&f, host, &hash);
        }

        // 1 reachable holder out of 4 known peers = 25%
        let coverage = f.engine.should_replicate(&hash).await.unwrap();
        assert_eq!(coverage.coverage_percent, 25);
        assert!(coverage.should_replicate);
    }

    #[tokio::test]
    async fn test_high_coverage_needs_no_replication() {
        let hash = content_hash(b"data");
        let mut latencies = HashMap::new();
        latencies.insert("a.example.com".to_string(), Duration::from_millis(10));
        latencies.insert("b.example.com".to_string(), Duration::from_millis(10));
        let f = fixture_with(StubProbe(latencies), 200);

        f.peers.insert_if_absent("a.example.com", "key").unwrap();
        f.peers.insert_if_absent("b.example.com", "key").unwrap();
        add_resource(&f, "a.example.com", &hash);
        add_resource(&f, "b.example.com", &hash);

        let coverage = f.engine.should_replicate(&hash).await.unwrap();
        assert_eq!(coverage.coverage_percent, 100);
        assert!(!coverage.should_replicate);
    }

    #[tokio::test]
    async fn test_no_known_peers_means_no_replication() {
        let f = fixture_with(StubProbe(HashMap::new()), 200);
        let coverage = f
            .engine
            .should_replicate(&content_hash(b"x"))
            .await
            .unwrap();
        assert_eq!(
            coverage,
            Coverage {
                should_replicate: false,
                coverage_percent: 0
            }
        );
    }

    fn signed_meta(signer: &NodeIdentity, hash: &str, size: u64) -> Value {
        let mut meta = json!({
            "ok": true,
            "file_hash": hash,
            "hash_ref": format!("{hash}.bin"),
            "size_bytes": size,
            "type": "text/plain",
            "title": "shared file",
        });
        protocol::sign(&mut meta, signer, None).unwrap();
        meta
    }

    async fn serve_file(meta: Value, bytes: &'static [u8]) -> std::net::SocketAddr {
        testserver::spawn(move |_, path| {
            if path.ends_with("/json") {
                Reply::json(200, meta.clone())
            } else {
                Reply::text(200, std::str::from_utf8(bytes).unwrap())
            }
        })
        .await
    }

    #[tokio::test]
    async fn test_download_verifies_and_stores() {
        let body: &[u8] = b"file contents";
        let hash = content_hash(body);
        let signer =
            NodeIdentity::load_or_create(&tempdir().unwrap().path().join("peer.pem")).unwrap();
        let meta = signed_meta(&signer, &hash, body.len() as u64);
        let addr = serve_file(meta, body).await;
        let host = addr.to_string();

        let f = fixture_with(StubProbe(HashMap::new()), 200);
        f.peers
            .insert_if_absent(&host, signer.public_key_pem())
            .unwrap();

        let path = f.engine.download_from(&host, &hash).await.unwrap().unwrap();
        assert!(path.exists());
        assert!(f.files.exists(&format!("{hash}.bin")).await.unwrap());

        // the local replica is now cataloged
        let record = f.resources.get(SELF_HOST, &hash).unwrap().unwrap();
        assert_eq!(record.size_bytes, body.len() as u64);

        // a second pull is a no-op
        let again = f.engine.download_from(&host, &hash).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_download_refuses_advertised_hash_mismatch() {
        let body: &[u8] = b"file contents";
        let requested = content_hash(b"something else");
        let signer =
            NodeIdentity::load_or_create(&tempdir().unwrap().path().join("peer.pem")).unwrap();
        // metadata advertises the hash of `body`, not what we ask for
        let meta = signed_meta(&signer, &content_hash(body), body.len() as u64);
        let addr = serve_file(meta, body).await;
        let host = addr.to_string();

        let f = fixture_with(StubProbe(HashMap::new()), 200);
        f.peers
            .insert_if_absent(&host, signer.public_key_pem())
            .unwrap();

        let result = f.engine.download_from(&host, &requested).await;
        assert!(matches!(result, Err(ReplicationError::HashMismatch { .. })));
        assert!(!f
            .files
            .exists(&format!("{}.bin", content_hash(body)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_download_refuses_oversize_file() {
        let body: &[u8] = b"file contents";
        let hash = content_hash(body);
        let signer =
            NodeIdentity::load_or_create(&tempdir().unwrap().path().join("peer.pem")).unwrap();
        // max size 0 MB: everything is too large
        let meta = signed_meta(&signer, &hash, body.len() as u64);
        let addr = serve_file(meta, body).await;
        let host = addr.to_string();

        let f = fixture_with(StubProbe(HashMap::new()), 0);
        f.peers
            .insert_if_absent(&host, signer.public_key_pem())
            .unwrap();

        let result = f.engine.download_from(&host, &hash).await;
        assert!(matches!(result, Err(ReplicationError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_download_refuses_bad_signature() {
        let body: &[u8] = b"file contents";
        let hash = content_hash(body);
        let signer =
            NodeIdentity::load_or_create(&tempdir().unwrap().path().join("peer.pem")).unwrap();
        let impostor =
            NodeIdentity::load_or_create(&tempdir().unwrap().path().join("other.pem")).unwrap();
        let meta = signed_meta(&impostor, &hash, body.len() as u64);
        let addr = serve_file(meta, body).await;
        let host = addr.to_string();

        let f = fixture_with(StubProbe(HashMap::new()), 200);
        // we know the real signer's key; the response is signed by someone else
        f.peers
            .insert_if_absent(&host, signer.public_key_pem())
            .unwrap();

        let result = f.engine.download_from(&host, &hash).await;
        assert!(matches!(result, Err(ReplicationError::Verification(_))));
    }

    #[tokio::test]
    async fn test_download_refuses_unknown_peer() {
        let body: &[u8] = b"file contents";
        let hash = content_hash(body);
        let signer =
            NodeIdentity::load_or_create(&tempdir().unwrap().path().join("peer.pem")).unwrap();
        let meta = signed_meta(&signer, &hash, body.len() as u64);
        let addr = serve_file(meta, body).await;

        let f = fixture_with(StubProbe(HashMap::new()), 200);
        // the host was never discovered, so there is no stored key
        let result = f.engine.download_from(&addr.to_string(), &hash).await;
        assert!(matches!(result, Err(ReplicationError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_download_rejects_corrupted_bytes() {
        let advertised: &[u8] = b"what the peer promised";
        let served: &[u8] = b"what the peer sent....";
        let hash = content_hash(advertised);
        let signer =
            NodeIdentity::load_or_create(&tempdir().unwrap().path().join("peer.pem")).unwrap();
        let meta = signed_meta(&signer, &hash, advertised.len() as u64);
        let addr = serve_file(meta, served).await;
        let host = addr.to_string();

        let f = fixture_with(StubProbe(HashMap::new()), 200);
        f.peers
            .insert_if_absent(&host, signer.public_key_pem())
            .unwrap();

        let result = f.engine.download_from(&host, &hash).await;
        assert!(matches!(result, Err(ReplicationError::Integrity { .. })));
        // the corrupt payload never reached the store
        assert!(!f.files.exists(&format!("{hash}.bin")).await.unwrap());
    }

    #[tokio::test]
    async fn test_download_from_self_is_skipped() {
        let f = fixture_with(StubProbe(HashMap::new()), 200);
        let result = f
            .engine
            .download_from(SELF_HOST, &content_hash(b"x"))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
