//! veilshare node daemon
//!
//! Wires the stores and engines together, starts the gossip timer and the
//! token purge task, and runs until interrupted.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use veilshare::catalog::{PeerDirectory, ResourceCatalog};
use veilshare::config::Config;
use veilshare::crypto::{NodeIdentity, TokenStore};
use veilshare::files::FileStore;
use veilshare::net::{NetEvent, Network, RateLimiter};
use veilshare::sync::{Discovery, HttpProbe, ReplicationEngine, SyncEngine};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match Config::load("config.json") {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!("cannot start: {err}");
            std::process::exit(1);
        }
    };
    info!("starting veilshare node as {}", config.host);

    let identity = match NodeIdentity::load_or_create(&config.identity_path) {
        Ok(identity) => Arc::new(identity),
        Err(err) => {
            error!("cannot load node identity: {err}");
            std::process::exit(1);
        }
    };

    std::fs::create_dir_all(&config.storage.data_dir).expect("failed to create data directory");
    let db = sled::open(&config.storage.data_dir).expect("failed to open database");
    let peers = Arc::new(PeerDirectory::open(&db).expect("failed to open peer directory"));
    let resources = Arc::new(
        ResourceCatalog::open(&db, &config.host).expect("failed to open resource catalog"),
    );
    let files = Arc::new(
        FileStore::open(&config.storage.files_dir, config.max_storage_bytes())
            .expect("failed to open file store"),
    );

    let tokens = Arc::new(TokenStore::new());
    let _token_purge = tokens.spawn_purge(Duration::from_secs(60));

    let network = Arc::new(Network::new(
        Arc::clone(&peers) as Arc<dyn veilshare::net::PeerResolver>,
        config.network.insecure_http,
    ));
    let mut net_events = network.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = net_events.recv().await {
            match event {
                NetEvent::Delivered { host, path, status, .. } => {
                    debug!("delivered {path} to {host} ({status})")
                }
                NetEvent::Failed { host, path, error, .. } => {
                    debug!("delivery of {path} to {host} failed: {error}")
                }
            }
        }
    });

    let limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
    let mut abuse_reports = limiter.subscribe();
    tokio::spawn(async move {
        while let Ok(report) = abuse_reports.recv().await {
            info!(
                "rate limit tripped by {} on {} ({} hits)",
                report.ip, report.signature, report.count
            );
        }
    });

    let discovery = Arc::new(Discovery::new(Arc::clone(&config), Arc::clone(&peers)));
    // constructed here so a request layer can be handed the full set of
    // components; the gossip timer below is the only self-driving one
    let _replication = Arc::new(ReplicationEngine::new(
        Arc::clone(&config),
        Arc::clone(&peers),
        Arc::clone(&resources),
        Arc::clone(&files),
        Arc::new(HttpProbe::new(Arc::clone(&config))),
    ));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&config),
        Arc::clone(&peers),
        Arc::clone(&resources),
        Arc::clone(&identity),
        Arc::clone(&discovery),
    ));

    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run().await });
    }

    info!(
        "node up: {} peers known, {} cataloged resources",
        peers.count_active().unwrap_or(0),
        resources.count().unwrap_or(0)
    );

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    info!("shutting down");
}
