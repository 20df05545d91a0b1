//! Network fan-out
//!
//! One code path delivers a request to a single peer with a hard timeout
//! and a uniform result that never raises for ordinary network failures.
//! Broadcast drains the current peer list through a bounded worker pool:
//! each worker atomically claims the next unclaimed index, so every peer
//! is contacted exactly once and a slow peer only ever occupies its own
//! worker slot.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

pub use reqwest::Method;

/// Supplies the current peer list; the peer directory is the production
/// implementation.
#[async_trait]
pub trait PeerResolver: Send + Sync {
    async fn list_peers(&self) -> Vec<String>;
}

/// Observable delivery events, consumed off the hot path.
#[derive(Debug, Clone)]
pub enum NetEvent {
    Delivered {
        host: String,
        method: String,
        path: String,
        status: u16,
    },
    Failed {
        host: String,
        method: String,
        path: String,
        error: String,
    },
}

/// A single outbound request.
pub struct Delivery {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            method: Method::POST,
            path: "/".to_string(),
            body: None,
            headers: Vec::new(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Uniform outcome of one delivery.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub host: String,
    pub ok: bool,
    pub status: Option<u16>,
    pub body: Option<String>,
    pub error: Option<String>,
}

/// Broadcast body construction.
#[derive(Clone, Default)]
pub enum BroadcastBody {
    #[default]
    None,
    /// The same payload for every peer; cloned per delivery so no caller
    /// can mutate a broadcast mid-flight.
    Fixed(Value),
    /// Built per peer from its host string.
    PerPeer(Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>),
}

/// A request fanned out to every known peer.
pub struct Broadcast {
    pub method: Method,
    pub path: String,
    pub body: BroadcastBody,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub concurrency: usize,
    /// Invoked once with the complete result set.
    pub on_complete: Option<Box<dyn FnOnce(&[DeliveryResult]) + Send>>,
}

impl Default for Broadcast {
    fn default() -> Self {
        Self {
            method: Method::POST,
            path: "/".to_string(),
            body: BroadcastBody::None,
            headers: Vec::new(),
            timeout: Duration::from_secs(15),
            concurrency: 10,
            on_complete: None,
        }
    }
}

pub struct Network {
    client: reqwest::Client,
    resolver: Arc<dyn PeerResolver>,
    events: broadcast::Sender<NetEvent>,
    scheme: &'static str,
}

impl Network {
    pub fn new(resolver: Arc<dyn PeerResolver>, insecure_http: bool) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            client: reqwest::Client::new(),
            resolver,
            events,
            scheme: if insecure_http { "http" } else { "https" },
        }
    }

    /// Subscribe to delivery events. Lagging subscribers lose old events
    /// rather than slowing deliveries down.
    pub fn subscribe(&self) -> broadcast::Receiver<NetEvent> {
        self.events.subscribe()
    }

    /// Deliver one request to one host. Network failures are reported in
    /// the result, never raised.
    pub async fn deliver(&self, host: &str, delivery: Delivery) -> DeliveryResult {
        let url = format!(
            "{}://{}{}",
            self.scheme,
            host.trim_end_matches('/'),
            delivery.path
        );

        let mut request = self
            .client
            .request(delivery.method.clone(), &url)
            .timeout(delivery.timeout);
        for (name, value) in &delivery.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &delivery.body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let ok = response.status().is_success();
                let body = response.text().await.unwrap_or_default();

                let event = if ok {
                    NetEvent::Delivered {
                        host: host.to_string(),
                        method: delivery.method.to_string(),
                        path: delivery.path.clone(),
                        status,
                    }
                } else {
                    NetEvent::Failed {
                        host: host.to_string(),
                        method: delivery.method.to_string(),
                        path: delivery.path.clone(),
                        error: format!("status {status}"),
                    }
                };
                let _ = self.events.send(event);

                DeliveryResult {
                    host: host.to_string(),
                    ok,
                    status: Some(status),
                    body: Some(body),
                    error: None,
                }
            }
            Err(err) => {
                let error = if err.is_timeout() {
                    "timeout".to_string()
                } else {
                    err.to_string()
                };
                let _ = self.events.send(NetEvent::Failed {
                    host: host.to_string(),
                    method: delivery.method.to_string(),
                    path: delivery.path.clone(),
                    error: error.clone(),
                });
                DeliveryResult {
                    host: host.to_string(),
                    ok: false,
                    status: None,
                    body: None,
                    error: Some(error),
                }
            }
        }
    }

    /// Fan a request out to every resolved peer through a bounded worker
    /// pool, collecting every result instead of short-circuiting.
    pub async fn broadcast(self: &Arc<Self>, broadcast: Broadcast) -> Vec<DeliveryResult> {
        let Broadcast {
            method,
            path,
            body,
            headers,
            timeout,
            concurrency,
            on_complete,
        } = broadcast;

        let peers = self.resolver.list_peers().await;
        if peers.is_empty() {
            if let Some(hook) = on_complete {
                hook(&[]);
            }
            return Vec::new();
        }

        let workers = concurrency.max(1).min(peers.len());
        debug!("broadcasting {} {} to {} peers with {} workers", method, path, peers.len(), workers);

        let peers = Arc::new(peers);
        let cursor = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(Mutex::new(Vec::with_capacity(peers.len())));
        let method = Arc::new(method);
        let path = Arc::new(path);
        let headers = Arc::new(headers);
        let body = Arc::new(body);

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let net = Arc::clone(self);
            let peers = Arc::clone(&peers);
            let cursor = Arc::clone(&cursor);
            let results = Arc::clone(&results);
            let method = Arc::clone(&method);
            let path = Arc::clone(&path);
            let headers = Arc::clone(&headers);
            let body = Arc::clone(&body);

            handles.push(tokio::spawn(async move {
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    if index >= peers.len() {
                        break;
                    }
                    let host = &peers[index];
                    let body = match body.as_ref() {
                        BroadcastBody::None => None,
                        BroadcastBody::Fixed(value) => Some(value.clone()),
                        BroadcastBody::PerPeer(make) => make(host),
                    };
                    let result = net
                        .deliver(
                            host,
                            Delivery {
                                method: (*method).clone(),
                                path: (*path).clone(),
                                body,
                                headers: (*headers).clone(),
                                timeout,
                            },
                        )
                        .await;
                    results.lock().await.push(result);
                }
            }));
        }
        join_all(handles).await;

        let results = Arc::try_unwrap(results)
            .map(|m| m.into_inner())
            .unwrap_or_default();
        if let Some(hook) = on_complete {
            hook(&results);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::testserver::{self, Reply};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct FixedPeers(Vec<String>);

    #[async_trait]
    impl PeerResolver for FixedPeers {
        async fn list_peers(&self) -> Vec<String> {
            self.0.clone()
        }
    }

    fn network(peers: Vec<String>) -> Arc<Network> {
        Arc::new(Network::new(Arc::new(FixedPeers(peers)), true))
    }

    #[tokio::test]
    async fn test_deliver_success_and_event() {
        let addr = testserver::spawn(|_, _| Reply::json(200, json!({"ok": true}))).await;
        let net = network(vec![]);
        let mut events = net.subscribe();

        let result = net
            .deliver(
                &addr.to_string(),
                Delivery {
                    method: Method::GET,
                    path: "/ping".to_string(),
                    timeout: Duration::from_secs(2),
                    ..Delivery::default()
                },
            )
            .await;

        assert!(result.ok);
        assert_eq!(result.status, Some(200));
        assert!(matches!(
            events.recv().await.unwrap(),
            NetEvent::Delivered { status: 200, .. }
        ));
    }

    #[tokio::test]
    async fn test_deliver_reports_connection_failure() {
        let net = network(vec![]);
        // nothing listens on this port
        let result = net
            .deliver(
                "127.0.0.1:1",
                Delivery {
                    method: Method::GET,
                    path: "/".to_string(),
                    timeout: Duration::from_millis(500),
                    ..Delivery::default()
                },
            )
            .await;
        assert!(!result.ok);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_contacts_each_peer_once_bounded() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_in_flight = Arc::new(AtomicU32::new(0));
        let total = Arc::new(AtomicU32::new(0));

        let (gauge, high_water, count) = (
            Arc::clone(&in_flight),
            Arc::clone(&max_in_flight),
            Arc::clone(&total),
        );
        let addr = testserver::spawn(move |_, _| {
            let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
            high_water.fetch_max(now, Ordering::SeqCst);
            count.fetch_add(1, Ordering::SeqCst);
            let gauge = Arc::clone(&gauge);
            Reply::json(200, json!({"ok": true}))
                .after(Duration::from_millis(50))
                .on_done(move || {
                    gauge.fetch_sub(1, Ordering::SeqCst);
                })
        })
        .await;

        let peers: Vec<String> = (0..25).map(|_| addr.to_string()).collect();
        let net = network(peers);

        let results = net
            .broadcast(Broadcast {
                method: Method::GET,
                path: "/item".to_string(),
                concurrency: 5,
                timeout: Duration::from_secs(5),
                ..Broadcast::default()
            })
            .await;

        assert_eq!(results.len(), 25);
        assert_eq!(total.load(Ordering::SeqCst), 25);
        assert!(results.iter().all(|r| r.ok));
        assert!(max_in_flight.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn test_broadcast_slow_peer_times_out_without_blocking() {
        let slow = testserver::spawn(|_, _| Reply::hang()).await;
        let fast = testserver::spawn(|_, _| Reply::json(200, json!({"ok": true}))).await;

        let net = network(vec![slow.to_string(), fast.to_string()]);
        let results = net
            .broadcast(Broadcast {
                method: Method::GET,
                path: "/".to_string(),
                concurrency: 2,
                timeout: Duration::from_millis(300),
                ..Broadcast::default()
            })
            .await;

        assert_eq!(results.len(), 2);
        let slow_result = results.iter().find(|r| r.host == slow.to_string()).unwrap();
        let fast_result = results.iter().find(|r| r.host == fast.to_string()).unwrap();
        assert!(!slow_result.ok);
        assert_eq!(slow_result.error.as_deref(), Some("timeout"));
        assert!(fast_result.ok);
    }

    #[tokio::test]
    async fn test_broadcast_empty_peer_list() {
        let net = network(vec![]);
        let called = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&called);
        let results = net
            .broadcast(Broadcast {
                on_complete: Some(Box::new(move |rs| {
                    assert!(rs.is_empty());
                    flag.store(1, Ordering::SeqCst);
                })),
                ..Broadcast::default()
            })
            .await;
        assert!(results.is_empty());
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_per_peer_body() {
        let addr = testserver::spawn(|_, _| Reply::json(200, json!({"ok": true}))).await;
        let net = network(vec![addr.to_string()]);

        let results = net
            .broadcast(Broadcast {
                method: Method::POST,
                path: "/notify".to_string(),
                body: BroadcastBody::PerPeer(Arc::new(|host| Some(json!({"target": host})))),
                timeout: Duration::from_secs(2),
                ..Broadcast::default()
            })
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].ok);
    }
}
