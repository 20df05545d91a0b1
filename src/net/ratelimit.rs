//! Sliding-window rate limiting
//!
//! Requests are counted per client address and per request signature
//! (`"METHOD path"`), each with an independent fixed window. A request is
//! rejected when either counter exceeds its limit; the address limit wins
//! for reporting. Abuse reports are debounced per address per window and
//! published off the hot path. Expired windows are swept on a small random
//! fraction of checks instead of a dedicated timer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const SWEEP_PROBABILITY: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub ip_limit: u32,
    pub signature_limit: u32,
    /// Take the client address from the first `X-Forwarded-For` entry.
    pub trust_proxy: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            ip_limit: 30,
            signature_limit: 120,
            trust_proxy: true,
        }
    }
}

/// Which counter rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Address,
    Signature,
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub blocked_by: Option<LimitKind>,
    pub ip: String,
    pub signature: String,
    pub ip_remaining: u32,
    pub signature_remaining: u32,
    /// Time until the relevant window resets.
    pub retry_after: Duration,
}

/// Emitted at most once per address per window when the address limit
/// trips.
#[derive(Debug, Clone)]
pub struct AbuseReport {
    pub ip: String,
    pub signature: String,
    pub method: String,
    pub path: String,
    pub count: u32,
}

struct Window {
    count: u32,
    reset_at: Instant,
}

#[derive(Default)]
struct State {
    by_ip: HashMap<String, Window>,
    by_signature: HashMap<String, Window>,
    triggered: HashMap<String, Instant>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<State>,
    events: broadcast::Sender<AbuseReport>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Subscribe to abuse reports. Sends never block request handling.
    pub fn subscribe(&self) -> broadcast::Receiver<AbuseReport> {
        self.events.subscribe()
    }

    /// Resolve the accountable client address.
    pub fn client_ip(&self, remote_addr: &str, forwarded_for: Option<&str>) -> String {
        if self.config.trust_proxy {
            if let Some(chain) = forwarded_for {
                if let Some(first) = chain.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return first.to_string();
                    }
                }
            }
        }
        if remote_addr.is_empty() {
            "unknown".to_string()
        } else {
            remote_addr.to_string()
        }
    }

    /// Count a request against both windows and decide whether to admit it.
    pub fn check(
        &self,
        remote_addr: &str,
        forwarded_for: Option<&str>,
        method: &str,
        path: &str,
    ) -> RateDecision {
        let ip = self.client_ip(remote_addr, forwarded_for);
        let signature = format!("{method} {path}");
        let now = Instant::now();
        let window = self.config.window;

        let mut guard = self.state.lock().expect("rate limiter lock poisoned");
        let state = &mut *guard;

        if rand::random::<f64>() < SWEEP_PROBABILITY {
            state.by_ip.retain(|_, w| w.reset_at > now);
            state.by_signature.retain(|_, w| w.reset_at > now);
            state.triggered.retain(|_, reset| *reset > now);
        }

        let (ip_count, ip_reset) = touch(&mut state.by_ip, &ip, now, window);
        let (sig_count, sig_reset) = touch(&mut state.by_signature, &signature, now, window);

        let ip_remaining = self.config.ip_limit.saturating_sub(ip_count);
        let signature_remaining = self.config.signature_limit.saturating_sub(sig_count);

        if ip_count > self.config.ip_limit {
            let debounced = state
                .triggered
                .get(&ip)
                .is_some_and(|reset| *reset > now);
            if !debounced {
                state.triggered.insert(ip.clone(), ip_reset);
                let _ = self.events.send(AbuseReport {
                    ip: ip.clone(),
                    signature: signature.clone(),
                    method: method.to_string(),
                    path: path.to_string(),
                    count: ip_count,
                });
            }
            return RateDecision {
                allowed: false,
                blocked_by: Some(LimitKind::Address),
                ip,
                signature,
                ip_remaining,
                signature_remaining,
                retry_after: ip_reset.saturating_duration_since(now),
            };
        }

        if sig_count > self.config.signature_limit {
            return RateDecision {
                allowed: false,
                blocked_by: Some(LimitKind::Signature),
                ip,
                signature,
                ip_remaining,
                signature_remaining,
                retry_after: sig_reset.saturating_duration_since(now),
            };
        }

        RateDecision {
            allowed: true,
            blocked_by: None,
            ip,
            signature,
            ip_remaining,
            signature_remaining,
            retry_after: ip_reset.saturating_duration_since(now),
        }
    }
}

fn touch(
    map: &mut HashMap<String, Window>,
    key: &str,
    now: Instant,
    window: Duration,
) -> (u32, Instant) {
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Window {
            count: 0,
            reset_at: now + window,
        });
    if now >= entry.reset_at {
        entry.count = 0;
        entry.reset_at = now + window;
    }
    entry.count += 1;
    (entry.count, entry.reset_at)
}
