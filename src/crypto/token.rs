//! One-time tokens
//!
//! Only a one-way hash of each issued token is kept, with an expiry.
//! Verification is expiry-gated and does not consume the token; callers
//! that need strict single-use semantics call [`TokenStore::revoke`] after
//! a successful check. Expired entries are purged on a fixed interval
//! independent of verification traffic.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const MIN_TTL: Duration = Duration::from_secs(1);

struct TokenEntry {
    meta: Option<Value>,
    expires_at: Instant,
}

/// In-memory store of hashed one-time tokens.
pub struct TokenStore {
    entries: Mutex<HashMap<String, TokenEntry>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a token and return its raw form. Only the sha256 of the raw
    /// token is stored. TTLs are clamped to at least one second.
    pub fn issue(&self, ttl: Option<Duration>, meta: Option<Value>) -> String {
        let mut raw_bytes = [0u8; 24];
        OsRng.fill_bytes(&mut raw_bytes);
        let raw = URL_SAFE_NO_PAD.encode(raw_bytes);

        let ttl = ttl.unwrap_or(DEFAULT_TTL).max(MIN_TTL);
        let entry = TokenEntry {
            meta,
            expires_at: Instant::now() + ttl,
        };

        let mut entries = self.entries.lock().expect("token store lock poisoned");
        entries.insert(hash_token(&raw), entry);
        raw
    }

    /// Check a raw token. Unknown, expired, and malformed tokens all fail
    /// closed; an expired entry is dropped when it is seen.
    pub fn verify(&self, raw: &str) -> bool {
        if raw.is_empty() {
            return false;
        }
        let key = hash_token(raw);
        let mut entries = self.entries.lock().expect("token store lock poisoned");
        match entries.get(&key) {
            Some(entry) if entry.expires_at <= Instant::now() => {
                entries.remove(&key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Metadata attached at issue time, when the token is still valid.
    pub fn meta(&self, raw: &str) -> Option<Value> {
        if !self.verify(raw) {
            return None;
        }
        let entries = self.entries.lock().expect("token store lock poisoned");
        entries.get(&hash_token(raw)).and_then(|e| e.meta.clone())
    }

    /// Invalidate a token, returning whether it was present.
    pub fn revoke(&self, raw: &str) -> bool {
        let mut entries = self.entries.lock().expect("token store lock poisoned");
        entries.remove(&hash_token(raw)).is_some()
    }

    /// Drop all expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("token store lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Spawn a background task that purges expired tokens every `every`.
    pub fn spawn_purge(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!("purged {removed} expired tokens");
                }
            }
        })
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_issue_and_verify() {
        let store = TokenStore::new();
        let raw = store.issue(Some(Duration::from_secs(60)), None);
        assert!(store.verify(&raw));
        // verification is not consuming
        assert!(store.verify(&raw));
    }

    #[test]
    fn test_unknown_and_empty_tokens_fail() {
        let store = TokenStore::new();
        assert!(!store.verify("nope"));
        assert!(!store.verify(""));
    }

    #[test]
    fn test_expired_token_fails_and_is_dropped() {
        let store = TokenStore::new();
        let raw = store.issue(Some(Duration::from_secs(1)), None);
        {
            let mut entries = store.entries.lock().unwrap();
            entries.get_mut(&hash_token(&raw)).unwrap().expires_at =
                Instant::now() - Duration::from_secs(1);
        }
        assert!(!store.verify(&raw));
        assert!(store.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_revoke() {
        let store = TokenStore::new();
        let raw = store.issue(None, None);
        assert!(store.revoke(&raw));
        assert!(!store.verify(&raw));
        assert!(!store.revoke(&raw));
    }

    #[test]
    fn test_meta_retrieval() {
        let store = TokenStore::new();
        let raw = store.issue(None, Some(json!({"purpose": "reset"})));
        assert_eq!(store.meta(&raw), Some(json!({"purpose": "reset"})));
        assert_eq!(store.meta("unknown"), None);
    }

    #[test]
    fn test_purge_expired() {
        let store = TokenStore::new();
        let live = store.issue(Some(Duration::from_secs(600)), None);
        let dead = store.issue(Some(Duration::from_secs(1)), None);
        {
            let mut entries = store.entries.lock().unwrap();
            entries.get_mut(&hash_token(&dead)).unwrap().expires_at =
                Instant::now() - Duration::from_secs(1);
        }
        assert_eq!(store.purge_expired(), 1);
        assert!(store.verify(&live));
        assert!(!store.verify(&dead));
    }
}
