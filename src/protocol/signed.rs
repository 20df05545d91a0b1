//! Detachable signatures on JSON payloads
//!
//! A signed value carries a `sig` field computed over everything except
//! the `sig` field itself. Targets may be addressed inside a larger
//! document with a path (`items[2].meta`). Arrays are signed and verified
//! element-wise, and re-signing a partially signed batch only fills the
//! gaps.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::crypto::{verify_value, NodeIdentity};

/// Field name carrying the detached signature.
pub const SIG_FIELD: &str = "sig";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("target must be an object or an array")]
    InvalidTarget,
}

/// Where verification keys come from.
pub enum KeySource<'a> {
    /// One key for every item.
    Fixed(&'a str),
    /// Per-item lookup, e.g. a different signer per catalog row.
    Resolver(&'a (dyn KeyResolver + Send + Sync)),
}

/// Per-item verification key lookup.
#[async_trait]
pub trait KeyResolver {
    /// Return the PEM key for `item`, or `None` when no key is known.
    /// `root` is the document the item was resolved from.
    async fn resolve(&self, item: &Value, root: &Value) -> Option<String>;
}

/// Result of verifying a target: one verdict for an object, one per
/// element for an array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Single(bool),
    Batch(Vec<bool>),
}

impl Verification {
    /// True when every verdict passed (and there was at least one).
    pub fn all_valid(&self) -> bool {
        match self {
            Verification::Single(ok) => *ok,
            Verification::Batch(items) => !items.is_empty() && items.iter().all(|ok| *ok),
        }
    }
}

/// Sign `target` (or the sub-value at `path`) in place.
///
/// Objects that already carry a `sig` are left untouched. An
/// unresolvable path is a no-op. A scalar target is caller misuse.
pub fn sign(
    target: &mut Value,
    identity: &NodeIdentity,
    path: Option<&str>,
) -> Result<(), ProtocolError> {
    let resolved = match path {
        Some(p) => match resolve_path_mut(target, p) {
            Some(v) => v,
            None => return Ok(()),
        },
        None => target,
    };

    match resolved {
        Value::Array(items) => {
            for item in items.iter_mut() {
                let Value::Object(map) = item else { continue };
                if map.contains_key(SIG_FIELD) {
                    continue;
                }
                let sig = identity.sign_value(&without_sig(map));
                map.insert(SIG_FIELD.to_string(), Value::String(sig));
            }
            Ok(())
        }
        Value::Object(map) => {
            if !map.contains_key(SIG_FIELD) {
                let sig = identity.sign_value(&without_sig(map));
                map.insert(SIG_FIELD.to_string(), Value::String(sig));
            }
            Ok(())
        }
        _ => Err(ProtocolError::InvalidTarget),
    }
}

/// Verify `target` (or the sub-value at `path`).
///
/// A missing `sig`, an unresolvable key, and a failed cryptographic check
/// all yield `false` verdicts rather than errors; only a scalar target
/// raises. An unresolvable path verifies as `Single(false)`.
pub async fn verify(
    target: &Value,
    keys: KeySource<'_>,
    path: Option<&str>,
) -> Result<Verification, ProtocolError> {
    let resolved = match path {
        Some(p) => match resolve_path(target, p) {
            Some(v) => v,
            None => return Ok(Verification::Single(false)),
        },
        None => target,
    };

    match resolved {
        Value::Array(items) => {
            let mut verdicts = Vec::with_capacity(items.len());
            for item in items {
                verdicts.push(verify_item(item, target, &keys).await);
            }
            Ok(Verification::Batch(verdicts))
        }
        Value::Object(_) => Ok(Verification::Single(
            verify_item(resolved, target, &keys).await,
        )),
        _ => Err(ProtocolError::InvalidTarget),
    }
}

async fn verify_item(item: &Value, root: &Value, keys: &KeySource<'_>) -> bool {
    let Value::Object(map) = item else {
        return false;
    };
    let Some(Value::String(sig)) = map.get(SIG_FIELD) else {
        return false;
    };
    let key = match keys {
        KeySource::Fixed(pem) => Some((*pem).to_string()),
        KeySource::Resolver(resolver) => resolver.resolve(item, root).await,
    };
    let Some(key) = key else {
        return false;
    };
    verify_value(&without_sig(map), sig, &key)
}

fn without_sig(map: &Map<String, Value>) -> Value {
    let mut copy = map.clone();
    copy.remove(SIG_FIELD);
    Value::Object(copy)
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse `a.b[2].c` into key and index segments.
fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut digits = String::new();
                while let Some(d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(*d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() == Some(&']') {
                    chars.next();
                }
                if let Ok(idx) = digits.parse() {
                    segments.push(Segment::Index(idx));
                }
            }
            ']' => {}
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }
    segments
}

fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in parse_path(path) {
        current = match segment {
            Segment::Key(k) => current.get(&k)?,
            Segment::Index(i) => current.get(i)?,
        };
    }
    Some(current)
}

fn resolve_path_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in parse_path(path) {
        current = match segment {
            Segment::Key(k) => current.get_mut(&k)?,
            Segment::Index(i) => current.get_mut(i)?,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_identity() -> NodeIdentity {
        let dir = tempdir().unwrap();
        NodeIdentity::load_or_create(&dir.path().join("id.pem")).unwrap()
    }

    #[test]
    fn test_parse_path_segments() {
        assert_eq!(
            parse_path("items[2].meta"),
            vec![
                Segment::Key("items".into()),
                Segment::Index(2),
                Segment::Key("meta".into())
            ]
        );
        assert_eq!(parse_path("a.b"), vec![Segment::Key("a".into()), Segment::Key("b".into())]);
    }

    #[tokio::test]
    async fn test_sign_and_verify_object() {
        let identity = test_identity();
        let mut doc = json!({"title": "x", "size": 1});

        sign(&mut doc, &identity, None).unwrap();
        assert!(doc.get(SIG_FIELD).is_some());

        let result = verify(&doc, KeySource::Fixed(identity.public_key_pem()), None)
            .await
            .unwrap();
        assert_eq!(result, Verification::Single(true));
    }

    #[tokio::test]
    async fn test_tampered_field_fails() {
        let identity = test_identity();
        let mut doc = json!({"title": "x", "size": 1});
        sign(&mut doc, &identity, None).unwrap();

        doc["size"] = json!(2);
        let result = verify(&doc, KeySource::Fixed(identity.public_key_pem()), None)
            .await
            .unwrap();
        assert_eq!(result, Verification::Single(false));
    }

    #[tokio::test]
    async fn test_array_signing_fills_gaps_only() {
        let identity = test_identity();
        let mut batch = json!([{"a": 1}, {"a": 2}, "scalar"]);
        sign(&mut batch, &identity, None).unwrap();

        let existing = batch[0][SIG_FIELD].clone();
        batch[1]["a"] = json!(20);
        // strip the second signature so a re-sign only touches that slot
        batch[1].as_object_mut().unwrap().remove(SIG_FIELD);
        sign(&mut batch, &identity, None).unwrap();

        assert_eq!(batch[0][SIG_FIELD], existing);
        assert!(batch[1].get(SIG_FIELD).is_some());
        assert!(batch[2].get(SIG_FIELD).is_none());

        let result = verify(&batch, KeySource::Fixed(identity.public_key_pem()), None)
            .await
            .unwrap();
        assert_eq!(result, Verification::Batch(vec![true, true, false]));
    }

    #[tokio::test]
    async fn test_nested_path_target() {
        let identity = test_identity();
        let mut doc = json!({"payload": {"items": [{"n": 1}]}});

        sign(&mut doc, &identity, Some("payload.items[0]")).unwrap();
        assert!(doc["payload"]["items"][0].get(SIG_FIELD).is_some());

        let result = verify(
            &doc,
            KeySource::Fixed(identity.public_key_pem()),
            Some("payload.items[0]"),
        )
        .await
        .unwrap();
        assert_eq!(result, Verification::Single(true));
    }

    #[tokio::test]
    async fn test_unresolvable_path_is_noop_and_false() {
        let identity = test_identity();
        let mut doc = json!({"a": 1});
        sign(&mut doc, &identity, Some("missing.path")).unwrap();
        assert_eq!(doc, json!({"a": 1}));

        let result = verify(
            &doc,
            KeySource::Fixed(identity.public_key_pem()),
            Some("missing.path"),
        )
        .await
        .unwrap();
        assert_eq!(result, Verification::Single(false));
    }

    #[tokio::test]
    async fn test_scalar_target_is_misuse() {
        let identity = test_identity();
        let mut doc = json!(42);
        assert!(matches!(
            sign(&mut doc, &identity, None),
            Err(ProtocolError::InvalidTarget)
        ));
        assert!(matches!(
            verify(&doc, KeySource::Fixed("pem"), None).await,
            Err(ProtocolError::InvalidTarget)
        ));
    }

    #[tokio::test]
    async fn test_missing_sig_is_false_not_error() {
        let result = verify(&json!({"a": 1}), KeySource::Fixed("pem"), None)
            .await
            .unwrap();
        assert_eq!(result, Verification::Single(false));
    }

    struct MapResolver(std::collections::HashMap<String, String>);

    #[async_trait]
    impl KeyResolver for MapResolver {
        async fn resolve(&self, item: &Value, _root: &Value) -> Option<String> {
            let signer = item.get("signer")?.as_str()?;
            self.0.get(signer).cloned()
        }
    }

    #[tokio::test]
    async fn test_per_item_key_resolution() {
        let alice = test_identity();
        let bob = test_identity();

        let mut batch = json!([{"signer": "alice", "n": 1}, {"signer": "bob", "n": 2}]);
        // sign each row with its own identity
        sign(&mut batch, &alice, Some("[0]")).unwrap();
        sign(&mut batch, &bob, Some("[1]")).unwrap();

        let mut keys = std::collections::HashMap::new();
        keys.insert("alice".to_string(), alice.public_key_pem().to_string());
        keys.insert("bob".to_string(), bob.public_key_pem().to_string());
        let resolver = MapResolver(keys);

        let result = verify(&batch, KeySource::Resolver(&resolver), None)
            .await
            .unwrap();
        assert_eq!(result, Verification::Batch(vec![true, true]));

        // unresolved signer fails closed
        let mut unknown = json!([{"signer": "mallory", "n": 3}]);
        sign(&mut unknown, &alice, None).unwrap();
        let result = verify(&unknown, KeySource::Resolver(&resolver), None)
            .await
            .unwrap();
        assert_eq!(result, Verification::Batch(vec![false]));
    }
}
