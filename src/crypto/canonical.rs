//! Canonical JSON serialization
//!
//! Signatures are computed over bytes, so identical logical content must
//! always serialize to identical bytes. Object keys are ordered
//! recursively before serialization; arrays keep their order.

use serde_json::{Map, Value};

/// Rebuild a value with all object keys in sorted order, recursively.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Serialize a value to its canonical string form.
pub fn to_canonical_string(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).expect("serializing a Value cannot fail")
}

/// The exact byte sequence a value is signed over.
///
/// Plain strings sign as their raw UTF-8 bytes, without JSON quoting, so a
/// signature over `"abc"` matches a signature over the string `abc`.
pub fn payload_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.clone().into_bytes(),
        other => to_canonical_string(other).into_bytes(),
    }
}
