//! Cryptographic identity and payload protection
//!
//! - Canonical serialization so signatures survive key reordering
//! - A persistent ed25519 node identity for signing and verification
//! - Hybrid envelopes for sensitive payloads
//! - Short-lived one-time tokens

pub mod canonical;
pub mod envelope;
pub mod identity;
pub mod token;

pub use canonical::{canonicalize, payload_bytes, to_canonical_string};
pub use envelope::{decrypt, encrypt, Envelope, EnvelopeError, Recipient};
pub use identity::{is_usable_public_key, verify_value, IdentityError, NodeIdentity};
pub use token::TokenStore;

use sha2::{Digest, Sha256};

/// Lowercase hex sha256 digest, the network's content-hash format.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether a string is a well-formed content hash (64 lowercase hex chars).
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64
        && hash
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}
