//! Node identity: a long-lived ed25519 keypair
//!
//! The private key is generated once, persisted as PKCS#8 PEM with
//! owner-only permissions, and reused across restarts. It is only
//! regenerated when the persisted material no longer parses.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use super::canonical::payload_bytes;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("key file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("key encoding error: {0}")]
    Encode(String),
}

/// The node's signing identity.
pub struct NodeIdentity {
    signing: SigningKey,
    public_pem: String,
}

impl NodeIdentity {
    /// Load the identity from `path`, generating and persisting a fresh
    /// keypair when the file is missing or unparseable.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if let Ok(pem) = fs::read_to_string(path) {
            match SigningKey::from_pkcs8_pem(&pem) {
                Ok(signing) => return Self::from_signing_key(signing),
                Err(err) => {
                    warn!("stored key at {} is unusable ({err}), regenerating", path.display());
                }
            }
        }

        let signing = SigningKey::generate(&mut OsRng);
        let pem = signing
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| IdentityError::Encode(err.to_string()))?;
        fs::write(path, pem.as_bytes())?;
        restrict_permissions(path)?;
        info!("generated new node identity at {}", path.display());

        Self::from_signing_key(signing)
    }

    fn from_signing_key(signing: SigningKey) -> Result<Self, IdentityError> {
        let public_pem = signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| IdentityError::Encode(err.to_string()))?;
        Ok(Self {
            signing,
            public_pem,
        })
    }

    /// SPKI PEM encoding of the public key, as exchanged during discovery.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Sign a value over its canonical serialization, returning base64.
    pub fn sign_value(&self, value: &serde_json::Value) -> String {
        let sig = self.signing.sign(&payload_bytes(value));
        BASE64.encode(sig.to_bytes())
    }

    /// X25519 secret scalar for sealed-envelope key agreement.
    pub(crate) fn agreement_secret_bytes(&self) -> [u8; 32] {
        self.signing.to_scalar_bytes()
    }

    /// X25519 public point for sealed-envelope key agreement.
    pub(crate) fn agreement_public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_montgomery().to_bytes()
    }
}

/// Verify a base64 signature over a value's canonical serialization.
///
/// Fails closed: a malformed key, malformed signature, or failed check all
/// return `false`, never an error.
pub fn verify_value(value: &serde_json::Value, signature_b64: &str, public_key_pem: &str) -> bool {
    let Ok(key) = VerifyingKey::from_public_key_pem(public_key_pem) else {
        return false;
    };
    let Ok(raw) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&raw) else {
        return false;
    };
    key.verify(&payload_bytes(value), &sig).is_ok()
}

/// Whether a PEM string parses as a usable ed25519 public key.
pub fn is_usable_public_key(pem: &str) -> bool {
    VerifyingKey::from_public_key_pem(pem).is_ok()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
