//! Hybrid payload encryption
//!
//! Two envelope methods share one authenticated cipher
//! (XChaCha20-Poly1305, tag carried inside the ciphertext):
//! - `sealed`: an ephemeral x25519 key agreement against the recipient's
//!   identity key wraps a one-off symmetric key
//! - `password`: the symmetric key is derived with Argon2id from a
//!   password and a random salt

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::VerifyingKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use super::canonical::to_canonical_string;
use super::identity::NodeIdentity;

const SEAL_CONTEXT: &str = "veilshare sealed envelope v1";

const METHOD_SEALED: &str = "sealed";
const METHOD_PASSWORD: &str = "password";

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("recipient key is not a usable public key")]
    BadRecipientKey,
    #[error("envelope method `{0}` is not supported")]
    UnknownMethod(String),
    #[error("envelope is missing its `{0}` field")]
    MissingField(&'static str),
    #[error("envelope field `{0}` is malformed")]
    MalformedField(&'static str),
    #[error("password required for password-based decryption")]
    PasswordRequired,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("authentication tag did not verify")]
    TagMismatch,
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Who an envelope is sealed for.
pub enum Recipient<'a> {
    /// An ed25519 public key in SPKI PEM form.
    PublicKey(&'a str),
    /// A shared password.
    Password(&'a str),
}

/// Self-describing encrypted wrapper around a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub method: String,
    /// Ephemeral x25519 public key (base64), `sealed` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epk: Option<String>,
    /// Key-derivation salt (base64), `password` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    pub nonce: String,
    pub ciphertext: String,
}

/// Encrypt a value for the given recipient.
pub fn encrypt(data: &Value, recipient: Recipient<'_>) -> Result<Envelope, EnvelopeError> {
    let plaintext = match data {
        Value::String(s) => s.clone(),
        other => to_canonical_string(other),
    };

    let (key, method, epk, salt) = match recipient {
        Recipient::PublicKey(pem) => {
            let verifying =
                VerifyingKey::from_public_key_pem(pem).map_err(|_| EnvelopeError::BadRecipientKey)?;
            let recipient_point = verifying.to_montgomery().to_bytes();

            let ephemeral = StaticSecret::random_from_rng(OsRng);
            let ephemeral_public = X25519Public::from(&ephemeral);
            let shared = ephemeral.diffie_hellman(&X25519Public::from(recipient_point));

            let key = seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), &recipient_point);
            (
                key,
                METHOD_SEALED,
                Some(BASE64.encode(ephemeral_public.as_bytes())),
                None,
            )
        }
        Recipient::Password(password) => {
            let mut salt = [0u8; 16];
            OsRng.fill_bytes(&mut salt);
            let key = password_key(password, &salt)?;
            (key, METHOD_PASSWORD, None, Some(BASE64.encode(salt)))
        }
    };

    let cipher = XChaCha20Poly1305::new((&*key).into());
    let nonce = XChaCha20Poly1305::generate_nonce(&mut chacha20poly1305::aead::OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| EnvelopeError::EncryptionFailed)?;

    Ok(Envelope {
        method: method.to_string(),
        epk,
        salt,
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Decrypt an envelope, dispatching on its method.
///
/// `sealed` envelopes are opened with the node identity; `password`
/// envelopes require the password that sealed them.
pub fn decrypt(
    envelope: &Envelope,
    identity: &NodeIdentity,
    password: Option<&str>,
) -> Result<Value, EnvelopeError> {
    let key = match envelope.method.as_str() {
        METHOD_SEALED => {
            let epk_b64 = envelope
                .epk
                .as_deref()
                .ok_or(EnvelopeError::MissingField("epk"))?;
            let epk_bytes: [u8; 32] = BASE64
                .decode(epk_b64)
                .map_err(|_| EnvelopeError::MalformedField("epk"))?
                .try_into()
                .map_err(|_| EnvelopeError::MalformedField("epk"))?;

            let secret = StaticSecret::from(identity.agreement_secret_bytes());
            let shared = secret.diffie_hellman(&X25519Public::from(epk_bytes));

            seal_key(
                shared.as_bytes(),
                &epk_bytes,
                &identity.agreement_public_bytes(),
            )
        }
        METHOD_PASSWORD => {
            let password = password.ok_or(EnvelopeError::PasswordRequired)?;
            let salt_b64 = envelope
                .salt
                .as_deref()
                .ok_or(EnvelopeError::MissingField("salt"))?;
            let salt: [u8; 16] = BASE64
                .decode(salt_b64)
                .map_err(|_| EnvelopeError::MalformedField("salt"))?
                .try_into()
                .map_err(|_| EnvelopeError::MalformedField("salt"))?;
            password_key(password, &salt)?
        }
        other => return Err(EnvelopeError::UnknownMethod(other.to_string())),
    };

    let nonce_bytes = BASE64
        .decode(&envelope.nonce)
        .map_err(|_| EnvelopeError::MalformedField("nonce"))?;
    if nonce_bytes.len() != 24 {
        return Err(EnvelopeError::MalformedField("nonce"));
    }
    let ciphertext = BASE64
        .decode(&envelope.ciphertext)
        .map_err(|_| EnvelopeError::MalformedField("ciphertext"))?;

    let cipher = XChaCha20Poly1305::new((&*key).into());
    let plaintext = cipher
        .decrypt(XNonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| EnvelopeError::TagMismatch)?;

    let text = String::from_utf8(plaintext).map_err(|_| EnvelopeError::InvalidUtf8)?;
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

fn seal_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut hasher = blake3::Hasher::new_derive_key(SEAL_CONTEXT);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);

    let mut key = Zeroizing::new([0u8; 32]);
    hasher.finalize_xof().fill(key.as_mut());
    key
}

fn password_key(password: &str, salt: &[u8; 16]) -> Result<Zeroizing<[u8; 32]>, EnvelopeError> {
    // Argon2id, 64 MiB / 3 iterations / 4 lanes
    let params =
        Params::new(64 * 1024, 3, 4, Some(32)).map_err(|_| EnvelopeError::KeyDerivation)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password.as_bytes(), salt, key.as_mut())
        .map_err(|_| EnvelopeError::KeyDerivation)?;
    Ok(key)
}
