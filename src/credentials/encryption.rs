//! AES-256-GCM sealing for stored credentials.
//!
//! Every sealed blob carries its own nonce as a 12-byte prefix. Callers pass the
//! record metadata that stays in cleartext as associated data, so `open` fails if
//! either the blob or that metadata changed. The master key must be 32 bytes
//! (256 bits), base64-encoded.

use crate::config::Secret;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE},
    Engine,
};
use std::fmt;
use tracing::info;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Cipher failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    /// Wrong key, tampered bytes, or truncated input
    #[error("authentication failed (wrong key or tampered ciphertext)")]
    AuthenticationFailed,

    /// The configured key is not 32 bytes of base64
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    /// The AEAD refused to seal the input
    #[error("encryption failed")]
    Encryption,
}

/// A 256-bit master key. Kept in memory only.
#[derive(Clone)]
pub struct CipherKey([u8; KEY_SIZE]);

impl CipherKey {
    /// Decodes a base64 key. Both the standard and the URL-safe alphabet are accepted.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let encoded = encoded.trim();
        let bytes = BASE64
            .decode(encoded)
            .or_else(|_| URL_SAFE.decode(encoded))
            .map_err(|e| CipherError::InvalidKey(format!("not valid base64: {}", e)))?;

        let key: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            CipherError::InvalidKey(format!(
                "must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                bytes.len()
            ))
        })?;

        Ok(Self(key))
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let generated = Aes256Gcm::generate_key(&mut OsRng);
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&generated);
        Self(key)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl From<[u8; KEY_SIZE]> for CipherKey {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey([REDACTED])")
    }
}

/// How credentials are protected at rest. Chosen once at startup.
#[derive(Clone, Debug)]
pub enum CipherMode {
    /// No encryption: `seal` and `open` are identity functions
    Plain,
    /// AES-256-GCM under the given key
    Authenticated(CipherKey),
}

impl CipherMode {
    /// Resolves the mode from an optional configured key.
    ///
    /// An absent key selects `Plain`. A present but undecodable key is an error,
    /// never a fallback to `Plain`.
    pub fn from_key(key: Option<&Secret>) -> Result<Self, CipherError> {
        match key {
            Some(secret) => {
                let key = CipherKey::from_base64(secret.expose())?;
                info!("Token encryption enabled (AES-256-GCM)");
                Ok(CipherMode::Authenticated(key))
            }
            None => {
                info!("Token encryption disabled, credentials stored in cleartext");
                Ok(CipherMode::Plain)
            }
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, CipherMode::Authenticated(_))
    }

    /// Seals `plaintext` as `nonce || ciphertext || tag`, authenticating `aad` alongside.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let key = match self {
            CipherMode::Plain => return Ok(plaintext.to_vec()),
            CipherMode::Authenticated(key) => key,
        };

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));

        // Fresh nonce per call, never reused
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CipherError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Opens a blob produced by [`CipherMode::seal`] under the same key and `aad`.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let key = match self {
            CipherMode::Plain => return Ok(sealed.to_vec()),
            CipherMode::Authenticated(key) => key,
        };

        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CipherError::AuthenticationFailed);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));

        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CipherError::AuthenticationFailed)
    }
}
