//! Credential persistence for the WHOOP OAuth token pair.
//!
//! This module holds the single [`CredentialRecord`] a deployment owns and the
//! stores that persist it, optionally sealed with AES-256-GCM.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore (trait)            │
//! │  - load / save / clear                   │
//! │  - SqliteCredentialStore (upsert, id=1)  │
//! │  - FileCredentialStore (atomic rename)   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!       (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       CipherMode                         │
//! │  - Plain: identity, logged at startup    │
//! │  - Authenticated: AES-256-GCM            │
//! │    nonce embedded in every blob          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use whoop_sync::credentials::{CipherMode, CredentialRecord, CredentialStore, SqliteCredentialStore};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cipher = CipherMode::from_key(None)?;
//! let store = SqliteCredentialStore::open("credentials.db", cipher)?;
//!
//! let record = CredentialRecord::new(
//!     "access".to_string(),
//!     "refresh".to_string(),
//!     Utc::now() + Duration::hours(1),
//! );
//! store.save(&record)?;
//!
//! if let Some(record) = store.load()? {
//!     println!("Token expires at {}", record.expires_at);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Both tokens are sealed together in one blob, never separately
//! - A blob that fails authentication is a hard error, never read as cleartext
//! - `Debug` output of records never contains token values

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod file;
mod storage;

pub use encryption::{CipherError, CipherKey, CipherMode};
pub use file::FileCredentialStore;
pub use storage::SqliteCredentialStore;

/// Access tokens within this window of `expires_at` are treated as expired.
pub const STALENESS_BUFFER_SECS: i64 = 5 * 60;

/// The singleton OAuth credential a deployment holds.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Bearer token for API requests
    pub access_token: String,

    /// Single-use token for obtaining the next pair
    pub refresh_token: String,

    /// When the access token stops being accepted (UTC)
    pub expires_at: DateTime<Utc>,

    /// Token type reported by the provider
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Last time this record was written
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn default_token_type() -> String {
    "bearer".to_string()
}

impl CredentialRecord {
    pub fn new(access_token: String, refresh_token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at,
            token_type: default_token_type(),
            updated_at: Utc::now(),
        }
    }

    /// Returns true if the access token is expired or within the staleness buffer at `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(STALENESS_BUFFER_SECS) >= self.expires_at
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Token pair as it is sealed at rest. Timestamps stay in cleartext and are
/// bound to the blob through [`sealed_aad`].
#[derive(Serialize, Deserialize)]
pub(crate) struct SealedTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing database or file could not be read or written
    #[error("credential store unavailable: {0}")]
    Unavailable(String),

    /// A sealed record failed to open or seal
    #[error("credential cipher failure: {0}")]
    Cipher(#[from] CipherError),

    /// The stored record is present but not well-formed
    #[error("stored credential record is corrupt: {0}")]
    Corrupt(String),

    /// The stored record is encrypted but no encryption key is configured
    #[error("stored credentials are encrypted but no encryption key is configured")]
    KeyRequired,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Durable home of the singleton [`CredentialRecord`].
///
/// `load` on an empty store returns `Ok(None)`. `save` replaces the whole record
/// in one atomic write, so a reader never observes a half-updated pair.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<CredentialRecord>, StoreError>;

    fn save(&self, record: &CredentialRecord) -> Result<(), StoreError>;

    /// Removes the stored record. Returns false if nothing was stored.
    fn clear(&self) -> Result<bool, StoreError>;
}

/// Rejects records that break the non-empty token invariant.
pub(crate) fn check_tokens(access_token: &str, refresh_token: &str) -> Result<(), StoreError> {
    if access_token.is_empty() {
        return Err(StoreError::Corrupt("access_token is empty".to_string()));
    }
    if refresh_token.is_empty() {
        return Err(StoreError::Corrupt("refresh_token is empty".to_string()));
    }
    Ok(())
}

pub(crate) fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid {}: {}", field, e)))
}

/// Associated data for a sealed pair: the record fields stored next to it.
pub(crate) fn sealed_aad(
    expires_at: &DateTime<Utc>,
    token_type: &str,
    updated_at: &DateTime<Utc>,
) -> Vec<u8> {
    format!(
        "expires_at={};token_type={};updated_at={}",
        expires_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        token_type,
        updated_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    )
    .into_bytes()
}
