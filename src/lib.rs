//! whoop-sync - OAuth2 token lifecycle for a scheduled health-data scraper.
//!
//! A job wakes up, asks the [`TokenManager`] for a bearer token, pulls data from
//! the API and exits. Between runs the credential lives in a [`CredentialStore`].
//! The provider rotates refresh tokens, so every successful refresh must persist
//! the new pair before the old one is lost.
//!
//! # Architecture
//!
//! ```text
//!   config (TOML + WHOOP_* env)
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       TokenManager                       │
//! │  - serve cached token while fresh        │
//! │  - one refresh exchange when stale       │
//! └─────────────────────────────────────────┘
//!      ↓                         ↓
//! CredentialStore           TokenExchange
//! (SQLite or file,          (token endpoint,
//!  optional AES-256-GCM)     refresh grant)
//!          ↓
//!      ApiClient ──(401: force refresh, retry once)──► API
//! ```
//!
//! # Core Types
//!
//! - [`TokenManager`] - owns the credential and hands out valid tokens
//! - [`CredentialStore`] - persistence seam, with SQLite and file backends
//! - [`TokenExchange`] - refresh grant seam, with an HTTP implementation
//! - [`ApiClient`] - authenticated GETs against the health-data API
//! - [`SyncConfig`] - typed configuration resolved once at startup

pub mod api;
pub mod config;
pub mod credentials;
pub mod oauth;
pub mod token;

pub use api::{ApiClient, ApiError, Resource};
pub use config::SyncConfig;
pub use credentials::{CredentialRecord, CredentialStore};
pub use token::{TokenError, TokenExchange, TokenManager, TokenState};
