pub mod env;

use crate::credentials::{
    CipherError, CipherMode, CredentialStore, FileCredentialStore, SqliteCredentialStore,
};
use crate::token::BootstrapTokens;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_AUTH_URL: &str = "https://api.prod.whoop.com/oauth/oauth2/auth";
pub const DEFAULT_TOKEN_URL: &str = "https://api.prod.whoop.com/oauth/oauth2/token";
pub const DEFAULT_API_BASE_URL: &str = "https://api.prod.whoop.com/developer/v1";

/// `offline` is what makes the provider issue refresh tokens.
pub const DEFAULT_SCOPES: &[&str] = &[
    "offline",
    "read:profile",
    "read:body_measurement",
    "read:cycles",
    "read:recovery",
    "read:sleep",
    "read:workout",
];

/// A configuration value that must never appear in logs or `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Secret)
    }
}

/// Complete whoop-sync configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// OAuth client registration and endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    pub client_secret: Option<Secret>,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_redirect_uri() -> String {
    "http://localhost:8080/callback".to_string()
}

fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
        }
    }
}

/// Operator-supplied first token pair, used only while nothing is stored
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BootstrapConfig {
    pub access_token: Option<Secret>,
    pub refresh_token: Option<Secret>,
    /// Absent means "already expired", forcing an exchange on first use
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    File,
}

/// Credential persistence
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_credentials_path")]
    pub path: String,
    /// Base64 32-byte key. Absent selects cleartext storage.
    pub encryption_key: Option<Secret>,
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_credentials_path() -> String {
    "credentials.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_credentials_path(),
            encryption_key: None,
        }
    }
}

/// Upstream API settings
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    /// Number of days fetched by `fetch`
    #[serde(default = "default_scrape_days")]
    pub scrape_days: u32,
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_scrape_days() -> u32 {
    7
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            scrape_days: default_scrape_days(),
        }
    }
}

impl SyncConfig {
    /// Resolves the bootstrap pair. Both tokens or neither must be set.
    pub fn bootstrap_tokens(&self) -> Result<Option<BootstrapTokens>> {
        let access = self.bootstrap.access_token.as_ref().filter(|s| !s.is_empty());
        let refresh = self.bootstrap.refresh_token.as_ref().filter(|s| !s.is_empty());

        match (access, refresh) {
            (Some(access), Some(refresh)) => Ok(Some(BootstrapTokens {
                access_token: access.expose().to_string(),
                refresh_token: refresh.expose().to_string(),
                expires_at: self.bootstrap.expires_at,
            })),
            (None, None) => Ok(None),
            _ => bail!("Bootstrap tokens must be configured as a pair (access_token and refresh_token)"),
        }
    }

    pub fn cipher_mode(&self) -> Result<CipherMode, CipherError> {
        CipherMode::from_key(self.storage.encryption_key.as_ref())
    }

    /// Opens the configured credential store.
    pub fn open_store(&self) -> Result<Arc<dyn CredentialStore>> {
        let cipher = self.cipher_mode().context("Invalid storage.encryption_key")?;
        let store: Arc<dyn CredentialStore> = match self.storage.backend {
            StorageBackend::Sqlite => Arc::new(
                SqliteCredentialStore::open(&self.storage.path, cipher)
                    .context("Failed to open credential database")?,
            ),
            StorageBackend::File => Arc::new(FileCredentialStore::new(&self.storage.path, cipher)),
        };
        Ok(store)
    }

    /// Client credentials, required by every command that talks to the token endpoint.
    pub fn client_credentials(&self) -> Result<(&str, &Secret)> {
        let secret = self
            .oauth
            .client_secret
            .as_ref()
            .filter(|s| !s.is_empty());
        match (self.oauth.client_id.as_str(), secret) {
            ("", _) => bail!("oauth.client_id is not configured (WHOOP_CLIENT_ID)"),
            (_, None) => bail!("oauth.client_secret is not configured (WHOOP_CLIENT_SECRET)"),
            (id, Some(secret)) => Ok((id, secret)),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<SyncConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
    let config: SyncConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    Ok(config)
}
