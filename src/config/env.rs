use super::{Secret, StorageBackend, SyncConfig};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

/// Path of an optional TOML file read before the environment overlay.
pub const CONFIG_PATH_VAR: &str = "WHOOP_CONFIG";

impl SyncConfig {
    /// Build from `WHOOP_CONFIG` (if set) overlaid with `WHOOP_*` env vars.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) if !path.is_empty() => super::load_config(&path)?,
            _ => SyncConfig::default(),
        };
        base.with_overrides(|name| std::env::var(name).ok())
    }

    /// Overlays variables returned by `lookup`. Empty values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = var("WHOOP_CLIENT_ID") {
            self.oauth.client_id = v;
        }
        if let Some(v) = var("WHOOP_CLIENT_SECRET") {
            self.oauth.client_secret = Some(Secret::new(v));
        }
        if let Some(v) = var("WHOOP_AUTH_URL") {
            self.oauth.auth_url = v;
        }
        if let Some(v) = var("WHOOP_TOKEN_URL") {
            self.oauth.token_url = v;
        }
        if let Some(v) = var("WHOOP_REDIRECT_URI") {
            self.oauth.redirect_uri = v;
        }

        if let Some(v) = var("WHOOP_ACCESS_TOKEN") {
            self.bootstrap.access_token = Some(Secret::new(v));
        }
        if let Some(v) = var("WHOOP_REFRESH_TOKEN") {
            self.bootstrap.refresh_token = Some(Secret::new(v));
        }
        if let Some(v) = var("WHOOP_TOKEN_EXPIRES_AT") {
            let expires_at = DateTime::parse_from_rfc3339(&v)
                .context("WHOOP_TOKEN_EXPIRES_AT must be an RFC 3339 timestamp")?;
            self.bootstrap.expires_at = Some(expires_at.with_timezone(&Utc));
        }

        if let Some(v) = var("WHOOP_ENCRYPTION_KEY") {
            self.storage.encryption_key = Some(Secret::new(v));
        }
        if let Some(v) = var("WHOOP_STORAGE_BACKEND") {
            self.storage.backend = match v.to_lowercase().as_str() {
                "sqlite" => StorageBackend::Sqlite,
                "file" => StorageBackend::File,
                other => bail!("WHOOP_STORAGE_BACKEND must be 'sqlite' or 'file', got '{}'", other),
            };
        }
        if let Some(v) = var("WHOOP_CREDENTIALS_PATH") {
            self.storage.path = v;
        }

        if let Some(v) = var("WHOOP_API_BASE_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = var("WHOOP_SCRAPE_DAYS") {
            self.api.scrape_days = v
                .parse()
                .context("WHOOP_SCRAPE_DAYS must be a positive integer")?;
        }

        Ok(self)
    }
}
