//! OAuth token endpoint calls.
//!
//! Handles the refresh grant used by [`super::TokenManager`] and the
//! authorization-code grant used once by interactive authorization.

use crate::config::Secret;
use crate::credentials::{default_token_type, CredentialRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::fmt;
use tracing::debug;

/// Total request timeout for token endpoint calls.
const EXCHANGE_TIMEOUT_SECS: u64 = 30;

/// Token exchange failures. None of them mutate stored credentials.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("token endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx response (e.g. `invalid_grant`)
    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// 2xx response missing a required field
    #[error("malformed token response: {0}")]
    Malformed(String),
}

/// A validated token endpoint response.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: Option<String>,
}

impl TokenGrant {
    /// Builds the record to persist, with `expires_at = now + expires_in`.
    pub fn into_record(self, now: DateTime<Utc>) -> CredentialRecord {
        CredentialRecord {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: now + Duration::seconds(self.expires_in),
            token_type: self.token_type.unwrap_or_else(default_token_type),
            updated_at: now,
        }
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
}

impl TryFrom<TokenResponse> for TokenGrant {
    type Error = ExchangeError;

    fn try_from(response: TokenResponse) -> Result<Self, Self::Error> {
        let access_token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExchangeError::Malformed("missing access_token".to_string()))?;
        let refresh_token = response
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExchangeError::Malformed("missing refresh_token".to_string()))?;
        let expires_in = match response.expires_in {
            Some(secs) if secs > 0 => secs,
            Some(secs) => {
                return Err(ExchangeError::Malformed(format!(
                    "expires_in must be positive, got {}",
                    secs
                )))
            }
            None => return Err(ExchangeError::Malformed("missing expires_in".to_string())),
        };

        Ok(TokenGrant {
            access_token,
            refresh_token,
            expires_in,
            token_type: response.token_type,
        })
    }
}

/// Trades a refresh token for a new pair.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ExchangeError>;
}

/// Token exchange against the provider's HTTP token endpoint.
pub struct HttpTokenExchange {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Secret,
    scopes: Vec<String>,
}

impl HttpTokenExchange {
    pub fn new(
        token_url: String,
        client_id: String,
        client_secret: Secret,
        scopes: Vec<String>,
    ) -> Result<Self, ExchangeError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(EXCHANGE_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            token_url,
            client_id,
            client_secret,
            scopes,
        })
    }

    /// Exchanges an authorization code for the first token pair.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, ExchangeError> {
        debug!(token_url = %self.token_url, "Exchanging authorization code for tokens");

        self.post_form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
        ])
        .await
    }

    async fn post_form(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ExchangeError> {
        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ExchangeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token_response: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;

        debug!(
            expires_in = ?token_response.expires_in,
            has_refresh_token = token_response.refresh_token.is_some(),
            "Token endpoint responded"
        );

        TokenGrant::try_from(token_response)
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ExchangeError> {
        debug!(token_url = %self.token_url, "Exchanging refresh token");

        // `offline` in the scope asks for a rotated refresh token
        let scope = self.scopes.join(" ");
        self.post_form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
            ("scope", scope.as_str()),
        ])
        .await
    }
}
