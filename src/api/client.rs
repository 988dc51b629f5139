use super::resources::{DateRange, Page, Resource};
use crate::token::{TokenError, TokenManager};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Still rejected after a forced refresh
    #[error("API rejected the access token after refresh")]
    Unauthorized,

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode API response: {0}")]
    Decode(String),

    #[error("resource '{0}' is not paginated")]
    NotPaginated(Resource),

    #[error("a range of {0} days reaches before the earliest representable date")]
    InvalidRange(u32),
}

/// HTTP client for the v1 developer API.
pub struct ApiClient {
    http_client: Client,
    base_url: String,
    tokens: Arc<TokenManager>,
}

impl ApiClient {
    pub fn new(base_url: String, tokens: Arc<TokenManager>) -> Result<Self, ApiError> {
        let http_client = Client::builder()
            .user_agent(concat!("whoop-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);

        let token = self.tokens.get_valid_token().await?;
        let mut response = self.send(&url, query, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path = %path, "Access token rejected, forcing refresh");
            let token = self.tokens.force_refresh().await?;
            response = self.send(&url, query, &token).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(ApiError::Unauthorized);
            }
        }

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Fetch a single-object resource such as the profile.
    pub async fn fetch_one(&self, resource: Resource) -> Result<serde_json::Value, ApiError> {
        info!(resource = %resource, "Fetching resource");
        self.get_json(resource.path(), &[]).await
    }

    /// Fetch one page of a collection. Pass the previous page's `next_token` to continue.
    pub async fn fetch_page(
        &self,
        resource: Resource,
        range: &DateRange,
        next_token: Option<&str>,
    ) -> Result<Page, ApiError> {
        if !resource.is_collection() {
            return Err(ApiError::NotPaginated(resource));
        }

        let mut query = range.query().to_vec();
        if let Some(token) = next_token {
            query.push(("nextToken", token.to_string()));
        }

        let mut page: Page = self.get_json(resource.path(), &query).await?;
        page.next_token = page.next_token.filter(|t| !t.is_empty());

        info!(
            resource = %resource,
            records = page.records.len(),
            has_more = page.next_token.is_some(),
            "Fetched page"
        );
        Ok(page)
    }

    async fn send(
        &self,
        url: &str,
        query: &[(&str, String)],
        token: &str,
    ) -> Result<Response, ApiError> {
        debug!(url = %url, "GET");
        let response = self
            .http_client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        Ok(response)
    }
}
