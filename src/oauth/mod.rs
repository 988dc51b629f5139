//! Interactive OAuth 2.0 authorization code flow.
//!
//! Used once to obtain the first token pair when no bootstrap tokens exist:
//! 1. Build the consent URL with a fresh CSRF state
//! 2. Operator opens it and approves
//! 3. Provider redirects to the local `/callback` listener
//! 4. Exchange the code and hand the pair to [`TokenManager::install`]

pub mod callback;
mod provider;

pub use callback::{wait_for_code, CallbackError};
pub use provider::{generate_state, OAuthProviderConfig};

use crate::config::OAuthConfig;
use crate::token::{ExchangeError, HttpTokenExchange, TokenError, TokenManager};
use reqwest::Url;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::info;

/// How long to wait for the operator to approve in the browser.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum AuthorizeError {
    #[error("invalid redirect_uri '{0}'")]
    InvalidRedirect(String),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("authorization code exchange failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Token(#[from] TokenError),
}

/// A prepared consent request: where to send the operator and where to listen.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub auth_url: String,
    pub redirect_uri: String,
    pub state: String,
    pub listen_addr: SocketAddr,
}

impl AuthorizationRequest {
    /// Uses `port` when given, otherwise the port of the configured redirect URI.
    pub fn new(config: &OAuthConfig, port: Option<u16>) -> Result<Self, AuthorizeError> {
        let redirect_uri = match port {
            Some(port) => format!("http://localhost:{}/callback", port),
            None => config.redirect_uri.clone(),
        };

        let parsed = Url::parse(&redirect_uri)
            .map_err(|_| AuthorizeError::InvalidRedirect(redirect_uri.clone()))?;
        let listen_port = parsed
            .port_or_known_default()
            .ok_or_else(|| AuthorizeError::InvalidRedirect(redirect_uri.clone()))?;

        let state = generate_state();
        let auth_url =
            OAuthProviderConfig::from_config(config).build_auth_url(&state, &redirect_uri);

        Ok(Self {
            auth_url,
            redirect_uri,
            state,
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, listen_port)),
        })
    }

    /// Waits for the callback, exchanges the code and stores the first pair.
    pub async fn complete(
        &self,
        exchange: &HttpTokenExchange,
        manager: &TokenManager,
        timeout: Duration,
    ) -> Result<(), AuthorizeError> {
        let code = wait_for_code(self.listen_addr, &self.state, timeout).await?;
        info!("Authorization code received, exchanging for tokens");

        let grant = exchange.exchange_code(&code, &self.redirect_uri).await?;
        manager.install(grant)?;
        Ok(())
    }
}

/// Prints the consent URL and completes the flow with the default timeout.
pub async fn authorize_interactive(
    config: &OAuthConfig,
    exchange: &HttpTokenExchange,
    manager: &TokenManager,
    port: Option<u16>,
) -> Result<(), AuthorizeError> {
    let request = AuthorizationRequest::new(config, port)?;

    println!("Open this URL in your browser to authorize:\n\n{}\n", request.auth_url);
    info!(redirect_uri = %request.redirect_uri, "Started interactive authorization");

    request
        .complete(exchange, manager, DEFAULT_CALLBACK_TIMEOUT)
        .await?;

    info!("Interactive authorization completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use crate::credentials::{CipherMode, CredentialStore, SqliteCredentialStore};
    use crate::token::TokenState;
    use mockito::{Matcher, Server};
    use std::sync::Arc;

    #[test]
    fn test_request_uses_configured_redirect() {
        let config = OAuthConfig::default();
        let request = AuthorizationRequest::new(&config, None).unwrap();

        assert_eq!(request.redirect_uri, "http://localhost:8080/callback");
        assert_eq!(request.listen_addr.port(), 8080);
        assert!(request.auth_url.contains(&format!("state={}", request.state)));
    }

    #[test]
    fn test_request_port_override() {
        let request = AuthorizationRequest::new(&OAuthConfig::default(), Some(9123)).unwrap();

        assert_eq!(request.redirect_uri, "http://localhost:9123/callback");
        assert_eq!(request.listen_addr, SocketAddr::from((Ipv4Addr::LOCALHOST, 9123)));
    }

    #[test]
    fn test_request_rejects_bad_redirect() {
        let config = OAuthConfig {
            redirect_uri: "not a url".to_string(),
            ..OAuthConfig::default()
        };
        assert!(matches!(
            AuthorizationRequest::new(&config, None),
            Err(AuthorizeError::InvalidRedirect(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_installs_exchanged_pair() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                Matcher::UrlEncoded("code".into(), "granted".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"A1","refresh_token":"R1","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let exchange = Arc::new(
            HttpTokenExchange::new(
                format!("{}/oauth/token", server.url()),
                "client-id".to_string(),
                Secret::new("client-secret".to_string()),
                vec!["offline".to_string()],
            )
            .unwrap(),
        );
        let store = Arc::new(SqliteCredentialStore::in_memory(CipherMode::Plain).unwrap());
        let manager = TokenManager::new(store.clone(), exchange.clone(), None);

        // Pick a free port, then release it for the listener
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let request = AuthorizationRequest::new(&OAuthConfig::default(), Some(port)).unwrap();

        let callback_url = format!(
            "http://127.0.0.1:{}/callback?code=granted&state={}",
            port, request.state
        );
        let browser = tokio::spawn(async move {
            // Retry until the listener is bound
            for _ in 0..50 {
                if let Ok(response) = reqwest::get(&callback_url).await {
                    return response.status();
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("callback listener never came up");
        });

        request
            .complete(&exchange, &manager, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(browser.await.unwrap(), reqwest::StatusCode::OK);
        token.assert_async().await;
        assert_eq!(store.load().unwrap().unwrap().access_token, "A1");
        assert_eq!(manager.status().unwrap().state, TokenState::Valid);
    }
}
