//! One-shot local listener for the OAuth redirect.
//!
//! The provider redirects the browser to `GET /callback?code=..&state=..`. The
//! first request to that route decides the outcome; the listener then shuts down.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Grace period for the listener to finish writing the browser response.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackError {
    #[error("authorization denied: {error} ({description})")]
    Denied { error: String, description: String },

    #[error("invalid OAuth state (possible CSRF attack)")]
    StateMismatch,

    #[error("callback is missing the 'code' parameter")]
    MissingCode,

    #[error("timed out waiting for the authorization callback")]
    Timeout,

    #[error("callback listener failed: {0}")]
    Listener(String),
}

/// OAuth callback query parameters
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackParams {
    /// Extracts the code if the callback is a success for `expected_state`.
    fn into_code(self, expected_state: &str) -> Result<String, CallbackError> {
        if let Some(error) = self.error {
            return Err(CallbackError::Denied {
                error,
                description: self
                    .error_description
                    .unwrap_or_else(|| "Unknown error".to_string()),
            });
        }

        if self.state.as_deref() != Some(expected_state) {
            return Err(CallbackError::StateMismatch);
        }

        self.code
            .filter(|c| !c.is_empty())
            .ok_or(CallbackError::MissingCode)
    }
}

type Outcome = Result<String, CallbackError>;

struct CallbackState {
    expected_state: String,
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
}

/// Router for `/callback` that reports the first outcome on `sender`.
pub fn callback_router(expected_state: String, sender: oneshot::Sender<Outcome>) -> Router {
    let state = CallbackState {
        expected_state,
        sender: Mutex::new(Some(sender)),
    };

    Router::new()
        .route("/callback", get(handle_callback))
        .with_state(Arc::new(state))
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    debug!("OAuth callback received");

    let sender = state
        .sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let Some(sender) = sender else {
        return (StatusCode::GONE, Html("This authorization link was already used.")).into_response();
    };

    let outcome = params.into_code(&state.expected_state);
    let response = match &outcome {
        Ok(_) => (
            StatusCode::OK,
            Html("Authorization complete. You can close this window.".to_string()),
        ),
        Err(e) => {
            warn!(error = %e, "OAuth callback rejected");
            (
                StatusCode::BAD_REQUEST,
                Html(format!("Authorization failed: {}", e)),
            )
        }
    };

    // Receiver only disappears once the wait has timed out
    let _ = sender.send(outcome);
    response.into_response()
}

/// Binds `addr` and waits up to `timeout` for the provider redirect.
pub async fn wait_for_code(
    addr: SocketAddr,
    expected_state: &str,
    timeout: Duration,
) -> Result<String, CallbackError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| CallbackError::Listener(format!("failed to bind {}: {}", addr, e)))?;

    info!(addr = %addr, "Waiting for OAuth callback");
    serve_until_code(listener, expected_state, timeout).await
}

/// Serves the callback route on an already-bound listener until one outcome arrives.
pub async fn serve_until_code(
    listener: TcpListener,
    expected_state: &str,
    timeout: Duration,
) -> Result<String, CallbackError> {
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = callback_router(expected_state.to_string(), outcome_tx);

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let outcome = match tokio::time::timeout(timeout, outcome_rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(CallbackError::Listener("callback channel closed".to_string())),
        Err(_) => Err(CallbackError::Timeout),
    };

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => debug!("Callback listener stopped"),
        Ok(Ok(Err(e))) => warn!(error = %e, "Callback listener error"),
        Ok(Err(e)) => warn!(error = %e, "Callback listener task failed"),
        Err(_) => warn!("Callback listener did not stop in time"),
    }

    outcome
}
