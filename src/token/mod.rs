//! OAuth token lifecycle.
//!
//! [`TokenManager`] owns the in-memory credential and is the only way the rest of
//! the crate gets a bearer token. It reads the store once, serves the cached access
//! token while it is fresh, and performs exactly one refresh exchange when it is
//! stale or when a caller forces one.
//!
//! ```text
//!  Uninitialized ──(store empty, bootstrap set)──► Bootstrapped
//!        │                                              │
//!   (store has record)                            (stale/forced)
//!        ▼                                              ▼
//!      Valid ──(within 5 min of expiry)──► Stale ──► Refreshing ──► Valid
//!        ▲                                              │
//!        └──────────────(next call retries)──── Failed ◄┘
//! ```
//!
//! The provider rotates the refresh token on every exchange, so both tokens are
//! replaced and persisted together. A failed exchange never touches the store.

mod exchange;


pub use exchange::{ExchangeError, HttpTokenExchange, TokenExchange, TokenGrant};

use crate::credentials::{CredentialRecord, CredentialStore, StoreError};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Lifecycle state of the credential slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Nothing stored and nothing to bootstrap from
    Uninitialized,
    /// Operator-supplied pair in memory, not yet persisted
    Bootstrapped,
    /// Persisted and fresh
    Valid,
    /// Expired or within the staleness buffer
    Stale,
    /// Exchange in flight
    Refreshing,
    /// Last exchange (or the save after it) failed
    Failed,
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenState::Uninitialized => "uninitialized",
            TokenState::Bootstrapped => "bootstrapped",
            TokenState::Valid => "valid",
            TokenState::Stale => "stale",
            TokenState::Refreshing => "refreshing",
            TokenState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Diagnostic snapshot returned by [`TokenManager::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStatus {
    pub state: TokenState,
    pub expires_at: Option<DateTime<Utc>>,
    /// Last persisted write. `None` until something has been stored.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Token errors surfaced to callers of the manager.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Nothing stored and no bootstrap tokens configured
    #[error("no credentials available; run `whoop-sync auth` or configure bootstrap tokens")]
    NoCredentials,

    /// Upstream rejected the refresh or the network failed
    #[error("token refresh failed: {0}")]
    RefreshFailed(#[source] ExchangeError),

    /// A refresh from this manager is already in flight
    #[error("token refresh already in progress")]
    ReentrantRefresh,

    /// The credential store failed
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),
}

/// Operator-supplied first token pair.
#[derive(Clone)]
pub struct BootstrapTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// `None` is treated as already expired
    pub expires_at: Option<DateTime<Utc>>,
}

impl BootstrapTokens {
    fn to_record(&self) -> CredentialRecord {
        let now = Utc::now();
        let mut record = CredentialRecord::new(
            self.access_token.clone(),
            self.refresh_token.clone(),
            self.expires_at.unwrap_or(now),
        );
        record.updated_at = now;
        record
    }
}

impl fmt::Debug for BootstrapTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

struct Slot {
    /// Never `Stale`; staleness is derived from the record on read
    state: TokenState,
    record: Option<CredentialRecord>,
    /// Whether `record` matches what the store holds
    persisted: bool,
}

impl Slot {
    fn effective_state(&self, now: DateTime<Utc>) -> TokenState {
        match (&self.record, self.state) {
            (Some(record), TokenState::Valid | TokenState::Bootstrapped)
                if record.is_stale_at(now) =>
            {
                TokenState::Stale
            }
            (_, state) => state,
        }
    }
}

/// What a caller gets after inspecting the slot.
enum Next {
    Ready(String),
    Refresh(String),
}

/// Moves the slot to `Failed` if a refresh future is dropped mid-exchange.
struct RefreshGuard<'a> {
    slot: &'a Mutex<Slot>,
    armed: bool,
}

impl RefreshGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.state == TokenState::Refreshing {
                warn!("Token refresh abandoned before completion");
                slot.state = TokenState::Failed;
            }
        }
    }
}

/// Owns the credential and hands out currently-valid bearer tokens.
///
/// Safe to call once per outbound request: a fresh token is served from memory
/// without touching the store or the network.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    bootstrap: Option<BootstrapTokens>,
    slot: Mutex<Slot>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        exchange: Arc<dyn TokenExchange>,
        bootstrap: Option<BootstrapTokens>,
    ) -> Self {
        Self {
            store,
            exchange,
            bootstrap,
            slot: Mutex::new(Slot {
                state: TokenState::Uninitialized,
                record: None,
                persisted: false,
            }),
        }
    }

    /// Returns a usable access token, refreshing first if it is stale.
    ///
    /// After a failed refresh the next call retries unconditionally.
    pub async fn get_valid_token(&self) -> Result<String, TokenError> {
        match self.next_step(false)? {
            Next::Ready(token) => Ok(token),
            Next::Refresh(refresh_token) => self.refresh(refresh_token).await,
        }
    }

    /// Refreshes regardless of expiry, e.g. after the API rejected the token.
    ///
    /// Returns the access token the exchange produced. Callers retrying a request
    /// use it directly, since a short-lived grant may already look stale.
    pub async fn force_refresh(&self) -> Result<String, TokenError> {
        match self.next_step(true)? {
            Next::Ready(token) => Ok(token),
            Next::Refresh(refresh_token) => self.refresh(refresh_token).await,
        }
    }

    /// Current state and expiry. Loads from the store if needed, never calls upstream.
    pub fn status(&self) -> Result<TokenStatus, TokenError> {
        let mut slot = self.lock();
        if slot.state != TokenState::Refreshing {
            self.ensure_loaded(&mut slot)?;
        }

        Ok(TokenStatus {
            state: slot.effective_state(Utc::now()),
            expires_at: slot.record.as_ref().map(|r| r.expires_at),
            updated_at: slot
                .record
                .as_ref()
                .filter(|_| slot.persisted)
                .map(|r| r.updated_at),
        })
    }

    /// Persists the first pair obtained by an interactive authorization.
    pub fn install(&self, grant: TokenGrant) -> Result<(), TokenError> {
        let mut slot = self.lock();
        if slot.state == TokenState::Refreshing {
            return Err(TokenError::ReentrantRefresh);
        }

        let record = grant.into_record(Utc::now());
        self.store.save(&record)?;

        info!(expires_at = %record.expires_at, "Authorization stored");
        slot.record = Some(record);
        slot.state = TokenState::Valid;
        slot.persisted = true;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fills the slot from the store, or from bootstrap config when the store is empty.
    fn ensure_loaded(&self, slot: &mut Slot) -> Result<(), TokenError> {
        if slot.record.is_some() {
            return Ok(());
        }

        match self.store.load()? {
            Some(record) => {
                debug!(expires_at = %record.expires_at, "Loaded stored credentials");
                slot.record = Some(record);
                slot.state = TokenState::Valid;
                slot.persisted = true;
            }
            None => match &self.bootstrap {
                Some(bootstrap) => {
                    info!("No stored credentials, using bootstrap tokens");
                    slot.record = Some(bootstrap.to_record());
                    slot.state = TokenState::Bootstrapped;
                }
                None => slot.state = TokenState::Uninitialized,
            },
        }
        Ok(())
    }

    /// Decides between serving the cached token and starting a refresh.
    fn next_step(&self, force: bool) -> Result<Next, TokenError> {
        let mut slot = self.lock();
        if slot.state == TokenState::Refreshing {
            return Err(TokenError::ReentrantRefresh);
        }

        self.ensure_loaded(&mut slot)?;

        let state = slot.effective_state(Utc::now());
        let Some(record) = slot.record.as_ref() else {
            return Err(TokenError::NoCredentials);
        };

        if !force && matches!(state, TokenState::Valid | TokenState::Bootstrapped) {
            return Ok(Next::Ready(record.access_token.clone()));
        }

        info!(state = %state, forced = force, "Refreshing access token");
        let refresh_token = record.refresh_token.clone();
        slot.state = TokenState::Refreshing;
        Ok(Next::Refresh(refresh_token))
    }

    /// Runs one exchange and writes the result through to the store.
    async fn refresh(&self, refresh_token: String) -> Result<String, TokenError> {
        let guard = RefreshGuard {
            slot: &self.slot,
            armed: true,
        };

        let grant = match self.exchange.refresh(&refresh_token).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(error = %e, "Token refresh failed, keeping last known credentials");
                self.lock().state = TokenState::Failed;
                guard.disarm();
                return Err(TokenError::RefreshFailed(e));
            }
        };

        let record = grant.into_record(Utc::now());
        let access_token = record.access_token.clone();
        let expires_at = record.expires_at;
        let saved = self.store.save(&record);

        {
            let mut slot = self.lock();
            slot.record = Some(record);
            slot.persisted = saved.is_ok();
            slot.state = if slot.persisted {
                TokenState::Valid
            } else {
                TokenState::Failed
            };
        }
        guard.disarm();

        match saved {
            Ok(()) => {
                info!(expires_at = %expires_at, "Tokens refreshed");
                Ok(access_token)
            }
            Err(e) => {
                // The old refresh token is already void upstream. Keep the new pair
                // in memory so the next call refreshes with it.
                error!(error = %e, "Refreshed tokens could not be persisted");
                Err(TokenError::Store(e))
            }
        }
    }
}
