//! Single-flight, cooldown-gated bearer token renewal.
//!
//! Any component that receives an authorization failure calls
//! [`TokenRefresher::recover`] with the token it used. At most one renewal
//! runs at a time; concurrent callers wait for it (bounded) and then retry
//! with whatever token the session holds.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::SessionError;
use crate::jwt::remaining_validity;
use crate::session::Session;

/// Result of a successful renewal call.
#[derive(Clone)]
pub struct RefreshedCredential {
    pub access_token: String,
    /// Set when the backend rotated the refresh secret.
    pub refresh_token: Option<String>,
}

/// The backend operation that exchanges a refresh secret for a new bearer token.
pub trait CredentialRefresher: Send + Sync {
    fn refresh_credential<'a>(
        &'a self,
        refresh_secret: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedCredential, SessionError>> + Send + 'a>>;
}

/// Timing knobs for the refresher.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// A renewal within this window of the previous one is skipped.
    pub cooldown: Duration,
    /// How long a caller waits for an in-flight renewal.
    pub wait_timeout: Duration,
    /// Proactive renewal starts this long before the token expires.
    pub lead_time: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(3),
            wait_timeout: Duration::from_secs(10),
            lead_time: Duration::from_secs(60),
        }
    }
}

/// What the caller should do after an authorization failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// Replay the request once with this token.
    Retry(String),
    /// The session is gone; do not retry.
    Declined,
}

/// Coordinates bearer token renewal for every in-flight request.
pub struct TokenRefresher {
    session: Arc<Session>,
    refresher: Arc<dyn CredentialRefresher>,
    config: RefreshConfig,
    gate: Mutex<()>,
    last_refresh: std::sync::Mutex<Option<Instant>>,
}

impl TokenRefresher {
    pub fn new(
        session: Arc<Session>,
        refresher: Arc<dyn CredentialRefresher>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            session,
            refresher,
            config,
            gate: Mutex::new(()),
            last_refresh: std::sync::Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Handles an authorization failure for a request sent with `failed_token`.
    pub async fn recover(&self, failed_token: &str) -> Recovery {
        if let Some(current) = self.replaced_token(failed_token) {
            debug!("credential already replaced, retrying");
            return Recovery::Retry(current);
        }
        if self.in_cooldown() {
            debug!("refresh skipped: within cooldown");
            return self.current_or_declined();
        }

        let _guard = match self.gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("refresh in flight, waiting");
                if tokio::time::timeout(self.config.wait_timeout, self.gate.lock())
                    .await
                    .is_err()
                {
                    warn!("timed out waiting for in-flight refresh");
                }
                return self.current_or_declined();
            }
        };

        // Another caller may have finished a renewal between our first check
        // and acquiring the gate.
        if let Some(current) = self.replaced_token(failed_token) {
            return Recovery::Retry(current);
        }
        if self.in_cooldown() {
            return self.current_or_declined();
        }

        self.run_refresh().await
    }

    /// Returns a token that is valid for at least the configured lead time,
    /// renewing it first if its embedded expiry is close.
    ///
    /// Opaque tokens are returned as-is. `None` means not authenticated.
    pub async fn ensure_fresh(&self) -> Option<String> {
        let token = self.session.access_token()?;
        match remaining_validity(&token, Utc::now()) {
            Some(left) if left <= self.config.lead_time => {
                info!(remaining_secs = left.as_secs(), "credential near expiry, renewing");
                match self.recover(&token).await {
                    Recovery::Retry(t) => Some(t),
                    Recovery::Declined => None,
                }
            }
            _ => Some(token),
        }
    }

    async fn run_refresh(&self) -> Recovery {
        let Some(secret) = self.session.refresh_token() else {
            warn!("no refresh credential available, ending session");
            self.session.expire();
            return Recovery::Declined;
        };

        info!("refreshing credential");
        let result = self.refresher.refresh_credential(&secret).await;
        *self
            .last_refresh
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());

        match result {
            Ok(fresh) => {
                let token = fresh.access_token.clone();
                self.session
                    .apply_refresh(fresh.access_token, fresh.refresh_token);
                if !self.session.is_authenticated() {
                    return Recovery::Declined;
                }
                info!("credential refreshed");
                Recovery::Retry(token)
            }
            Err(e) => {
                warn!(error = %e, "credential refresh failed, ending session");
                self.session.expire();
                Recovery::Declined
            }
        }
    }

    fn replaced_token(&self, failed_token: &str) -> Option<String> {
        self.session
            .access_token()
            .filter(|current| current != failed_token)
    }

    fn in_cooldown(&self) -> bool {
        self.last_refresh
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some_and(|at| at.elapsed() < self.config.cooldown)
    }

    fn current_or_declined(&self) -> Recovery {
        match self.session.access_token() {
            Some(token) => Recovery::Retry(token),
            None => Recovery::Declined,
        }
    }
}
