//! Explicit session object.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::SessionError;
use crate::credentials::{CredentialStore, Credentials};

/// Authentication state observed by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    LoggedIn,
    /// The session was cleared because the credential could not be renewed.
    Expired,
}

/// Holder of the current credentials.
///
/// Reads are cheap and frequent; writes happen on login, logout and refresh.
/// State changes are published on a `watch` channel.
pub struct Session {
    creds: RwLock<Option<Credentials>>,
    store: Option<CredentialStore>,
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    /// Creates an in-memory session with no credentials.
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::LoggedOut);
        Self {
            creds: RwLock::new(None),
            store: None,
            state_tx,
        }
    }

    /// Creates a session backed by a credential file, restoring any saved login.
    pub fn with_store(store: CredentialStore) -> Result<Self, SessionError> {
        let creds = store.load()?;
        let state = if creds.is_some() {
            SessionState::LoggedIn
        } else {
            SessionState::LoggedOut
        };
        let (state_tx, _) = watch::channel(state);
        Ok(Self {
            creds: RwLock::new(creds),
            store: Some(store),
            state_tx,
        })
    }

    pub fn login(&self, creds: Credentials) -> Result<(), SessionError> {
        if let Some(store) = &self.store {
            store.save(&creds)?;
        }
        *self.write() = Some(creds);
        self.state_tx.send_replace(SessionState::LoggedIn);
        info!("session logged in");
        Ok(())
    }

    /// User-initiated logout.
    pub fn logout(&self) -> Result<(), SessionError> {
        self.clear(SessionState::LoggedOut)
    }

    /// Forced logout after a failed renewal.
    ///
    /// Returns `true` only for the call that actually ended the session, so the
    /// UI is told once rather than once per failing request.
    pub fn expire(&self) -> bool {
        if self.read().is_none() {
            return false;
        }
        if let Err(e) = self.clear(SessionState::Expired) {
            warn!(error = %e, "failed to clear persisted credentials");
        }
        warn!("session expired, credentials cleared");
        true
    }

    fn clear(&self, state: SessionState) -> Result<(), SessionError> {
        *self.write() = None;
        self.state_tx.send_replace(state);
        if let Some(store) = &self.store {
            store.clear()?;
        }
        Ok(())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().as_ref().map(|c| c.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read().as_ref().and_then(|c| c.refresh_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().is_some()
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Subscribes to login/logout changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Replaces the bearer token after a successful refresh.
    ///
    /// The refresh secret is kept unless the backend rotated it.
    pub(crate) fn apply_refresh(&self, access_token: String, refresh_token: Option<String>) {
        let snapshot = {
            let mut guard = self.write();
            let Some(creds) = guard.as_mut() else {
                // Logged out while the refresh was in flight.
                return;
            };
            creds.access_token = access_token;
            if refresh_token.is_some() {
                creds.refresh_token = refresh_token;
            }
            creds.clone()
        };
        if let Some(store) = &self.store
            && let Err(e) = store.save(&snapshot)
        {
            warn!(error = %e, "failed to persist refreshed credentials");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Credentials>> {
        self.creds.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Credentials>> {
        self.creds.write().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(access: &str) -> Credentials {
        Credentials {
            access_token: access.into(),
            refresh_token: Some("r".into()),
        }
    }

    #[test]
    fn login_and_logout_publish_state() {
        let session = Session::new();
        let rx = session.subscribe();
        assert_eq!(*rx.borrow(), SessionState::LoggedOut);

        session.login(creds("a")).unwrap();
        assert_eq!(*rx.borrow(), SessionState::LoggedIn);
        assert_eq!(session.access_token().as_deref(), Some("a"));

        session.logout().unwrap();
        assert_eq!(*rx.borrow(), SessionState::LoggedOut);
        assert!(session.access_token().is_none());
    }

    #[test]
    fn expire_reports_once() {
        let session = Session::new();
        session.login(creds("a")).unwrap();
        assert!(session.expire());
        assert!(!session.expire());
        assert_eq!(session.state(), SessionState::Expired);
    }

    #[test]
    fn refresh_keeps_secret_unless_rotated() {
        let session = Session::new();
        session.login(creds("a")).unwrap();
        session.apply_refresh("b".into(), None);
        assert_eq!(session.access_token().as_deref(), Some("b"));
        assert_eq!(session.refresh_token().as_deref(), Some("r"));

        session.apply_refresh("c".into(), Some("r2".into()));
        assert_eq!(session.refresh_token().as_deref(), Some("r2"));
    }

    #[test]
    fn restores_persisted_login() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        {
            let session = Session::with_store(CredentialStore::new(path.clone())).unwrap();
            session.login(creds("persisted")).unwrap();
            session.apply_refresh("renewed".into(), None);
        }
        let session = Session::with_store(CredentialStore::new(path.clone())).unwrap();
        assert_eq!(session.state(), SessionState::LoggedIn);
        assert_eq!(session.access_token().as_deref(), Some("renewed"));

        session.expire();
        assert!(!path.exists());
    }
}
