//! Authenticated session state and single-flight credential renewal.
//!
//! The [`Session`] is an explicit object handed to every component that makes
//! authorized calls. Only the [`TokenRefresher`] replaces its bearer token;
//! everyone else reads it.

pub mod credentials;
pub mod jwt;
pub mod refresh;
pub mod session;

pub use credentials::{CredentialStore, Credentials, config_dir, default_credentials_path};
pub use refresh::{CredentialRefresher, RefreshConfig, RefreshedCredential, Recovery, TokenRefresher};
pub use session::{Session, SessionState};

/// Errors produced by session handling.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
}
