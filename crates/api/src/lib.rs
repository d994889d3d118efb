//! Backend REST surface consumed by the transfer engine.
//!
//! [`ApiClient`] attaches the session's bearer token to every request and
//! hands authorization failures to the [`TokenRefresher`]; stage code never
//! sees a 401.
//!
//! [`TokenRefresher`]: driftbox_session::TokenRefresher

pub mod backend;
pub mod client;
pub mod rest;
pub mod types;

pub use backend::{ApiFuture, BackendApi};
pub use client::ApiClient;
pub use rest::{RestBackend, RestRefresher};
pub use types::{
    BeginUploadRequest, BeginUploadResponse, DownloadEntry, DownloadManifest,
    FinalizeUploadRequest,
};

/// Errors from backend calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not authenticated")]
    NotAuthenticated,

    /// The credential could not be renewed and the session was cleared.
    #[error("session expired")]
    SessionExpired,

    /// Still unauthorized after replaying with a renewed credential.
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Connect/timeout failures, as opposed to a definite server answer.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Http(e) => e.is_connect() || e.is_timeout(),
            ApiError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
