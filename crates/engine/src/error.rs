//! Engine error types.

use driftbox_api::ApiError;
use driftbox_transfer::{TransferError, TransferId, TransferStatus};

/// Errors from a [`TransferStore`](crate::TransferStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer {0} not found")]
    NotFound(TransferId),

    /// A read-modify-write closure rejected the change.
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Errors from a [`ChunkedUploadTransport`](crate::ChunkedUploadTransport)
/// or the download fetcher.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("storage rejected request with {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The storage credential was refused; a new one must be negotiated.
    #[error("storage credential rejected")]
    CredentialRejected,

    #[error("no upload domain reachable")]
    NoDomain,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            TransportError::Cancelled | TransportError::Transfer(TransferError::Cancelled)
        )
    }
}

/// Errors returned to callers of the [`TransferEngine`](crate::TransferEngine).
///
/// Stage failures never show up here; they become a `FAILED` status and a
/// message on the record.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("backend error: {0}")]
    Api(#[from] ApiError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("session error: {0}")]
    Session(#[from] driftbox_session::SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer {0} not found")]
    NotFound(TransferId),

    #[error("transfer {0} is already running")]
    AlreadyRunning(TransferId),

    #[error("cannot {action} a transfer in {status}")]
    NotAllowed {
        action: &'static str,
        status: TransferStatus,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
