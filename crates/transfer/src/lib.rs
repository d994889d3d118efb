//! Transfer record model, content hashing and cooperative cancellation.
//!
//! This crate has no network code. It owns the pieces every transfer stage
//! shares: the per-direction status machines, single-pass content digests,
//! content-key derivation, the cancellation registry and progress throttling.

mod cancel;
mod chunked;
mod content_key;
mod progress;
mod types;
mod validation;

pub use cancel::{CancelGuard, CancelIntent, CancelRegistry, FlagState};
pub use chunked::{
    Chunk, ChunkReader, ContentSource, FileSource, ReadSeek, checksum_bytes, digest_file,
    digest_source, verify_digest,
};
pub use content_key::ContentKey;
pub use progress::{ProgressThrottle, percent_of};
pub use types::{
    Digests, Direction, DownloadState, DownloadStatus, StorageCredential, TransferDraft,
    TransferId, TransferKind, TransferRecord, TransferStatus, UploadState, UploadStatus,
};
pub use validation::{resolve_within_root, validate_relative_path};

/// Default chunk size: 4 MiB.
///
/// Used both for hashing reads and for chunked uploads unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Buffer size for hashing and streaming reads (64 KiB).
///
/// Cancellation is polled once per buffer, so this bounds how much I/O a
/// cancelled worker performs before it notices.
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("illegal status transition: {from} -> {to}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("{0} is not valid for a {1} transfer")]
    DirectionMismatch(TransferStatus, Direction),

    #[error("empty content digest")]
    EmptyDigest,

    #[error("cancelled")]
    Cancelled,
}
