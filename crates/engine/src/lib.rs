//! Transfer engine.
//!
//! Persists [`TransferRecord`](driftbox_transfer::TransferRecord)s, drives
//! uploads through hash, negotiate, chunked upload and commit, drives
//! downloads through ranged fetch, verification and promotion, and exposes
//! the [`TransferEngine`] controller that pauses, resumes, retries and
//! cancels them.

pub mod checkpoint;
pub mod config;
pub mod download;
mod engine;
pub mod error;
mod stage;
pub mod store;
pub mod transport;
mod upload;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{EngineConfig, config_path};
pub use download::{ContentRange, Fetcher, parse_content_range, temp_path};
pub use engine::{EngineParts, TransferEngine};
pub use error::{EngineError, StoreError, TransportError};
pub use store::{JsonTransferStore, Mutation, RecordChange, TransferStore};
pub use transport::{ChunkedUploadTransport, HttpChunkedTransport, PutRequest, TransportFuture};
