//! Chunked upload transport.
//!
//! Streams a content source to storage in fixed-size `PUT`s addressed by the
//! content key. Each acknowledged chunk advances an on-disk checkpoint, so a
//! later `put` with the same key and storage session continues from the last
//! acknowledged byte.
//!
//! Wire format, per chunk:
//!
//! ```text
//! PUT {domain}/upload/{content key}
//! Authorization: UpToken {credential}
//! Content-Range: bytes {first}-{last}/{total}
//! ```
//!
//! Any 2xx (or `308 Resume Incomplete`) acknowledges the chunk. 401/403
//! means the credential was refused.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use driftbox_transfer::{
    Chunk, ChunkReader, ContentKey, ContentSource, StorageCredential, TransferError, percent_of,
};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::TransportError;

/// Boxed future returned by [`ChunkedUploadTransport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// One upload call.
pub struct PutRequest {
    pub source: Arc<dyn ContentSource>,
    pub key: ContentKey,
    pub credential: StorageCredential,
    /// Receives the acknowledged percentage after each chunk.
    pub progress: mpsc::Sender<u8>,
    /// Stops the upload between chunks or mid-request. The checkpoint is kept.
    pub cancel: CancellationToken,
}

/// Resumable chunked upload to storage.
pub trait ChunkedUploadTransport: Send + Sync {
    /// Uploads `req.source` under `req.key`, resuming from any checkpoint
    /// left by an earlier call with the same key and storage session.
    ///
    /// Returns [`TransportError::Cancelled`] when `req.cancel` fires.
    fn put(&self, req: PutRequest) -> TransportFuture<'_, ()>;

    /// Discards the checkpoint for `key`.
    fn clear_checkpoint(&self, key: &ContentKey) -> Result<(), TransportError>;
}

/// [`ChunkedUploadTransport`] over HTTP with file checkpoints.
pub struct HttpChunkedTransport {
    http: reqwest::Client,
    checkpoints: CheckpointStore,
    chunk_size: usize,
}

impl HttpChunkedTransport {
    pub fn new(
        checkpoint_dir: impl Into<PathBuf>,
        chunk_size: usize,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            checkpoints: CheckpointStore::new(checkpoint_dir),
            chunk_size,
        })
    }

    /// The stored checkpoint for `key`, if any.
    pub fn checkpoint(&self, key: &ContentKey) -> Option<Checkpoint> {
        self.checkpoints.load(key)
    }

    /// Offset to resume from. A checkpoint for another session or another
    /// content size is stale and dropped.
    fn resume_offset(&self, key: &ContentKey, size: u64, storage_id: &str) -> u64 {
        match self.checkpoints.load(key) {
            Some(cp) if cp.size == size && cp.storage_id == storage_id && cp.offset <= size => {
                cp.offset
            }
            Some(cp) => {
                info!(%key, stale_offset = cp.offset, "discarding stale upload checkpoint");
                if let Err(e) = self.checkpoints.remove(key) {
                    warn!(%key, error = %e, "failed to remove stale checkpoint");
                }
                0
            }
            None => 0,
        }
    }

    async fn upload(&self, req: PutRequest) -> Result<(), TransportError> {
        if req.credential.domains.is_empty() {
            return Err(TransportError::NoDomain);
        }
        let size = req.source.size()?;
        let mut offset = self.resume_offset(&req.key, size, &req.credential.storage_id);

        let source = Arc::clone(&req.source);
        let chunk_size = self.chunk_size;
        let mut reader = tokio::task::spawn_blocking(move || {
            let mut reader = ChunkReader::new(source.as_ref(), chunk_size)?;
            reader.seek_to(offset)?;
            Ok::<_, TransferError>(reader)
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;

        if offset > 0 {
            info!(key = %req.key, offset, size, "resuming upload from checkpoint");
            let _ = req.progress.send(percent_of(offset, size)).await;
        }

        let mut domain = 0usize;
        if size == 0 {
            self.send_chunk(&req, &mut domain, None, 0).await?;
            return Ok(());
        }

        loop {
            if req.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let (r, next) = tokio::task::spawn_blocking(move || {
                let chunk = reader.next_chunk();
                (reader, chunk)
            })
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
            reader = r;
            let Some(chunk) = next? else {
                break;
            };

            let end = chunk.offset + chunk.data.len() as u64;
            self.send_chunk(&req, &mut domain, Some(&chunk), size).await?;
            offset = end;

            self.checkpoints.save(&Checkpoint {
                key: req.key.as_str().to_string(),
                storage_id: req.credential.storage_id.clone(),
                size,
                offset,
                updated_at: Utc::now(),
            })?;
            let _ = req.progress.send(percent_of(offset, size)).await;
        }

        if offset != size {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended at {offset} of {size} bytes"),
            )));
        }
        debug!(key = %req.key, size, "all chunks acknowledged");
        Ok(())
    }

    /// Sends one chunk, failing over to the next domain on connection-level
    /// errors. `domain` stays on the domain that last worked.
    async fn send_chunk(
        &self,
        req: &PutRequest,
        domain: &mut usize,
        chunk: Option<&Chunk>,
        total: u64,
    ) -> Result<(), TransportError> {
        let range = match chunk {
            Some(c) => format!(
                "bytes {}-{}/{}",
                c.offset,
                c.offset + c.data.len() as u64 - 1,
                total
            ),
            None => format!("bytes */{total}"),
        };
        let domains = &req.credential.domains;

        while let Some(base) = domains.get(*domain) {
            let url = format!("{}/upload/{}", base.trim_end_matches('/'), req.key);
            let body = chunk.map(|c| c.data.clone()).unwrap_or_default();
            let send = self
                .http
                .put(&url)
                .header(AUTHORIZATION, format!("UpToken {}", req.credential.token))
                .header(CONTENT_RANGE, &range)
                .body(body)
                .send();

            let result = tokio::select! {
                _ = req.cancel.cancelled() => return Err(TransportError::Cancelled),
                r = send => r,
            };

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() || status == StatusCode::PERMANENT_REDIRECT {
                        debug!(key = %req.key, %range, "chunk acknowledged");
                        return Ok(());
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(TransportError::CredentialRejected);
                    }
                    let body = resp.text().await.unwrap_or_default();
                    return Err(TransportError::Rejected {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!(domain = %base, error = %e, "upload domain unreachable, trying next");
                    *domain += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TransportError::NoDomain)
    }
}

impl ChunkedUploadTransport for HttpChunkedTransport {
    fn put(&self, req: PutRequest) -> TransportFuture<'_, ()> {
        Box::pin(self.upload(req))
    }

    fn clear_checkpoint(&self, key: &ContentKey) -> Result<(), TransportError> {
        Ok(self.checkpoints.remove(key)?)
    }
}
