//! Backend operations used by the transfer stages.

use std::future::Future;
use std::pin::Pin;

use crate::ApiError;
use crate::types::{BeginUploadRequest, BeginUploadResponse, DownloadManifest, FinalizeUploadRequest};

/// Boxed future returned by [`BackendApi`] methods.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Abstract backend.
///
/// [`RestBackend`](crate::RestBackend) is the production implementation;
/// tests substitute in-memory fakes.
pub trait BackendApi: Send + Sync {
    /// Dedup check by content digest. Either confirms the content exists or
    /// issues a storage credential for a staged upload.
    fn begin_upload<'a>(&'a self, req: &'a BeginUploadRequest) -> ApiFuture<'a, BeginUploadResponse>;

    /// Records a storage-completed upload as a file.
    fn finalize_upload<'a>(&'a self, req: &'a FinalizeUploadRequest) -> ApiFuture<'a, ()>;

    /// Resolves a file or folder id into downloadable entries.
    fn begin_download<'a>(&'a self, file_id: &'a str) -> ApiFuture<'a, DownloadManifest>;
}
