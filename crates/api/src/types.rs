//! Request and response bodies for the backend endpoints.

use serde::{Deserialize, Serialize};

/// Asks the backend whether content with this digest already exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginUploadRequest {
    pub sha256: String,
    pub md5: String,
    pub size: u64,
    pub name: String,
    pub dest_folder: String,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginUploadResponse {
    /// `true` when the content is already stored; the file was created
    /// server-side and no bytes need to move.
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_id: Option<String>,
}

impl std::fmt::Debug for BeginUploadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeginUploadResponse")
            .field("exists", &self.exists)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("domains", &self.domains)
            .field("storage_id", &self.storage_id)
            .finish()
    }
}

/// Records an uploaded object as a file in the user's tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeUploadRequest {
    pub md5: String,
    pub sha256: String,
    pub size: u64,
    pub name: String,
    pub dest_folder: String,
    pub storage_id: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadEntry {
    pub url: String,
    /// Path relative to the requested file or folder, e.g. `trip/a.jpg`.
    pub path: String,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadManifest {
    pub is_folder: bool,
    pub total_size: u64,
    pub entries: Vec<DownloadEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}
