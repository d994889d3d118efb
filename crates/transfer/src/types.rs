use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ContentKey, TransferError};

/// Opaque transfer identifier, assigned by the record store at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// Upload state machine.
///
/// ```text
/// CalculatingHash -> HashCalculated -> Completed                       (instant upload)
///                                   -> Waiting -> InProgress -> StorageCompleted -> Completed
/// InProgress <-> Paused; InProgress -> Failed; * -> Cancelling
/// Failed -> Waiting                                                     (explicit retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Waiting,
    CalculatingHash,
    HashCalculated,
    WaitingForPermission,
    InProgress,
    /// Storage accepted every byte but the backend has not recorded the file yet.
    #[serde(rename = "UPLOAD_STORAGE_COMPLETED")]
    StorageCompleted,
    Paused,
    Cancelling,
    Completed,
    Failed,
}

impl UploadStatus {
    /// Returns `true` if `next` is reachable from `self` in one step.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Completed | Cancelling, _) => false,
            (_, Cancelling) => true,
            (Waiting, CalculatingHash | HashCalculated | WaitingForPermission | InProgress) => true,
            (Waiting, Paused | Failed) => true,
            (CalculatingHash, HashCalculated | WaitingForPermission | Failed) => true,
            (HashCalculated, Completed | Waiting | Failed) => true,
            (WaitingForPermission, Waiting | Failed) => true,
            (InProgress, StorageCompleted | Paused | Failed) => true,
            (StorageCompleted, Completed) => true,
            (Paused, InProgress) => true,
            (Failed, Waiting) => true,
            _ => false,
        }
    }
}

/// Download state machine: `Waiting -> InProgress -> Completed`, with
/// `Paused`, `Failed` and `Cancelling` reachable from `InProgress`. A resumed
/// download whose destination became unwritable moves from `InProgress` to
/// `WaitingForPermission`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    Waiting,
    WaitingForPermission,
    InProgress,
    Paused,
    Cancelling,
    Completed,
    Failed,
}

impl DownloadStatus {
    /// Returns `true` if `next` is reachable from `self` in one step.
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Completed | Cancelling, _) => false,
            (_, Cancelling) => true,
            (Waiting, InProgress | WaitingForPermission | Paused | Failed) => true,
            (WaitingForPermission, Waiting | Failed) => true,
            (InProgress, Completed | Paused | WaitingForPermission | Failed) => true,
            (Paused, InProgress) => true,
            (Failed, Waiting) => true,
            _ => false,
        }
    }
}

/// Status of a transfer, tagged by direction.
///
/// Direction-specific states (e.g. [`UploadStatus::StorageCompleted`]) only
/// exist on their own side, so a download can never sit in an upload state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "direction", content = "status", rename_all = "lowercase")]
pub enum TransferStatus {
    Upload(UploadStatus),
    Download(DownloadStatus),
}

impl TransferStatus {
    pub fn direction(&self) -> Direction {
        match self {
            TransferStatus::Upload(_) => Direction::Upload,
            TransferStatus::Download(_) => Direction::Download,
        }
    }

    pub fn can_transition_to(&self, next: &TransferStatus) -> bool {
        match (self, next) {
            (TransferStatus::Upload(a), TransferStatus::Upload(b)) => a.can_transition_to(*b),
            (TransferStatus::Download(a), TransferStatus::Download(b)) => a.can_transition_to(*b),
            _ => false,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            TransferStatus::Upload(UploadStatus::InProgress)
                | TransferStatus::Download(DownloadStatus::InProgress)
        )
    }

    pub fn is_paused(&self) -> bool {
        matches!(
            self,
            TransferStatus::Upload(UploadStatus::Paused)
                | TransferStatus::Download(DownloadStatus::Paused)
        )
    }

    pub fn is_cancelling(&self) -> bool {
        matches!(
            self,
            TransferStatus::Upload(UploadStatus::Cancelling)
                | TransferStatus::Download(DownloadStatus::Cancelling)
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TransferStatus::Upload(UploadStatus::Completed)
                | TransferStatus::Download(DownloadStatus::Completed)
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            TransferStatus::Upload(UploadStatus::Failed)
                | TransferStatus::Download(DownloadStatus::Failed)
        )
    }

    /// No further transitions except deletion.
    pub fn is_terminal(&self) -> bool {
        self.is_completed() || self.is_cancelling()
    }

    /// A worker is expected to be driving the record in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransferStatus::Upload(
                UploadStatus::CalculatingHash
                    | UploadStatus::HashCalculated
                    | UploadStatus::InProgress
            ) | TransferStatus::Download(DownloadStatus::InProgress)
        )
    }

    /// Paused or cancelling: a controller decision a worker must not overwrite.
    pub fn is_held_by_controller(&self) -> bool {
        self.is_paused() || self.is_cancelling()
    }

    /// Wire-style label, e.g. `IN_PROGRESS`.
    pub fn label(&self) -> &'static str {
        match self {
            TransferStatus::Upload(s) => match s {
                UploadStatus::Waiting => "WAITING",
                UploadStatus::CalculatingHash => "CALCULATING_HASH",
                UploadStatus::HashCalculated => "HASH_CALCULATED",
                UploadStatus::WaitingForPermission => "WAITING_FOR_PERMISSION",
                UploadStatus::InProgress => "IN_PROGRESS",
                UploadStatus::StorageCompleted => "UPLOAD_STORAGE_COMPLETED",
                UploadStatus::Paused => "PAUSED",
                UploadStatus::Cancelling => "CANCELLING",
                UploadStatus::Completed => "COMPLETED",
                UploadStatus::Failed => "FAILED",
            },
            TransferStatus::Download(s) => match s {
                DownloadStatus::Waiting => "WAITING",
                DownloadStatus::WaitingForPermission => "WAITING_FOR_PERMISSION",
                DownloadStatus::InProgress => "IN_PROGRESS",
                DownloadStatus::Paused => "PAUSED",
                DownloadStatus::Cancelling => "CANCELLING",
                DownloadStatus::Completed => "COMPLETED",
                DownloadStatus::Failed => "FAILED",
            },
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.direction(), self.label())
    }
}

/// Content digests, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digests {
    pub md5: String,
    pub sha256: String,
}

/// Storage-side upload credential issued by the backend when content is new.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageCredential {
    pub token: String,
    /// Upload domains, tried in order.
    pub domains: Vec<String>,
    pub storage_id: String,
}

impl fmt::Debug for StorageCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredential")
            .field("token", &"<redacted>")
            .field("domains", &self.domains)
            .field("storage_id", &self.storage_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadState {
    pub status: UploadStatus,
    /// Backend folder the file is committed into.
    pub dest_folder: String,
    /// Present only once the negotiation stage succeeded with `exists = false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<StorageCredential>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadState {
    pub status: DownloadStatus,
    /// Writable root the file must stay inside.
    pub root: PathBuf,
    /// Path relative to `root`, e.g. `photos/2024/a.jpg`.
    pub relative_path: String,
    /// Hex digest advertised by the backend, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<String>,
}

/// Direction-specific part of a record. The status lives here so that the
/// direction of the status and of the metadata can never disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum TransferKind {
    Upload(UploadState),
    Download(DownloadState),
}

/// Everything needed to create a record; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct TransferDraft {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_locator: Option<String>,
    pub total_size: u64,
    pub kind: TransferKind,
}

/// A persisted transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub name: String,
    /// Percent in `[0, 100]`.
    pub progress: u8,
    pub local_path: PathBuf,
    /// Download URL, or the content key once an upload has a credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_locator: Option<String>,
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digests: Option<Digests>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Human-readable reason for the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub kind: TransferKind,
}

impl TransferRecord {
    /// Builds a record from a draft. Used by record stores.
    pub fn from_draft(id: TransferId, draft: TransferDraft) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: draft.name,
            progress: 0,
            local_path: draft.local_path,
            remote_locator: draft.remote_locator,
            total_size: draft.total_size,
            digests: None,
            created_at: now,
            updated_at: now,
            message: None,
            kind: draft.kind,
        }
    }

    pub fn status(&self) -> TransferStatus {
        match &self.kind {
            TransferKind::Upload(u) => TransferStatus::Upload(u.status),
            TransferKind::Download(d) => TransferStatus::Download(d.status),
        }
    }

    pub fn direction(&self) -> Direction {
        match self.kind {
            TransferKind::Upload(_) => Direction::Upload,
            TransferKind::Download(_) => Direction::Download,
        }
    }

    pub fn upload(&self) -> Option<&UploadState> {
        match &self.kind {
            TransferKind::Upload(u) => Some(u),
            TransferKind::Download(_) => None,
        }
    }

    pub fn download(&self) -> Option<&DownloadState> {
        match &self.kind {
            TransferKind::Download(d) => Some(d),
            TransferKind::Upload(_) => None,
        }
    }

    /// Moves the record to `next`, enforcing the state machine.
    ///
    /// Re-entering `Waiting` from `Failed` starts a fresh attempt: progress
    /// and message are reset. Reaching `Completed` pins progress to 100.
    pub fn transition(&mut self, next: TransferStatus) -> Result<(), TransferError> {
        let current = self.status();
        if current.direction() != next.direction() {
            return Err(TransferError::DirectionMismatch(next, self.direction()));
        }
        if !current.can_transition_to(&next) {
            return Err(TransferError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        match (&mut self.kind, next) {
            (TransferKind::Upload(u), TransferStatus::Upload(s)) => u.status = s,
            (TransferKind::Download(d), TransferStatus::Download(s)) => d.status = s,
            _ => unreachable!("direction checked above"),
        }

        if current.is_failed() && !next.is_failed() && !next.is_cancelling() {
            self.progress = 0;
            self.message = None;
        }
        if next.is_completed() {
            self.progress = 100;
            self.message = None;
        }
        self.touch();
        Ok(())
    }

    /// Marks the attempt failed with a message. Illegal from terminal states.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransferError> {
        let next = match self.direction() {
            Direction::Upload => TransferStatus::Upload(UploadStatus::Failed),
            Direction::Download => TransferStatus::Download(DownloadStatus::Failed),
        };
        self.transition(next)?;
        self.message = Some(message.into());
        Ok(())
    }

    /// Applies a worker progress report.
    ///
    /// Only accepted while in progress, and never lowers the stored value.
    /// Returns `true` if the record changed.
    pub fn record_progress(&mut self, percent: u8) -> bool {
        if !self.status().is_in_progress() {
            return false;
        }
        let percent = percent.min(100);
        if percent <= self.progress {
            return false;
        }
        self.progress = percent;
        self.touch();
        true
    }

    /// Stores the negotiated credential and the content key it is bound to.
    pub fn set_credential(&mut self, credential: StorageCredential, key: &ContentKey) {
        if let TransferKind::Upload(u) = &mut self.kind {
            u.credential = Some(credential);
            self.remote_locator = Some(key.as_str().to_string());
            self.touch();
        }
    }

    /// Drops a credential the storage side no longer accepts, so the next
    /// attempt negotiates a fresh one.
    pub fn clear_credential(&mut self) {
        if let TransferKind::Upload(u) = &mut self.kind {
            u.credential = None;
            self.remote_locator = None;
            self.touch();
        }
    }

    pub fn credential(&self) -> Option<&StorageCredential> {
        self.upload().and_then(|u| u.credential.as_ref())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
