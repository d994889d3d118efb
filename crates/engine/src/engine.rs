//! The transfer controller.
//!
//! [`TransferEngine`] creates records, spawns one task per running transfer
//! and serves pause, resume, retry and cancel requests. Controller changes
//! are written through [`TransferStore::modify`] before the worker is
//! signalled, so the record always reflects the caller's decision even if
//! the worker is mid-write.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use driftbox_api::{ApiClient, BackendApi, DownloadEntry, RestBackend, RestRefresher};
use driftbox_session::{CredentialStore, Session, SessionState, TokenRefresher};
use driftbox_transfer::{
    CancelGuard, CancelIntent, CancelRegistry, ContentKey, ContentSource, Direction,
    DownloadState, DownloadStatus, FlagState, TransferDraft, TransferId, TransferKind,
    TransferRecord, TransferStatus, UploadState, UploadStatus, resolve_within_root,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::download::{self, Fetcher, temp_path};
use crate::error::EngineError;
use crate::stage::StageContext;
use crate::store::{JsonTransferStore, RecordChange, TransferStore};
use crate::transport::{ChunkedUploadTransport, HttpChunkedTransport};
use crate::upload;

/// Collaborators the engine drives.
pub struct EngineParts {
    pub store: Arc<dyn TransferStore>,
    pub backend: Arc<dyn BackendApi>,
    pub transport: Arc<dyn ChunkedUploadTransport>,
    pub fetcher: Fetcher,
}

pub(crate) struct Inner {
    pub store: Arc<dyn TransferStore>,
    pub backend: Arc<dyn BackendApi>,
    pub transport: Arc<dyn ChunkedUploadTransport>,
    pub fetcher: Fetcher,
    pub config: EngineConfig,
    registry: CancelRegistry,
    sources: Mutex<HashMap<TransferId, Arc<dyn ContentSource>>>,
    tasks: Mutex<HashMap<TransferId, JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Both maps stay consistent after a panic: each mutation is one insert or remove.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    pub(crate) fn lock_sources(
        &self,
    ) -> MutexGuard<'_, HashMap<TransferId, Arc<dyn ContentSource>>> {
        lock(&self.sources)
    }

    fn forget_source(&self, id: TransferId) {
        self.lock_sources().remove(&id);
    }

    /// Runs after a worker exits and its flag is gone.
    fn after_exit(&self, id: TransferId) {
        match self.store.get(id) {
            Ok(Some(r)) if r.status().is_cancelling() => self.discard(&r),
            Ok(Some(r)) if r.status().is_completed() => self.forget_source(id),
            Ok(Some(r)) => debug!(%id, status = %r.status(), "worker exited"),
            Ok(None) => self.forget_source(id),
            Err(e) => warn!(%id, error = %e, "failed to read record after worker exit"),
        }
    }

    /// Drops resumable state for a cancelled record, then the record itself.
    /// Safe to call more than once.
    fn discard(&self, record: &TransferRecord) {
        match &record.kind {
            TransferKind::Upload(_) => {
                if let Some(key) = self.upload_key(record) {
                    if self.checkpoint_shared(record) {
                        debug!(id = %record.id, %key, "checkpoint still used by another upload");
                    } else if let Err(e) = self.transport.clear_checkpoint(&key) {
                        warn!(id = %record.id, %key, error = %e, "failed to clear checkpoint");
                    }
                }
            }
            TransferKind::Download(_) => {
                let temp = temp_path(&record.local_path);
                match std::fs::remove_file(&temp) {
                    Ok(()) => debug!(id = %record.id, path = %temp.display(), "partial file removed"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(id = %record.id, path = %temp.display(), error = %e, "failed to remove partial file")
                    }
                }
            }
        }
        match self.store.delete(record.id) {
            Ok(true) => info!(id = %record.id, "transfer cancelled"),
            Ok(false) => {}
            Err(e) => warn!(id = %record.id, error = %e, "failed to delete cancelled record"),
        }
        self.forget_source(record.id);
    }

    fn upload_key(&self, record: &TransferRecord) -> Option<ContentKey> {
        let digests = record.digests.as_ref()?;
        ContentKey::from_hash(&self.config.content_key_prefix, &digests.sha256).ok()
    }

    /// Another unfinished upload of the same content resumes from the same
    /// checkpoint.
    fn checkpoint_shared(&self, record: &TransferRecord) -> bool {
        let Some(digests) = &record.digests else {
            return false;
        };
        match self.store.list_by_direction(Direction::Upload) {
            Ok(all) => all.iter().any(|other| {
                other.id != record.id
                    && !other.status().is_terminal()
                    && other.digests.as_ref().map(|d| &d.sha256) == Some(&digests.sha256)
            }),
            Err(e) => {
                warn!(error = %e, "failed to list uploads");
                false
            }
        }
    }
}

/// Drives transfers through their stages.
///
/// Cloning is cheap; clones share the same state. Methods that start work
/// spawn onto the current Tokio runtime.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

fn upload_status(status: UploadStatus) -> TransferStatus {
    TransferStatus::Upload(status)
}

fn download_status(status: DownloadStatus) -> TransferStatus {
    TransferStatus::Download(status)
}

fn status_for(direction: Direction, upload: UploadStatus, download: DownloadStatus) -> TransferStatus {
    match direction {
        Direction::Upload => upload_status(upload),
        Direction::Download => download_status(download),
    }
}

impl TransferEngine {
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: parts.store,
                backend: parts.backend,
                transport: parts.transport,
                fetcher: parts.fetcher,
                config,
                registry: CancelRegistry::new(),
                sources: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wires the production stack: JSON record store, persisted session,
    /// REST backend behind the token refresher, and the HTTP chunked
    /// transport.
    pub fn from_config(config: EngineConfig) -> Result<(Self, Arc<Session>), EngineError> {
        let timeout = config.request_timeout();
        let session = Arc::new(Session::with_store(CredentialStore::new(
            config.credentials_path.clone(),
        ))?);
        let refresher = Arc::new(RestRefresher::new(&config.api_base_url, timeout)?);
        let tokens = Arc::new(TokenRefresher::new(
            Arc::clone(&session),
            refresher,
            config.refresh_config(),
        ));
        let client = Arc::new(ApiClient::new(&config.api_base_url, tokens, timeout)?);
        let parts = EngineParts {
            store: Arc::new(JsonTransferStore::open(config.store_path.clone())?),
            backend: Arc::new(RestBackend::new(Arc::clone(&client))),
            transport: Arc::new(HttpChunkedTransport::new(
                config.checkpoint_dir.clone(),
                config.chunk_size,
                timeout,
            )?),
            fetcher: Fetcher::Authorized(client),
        };
        info!(api = %config.api_base_url, "transfer engine ready");
        Ok((Self::new(config, parts), session))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Stream of record creations, updates and deletions.
    pub fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.inner.store.subscribe()
    }

    pub fn get(&self, id: TransferId) -> Result<Option<TransferRecord>, EngineError> {
        Ok(self.inner.store.get(id)?)
    }

    /// All records, or those of one direction.
    pub fn list(&self, direction: Option<Direction>) -> Result<Vec<TransferRecord>, EngineError> {
        let records = match direction {
            Some(d) => self.inner.store.list_by_direction(d)?,
            None => self.inner.store.list_all()?,
        };
        Ok(records)
    }

    /// Whether a worker is executing for `id`.
    pub fn is_running(&self, id: TransferId) -> bool {
        self.inner.registry.is_running(id)
    }

    /// Starts uploading `source` into the backend folder `dest_folder`.
    pub fn start_upload(
        &self,
        source: Arc<dyn ContentSource>,
        dest_folder: &str,
    ) -> Result<TransferId, EngineError> {
        let size = source.size()?;
        let local_path = source
            .local_path()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| source.name().into());
        let id = self.inner.store.create(TransferDraft {
            name: source.name().to_string(),
            local_path,
            remote_locator: None,
            total_size: size,
            kind: TransferKind::Upload(UploadState {
                status: UploadStatus::Waiting,
                dest_folder: dest_folder.to_string(),
                credential: None,
            }),
        })?;
        info!(%id, name = source.name(), size, dest_folder, "upload requested");
        self.inner.lock_sources().insert(id, source);
        self.launch(id)?;
        Ok(id)
    }

    /// Starts downloading one remote file under `dest_root`.
    ///
    /// `entry.path` is kept relative to `dest_root`; a path escaping the root
    /// is rejected before any record is created.
    pub fn start_download(
        &self,
        entry: &DownloadEntry,
        dest_root: &Path,
    ) -> Result<TransferId, EngineError> {
        let final_path = resolve_within_root(dest_root, &entry.path)?;
        let id = self.inner.store.create(TransferDraft {
            name: entry.name.clone(),
            local_path: final_path,
            remote_locator: Some(entry.url.clone()),
            total_size: entry.size,
            kind: TransferKind::Download(DownloadState {
                status: DownloadStatus::Waiting,
                root: dest_root.to_path_buf(),
                relative_path: entry.path.clone(),
                expected_digest: entry.digest.clone(),
            }),
        })?;
        info!(%id, name = %entry.name, size = entry.size, "download requested");
        self.launch(id)?;
        Ok(id)
    }

    /// Asks the backend for `file_id` and starts one download per file. A
    /// folder yields one record per contained file.
    pub async fn start_remote_download(
        &self,
        file_id: &str,
        dest_root: &Path,
    ) -> Result<Vec<TransferId>, EngineError> {
        let manifest = self.inner.backend.begin_download(file_id).await?;
        debug!(
            file_id,
            is_folder = manifest.is_folder,
            entries = manifest.entries.len(),
            total_size = manifest.total_size,
            "download manifest received"
        );
        manifest
            .entries
            .iter()
            .map(|entry| self.start_download(entry, dest_root))
            .collect()
    }

    /// Pauses a running transfer, keeping its resumable state.
    ///
    /// Allowed while `IN_PROGRESS`, and from `WAITING` once the transfer has
    /// nothing left to hash or negotiate.
    pub fn pause(&self, id: TransferId) -> Result<(), EngineError> {
        let mut refused = None;
        let record = self
            .inner
            .store
            .modify(id, &mut |r| {
                let status = r.status();
                let pausable = match status {
                    TransferStatus::Upload(UploadStatus::InProgress) => true,
                    TransferStatus::Upload(UploadStatus::Waiting) => r.credential().is_some(),
                    TransferStatus::Download(
                        DownloadStatus::InProgress | DownloadStatus::Waiting,
                    ) => true,
                    _ => false,
                };
                if !pausable {
                    refused = Some(status);
                    return Ok(false);
                }
                r.transition(status_for(
                    r.direction(),
                    UploadStatus::Paused,
                    DownloadStatus::Paused,
                ))?;
                Ok(true)
            })?
            .ok_or(EngineError::NotFound(id))?;
        if let Some(status) = refused {
            return Err(EngineError::NotAllowed {
                action: "pause",
                status,
            });
        }
        self.inner.registry.request(id, CancelIntent::Pause);
        info!(%id, progress = record.progress, "transfer paused");
        Ok(())
    }

    /// Continues a paused transfer from its checkpoint.
    ///
    /// Also re-runs the commit of an upload whose bytes are stored, and
    /// re-checks a transfer that was waiting for file permission.
    ///
    /// A worker still unwinding from a pause is awaited first.
    pub async fn resume(&self, id: TransferId) -> Result<(), EngineError> {
        let guard = self.claim(id).await?;
        let mut refused = None;
        self.inner
            .store
            .modify(id, &mut |r| {
                let status = r.status();
                let next = match status {
                    s if s.is_paused() => status_for(
                        r.direction(),
                        UploadStatus::InProgress,
                        DownloadStatus::InProgress,
                    ),
                    TransferStatus::Upload(UploadStatus::StorageCompleted) => return Ok(false),
                    TransferStatus::Upload(UploadStatus::WaitingForPermission)
                    | TransferStatus::Download(DownloadStatus::WaitingForPermission) => status_for(
                        r.direction(),
                        UploadStatus::Waiting,
                        DownloadStatus::Waiting,
                    ),
                    _ => {
                        refused = Some(status);
                        return Ok(false);
                    }
                };
                r.transition(next)?;
                Ok(true)
            })?
            .ok_or(EngineError::NotFound(id))?;
        if let Some(status) = refused {
            return Err(EngineError::NotAllowed {
                action: "resume",
                status,
            });
        }
        info!(%id, "transfer resumed");
        self.spawn(guard);
        Ok(())
    }

    /// Starts a new attempt of a failed transfer.
    ///
    /// The earliest stage whose output is missing runs first; a download
    /// continues from its partial file. An upload whose commit failed only
    /// repeats the commit.
    pub async fn retry(&self, id: TransferId) -> Result<(), EngineError> {
        let guard = self.claim(id).await?;
        let mut refused = None;
        self.inner
            .store
            .modify(id, &mut |r| {
                let status = r.status();
                if status == upload_status(UploadStatus::StorageCompleted) {
                    return Ok(false);
                }
                if !status.is_failed() {
                    refused = Some(status);
                    return Ok(false);
                }
                r.transition(status_for(
                    r.direction(),
                    UploadStatus::Waiting,
                    DownloadStatus::Waiting,
                ))?;
                Ok(true)
            })?
            .ok_or(EngineError::NotFound(id))?;
        if let Some(status) = refused {
            return Err(EngineError::NotAllowed {
                action: "retry",
                status,
            });
        }
        info!(%id, "transfer retried");
        self.spawn(guard);
        Ok(())
    }

    /// Cancels a transfer and deletes its record.
    ///
    /// A running worker is signalled and cleans up on exit; otherwise the
    /// resumable state is dropped here. A completed record is just deleted.
    pub fn cancel(&self, id: TransferId) -> Result<(), EngineError> {
        let record = self
            .inner
            .store
            .modify(id, &mut |r| {
                let status = r.status();
                if status.is_terminal() {
                    return Ok(false);
                }
                r.transition(status_for(
                    r.direction(),
                    UploadStatus::Cancelling,
                    DownloadStatus::Cancelling,
                ))?;
                Ok(true)
            })?
            .ok_or(EngineError::NotFound(id))?;

        if record.status().is_completed() {
            self.inner.store.delete(id)?;
            self.inner.forget_source(id);
            info!(%id, "completed transfer removed");
            return Ok(());
        }
        if self.inner.registry.request(id, CancelIntent::Cancel) {
            debug!(%id, "cancel signalled, worker cleans up");
            return Ok(());
        }
        self.inner.discard(&record);
        Ok(())
    }

    /// Deletes completed records of `direction`. Returns how many.
    pub fn clear_completed(&self, direction: Direction) -> Result<usize, EngineError> {
        let status = status_for(direction, UploadStatus::Completed, DownloadStatus::Completed);
        let mut cleared = 0;
        for record in self.inner.store.list_by_status(status)? {
            if self.inner.store.delete(record.id)? {
                self.inner.forget_source(record.id);
                cleared += 1;
            }
        }
        info!(%direction, cleared, "completed transfers cleared");
        Ok(cleared)
    }

    /// Settles records a previous process left mid-flight.
    ///
    /// Interrupted transfers become `PAUSED` when they can resume from a
    /// checkpoint and `FAILED` otherwise; leftover `CANCELLING` records are
    /// discarded. Call once at startup. Returns the number of records touched.
    pub fn recover_interrupted(&self) -> Result<usize, EngineError> {
        let mut touched = 0;
        for record in self.inner.store.list_all()? {
            if self.inner.registry.is_running(record.id) {
                continue;
            }
            let status = record.status();
            if status.is_cancelling() {
                self.inner.discard(&record);
                touched += 1;
                continue;
            }
            let changed = self.inner.store.modify(record.id, &mut |r| {
                match r.status() {
                    TransferStatus::Upload(
                        UploadStatus::CalculatingHash | UploadStatus::HashCalculated,
                    ) => r.fail("interrupted before the upload started")?,
                    TransferStatus::Upload(UploadStatus::Waiting) if r.credential().is_none() => {
                        r.fail("interrupted before the upload started")?
                    }
                    TransferStatus::Upload(UploadStatus::Waiting | UploadStatus::InProgress) => {
                        r.transition(upload_status(UploadStatus::Paused))?
                    }
                    TransferStatus::Download(DownloadStatus::Waiting | DownloadStatus::InProgress) => {
                        r.transition(download_status(DownloadStatus::Paused))?
                    }
                    _ => return Ok(false),
                }
                Ok(true)
            });
            match changed {
                Ok(Some(r)) if r.status() != status => {
                    info!(id = %r.id, from = %status, to = %r.status(), "interrupted transfer recovered");
                    touched += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(id = %record.id, error = %e, "failed to recover transfer"),
            }
        }
        Ok(touched)
    }

    /// Stops every running worker. Pausable transfers become `PAUSED`; the
    /// rest are failed with `reason`, except a pending commit, which stays
    /// retryable as is.
    pub fn interrupt_all(&self, reason: &str) -> usize {
        let running = self.inner.registry.running();
        let count = running.len();
        for id in running {
            if self.pause(id).is_ok() {
                continue;
            }
            let result = self.inner.store.modify(id, &mut |r| {
                let failed = status_for(r.direction(), UploadStatus::Failed, DownloadStatus::Failed);
                if r.status().is_held_by_controller() || !r.status().can_transition_to(&failed) {
                    return Ok(false);
                }
                r.fail(reason)?;
                Ok(true)
            });
            if let Err(e) = result {
                warn!(%id, error = %e, "failed to record interruption");
            }
            self.inner.registry.request(id, CancelIntent::Pause);
        }
        if count > 0 {
            info!(count, reason, "running transfers interrupted");
        }
        count
    }

    /// Interrupts all transfers whenever the session stops being logged in.
    pub fn interrupt_on_logout(&self, session: &Session) -> JoinHandle<()> {
        let mut states = session.subscribe();
        let engine = self.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                if state != SessionState::LoggedIn {
                    engine.interrupt_all(&format!("session ended ({state:?})"));
                }
            }
        })
    }

    /// Waits until the worker for `id`, if any, has exited.
    pub async fn wait(&self, id: TransferId) {
        let handle = lock(&self.inner.tasks).remove(&id);
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(%id, error = %e, "transfer task panicked");
        }
    }

    /// Takes the cancellation flag for a new worker on `id`. A previous
    /// worker that was already told to stop is awaited; one still running
    /// normally makes this fail with `AlreadyRunning`.
    async fn claim(&self, id: TransferId) -> Result<CancelGuard, EngineError> {
        if let Some(guard) = self.inner.registry.register(id) {
            return Ok(guard);
        }
        if let FlagState::Requested(intent) = self.inner.registry.state(id) {
            debug!(%id, ?intent, "waiting for the stopping worker to exit");
            self.wait(id).await;
            if let Some(guard) = self.inner.registry.register(id) {
                return Ok(guard);
            }
        }
        Err(EngineError::AlreadyRunning(id))
    }

    fn launch(&self, id: TransferId) -> Result<(), EngineError> {
        let guard = self
            .inner
            .registry
            .register(id)
            .ok_or(EngineError::AlreadyRunning(id))?;
        self.spawn(guard);
        Ok(())
    }

    fn spawn(&self, guard: CancelGuard) {
        let id = guard.id();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let direction = match inner.store.get(id) {
                Ok(Some(r)) => Some(r.direction()),
                Ok(None) => None,
                Err(e) => {
                    warn!(%id, error = %e, "failed to load record");
                    None
                }
            };
            {
                let ctx = StageContext::new(&inner, &guard);
                match direction {
                    Some(Direction::Upload) => upload::drive(&ctx).await,
                    Some(Direction::Download) => download::drive(&ctx).await,
                    None => {}
                }
            }
            drop(guard);
            inner.after_exit(id);
        });
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|_, h| !h.is_finished());
        tasks.insert(id, handle);
    }
}
