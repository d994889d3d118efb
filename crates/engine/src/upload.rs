//! Upload pipeline: hash, negotiate, upload, commit.
//!
//! Each stage persists its outcome before the next one starts, so a
//! restarted worker picks up at the first stage whose output is missing:
//! no digests means hash, no credential means negotiate, and
//! `UPLOAD_STORAGE_COMPLETED` means commit only.

use driftbox_api::{BeginUploadRequest, FinalizeUploadRequest};
use driftbox_transfer::{
    ContentKey, ProgressThrottle, StorageCredential, TransferError, TransferRecord,
    TransferStatus, UploadStatus, digest_source,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::stage::{Flow, StageContext, Step};
use crate::transport::PutRequest;

const PROGRESS_CHANNEL: usize = 32;

fn upload(status: UploadStatus) -> TransferStatus {
    TransferStatus::Upload(status)
}

pub(crate) async fn drive(ctx: &StageContext<'_>) {
    loop {
        if ctx.cancelled() {
            return;
        }
        let Some(record) = ctx.record() else { return };
        let Some(state) = record.upload() else { return };

        let flow = match state.status {
            UploadStatus::Waiting if record.digests.is_none() => hash(ctx, &record).await,
            UploadStatus::Waiting if state.credential.is_none() => {
                ctx.advance(|r| r.transition(upload(UploadStatus::HashCalculated)))
            }
            UploadStatus::HashCalculated => negotiate(ctx, &record).await,
            UploadStatus::Waiting | UploadStatus::InProgress => send(ctx, &record).await,
            UploadStatus::StorageCompleted => {
                commit(ctx, &record).await;
                Flow::Stop
            }
            _ => Flow::Stop,
        };
        if flow == Flow::Stop {
            return;
        }
    }
}

fn content_key(ctx: &StageContext<'_>, record: &TransferRecord) -> Option<ContentKey> {
    let digests = record.digests.as_ref()?;
    match ContentKey::from_hash(&ctx.inner.config.content_key_prefix, &digests.sha256) {
        Ok(key) => Some(key),
        Err(e) => {
            ctx.fail(format!("cannot derive content key: {e}"));
            None
        }
    }
}

async fn hash(ctx: &StageContext<'_>, record: &TransferRecord) -> Flow {
    let Some(source) = ctx.source(record) else {
        ctx.fail(format!("source {} is no longer available", record.local_path.display()));
        return Flow::Stop;
    };
    if ctx.advance(|r| r.transition(upload(UploadStatus::CalculatingHash))) == Flow::Stop {
        return Flow::Stop;
    }

    let token = ctx.guard.token().clone();
    let digested = tokio::task::spawn_blocking(move || digest_source(source.as_ref(), &token)).await;
    match digested {
        Ok(Ok(digests)) => {
            debug!(id = %record.id, sha256 = %digests.sha256, "content hashed");
            ctx.advance(|r| {
                r.digests = Some(digests.clone());
                r.transition(upload(UploadStatus::HashCalculated))
            })
        }
        Ok(Err(TransferError::Cancelled)) => Flow::Stop,
        Ok(Err(TransferError::Io(e))) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            info!(id = %record.id, "source not readable, waiting for permission");
            ctx.advance(|r| {
                r.transition(upload(UploadStatus::WaitingForPermission))?;
                r.message = Some(format!("cannot read source: {e}"));
                Ok(())
            });
            Flow::Stop
        }
        Ok(Err(e)) => {
            ctx.fail(format!("hashing failed: {e}"));
            Flow::Stop
        }
        Err(e) => {
            ctx.fail(format!("hashing task failed: {e}"));
            Flow::Stop
        }
    }
}

async fn negotiate(ctx: &StageContext<'_>, record: &TransferRecord) -> Flow {
    let (Some(digests), Some(state)) = (record.digests.as_ref(), record.upload()) else {
        ctx.fail("no digests to negotiate with");
        return Flow::Stop;
    };
    let Some(key) = content_key(ctx, record) else {
        return Flow::Stop;
    };
    let req = BeginUploadRequest {
        sha256: digests.sha256.clone(),
        md5: digests.md5.clone(),
        size: record.total_size,
        name: record.name.clone(),
        dest_folder: state.dest_folder.clone(),
    };

    let answered = tokio::select! {
        _ = ctx.guard.token().cancelled() => return Flow::Stop,
        r = ctx.inner.backend.begin_upload(&req) => r,
    };
    let resp = match answered {
        Ok(r) => r,
        Err(e) => {
            ctx.fail(format!("upload negotiation failed: {e}"));
            return Flow::Stop;
        }
    };

    if resp.exists {
        let flow = ctx.advance(|r| r.transition(upload(UploadStatus::Completed)));
        if flow == Flow::Continue {
            info!(id = %record.id, %key, "content already stored, upload completed instantly");
        }
        return Flow::Stop;
    }

    let domains = resp.domains.unwrap_or_default();
    let (Some(token), Some(storage_id)) = (resp.credential, resp.storage_id) else {
        ctx.fail("backend issued no storage credential");
        return Flow::Stop;
    };
    if domains.is_empty() {
        ctx.fail("backend issued no upload domains");
        return Flow::Stop;
    }
    let credential = StorageCredential {
        token,
        domains,
        storage_id,
    };
    debug!(id = %record.id, %key, credential = ?credential, "storage credential issued");
    ctx.advance(|r| {
        r.set_credential(credential.clone(), &key);
        r.transition(upload(UploadStatus::Waiting))
    })
}

async fn send(ctx: &StageContext<'_>, record: &TransferRecord) -> Flow {
    let Some(credential) = record.credential().cloned() else {
        ctx.fail("no storage credential");
        return Flow::Stop;
    };
    let Some(key) = content_key(ctx, record) else {
        return Flow::Stop;
    };
    let Some(source) = ctx.source(record) else {
        ctx.fail(format!("source {} is no longer available", record.local_path.display()));
        return Flow::Stop;
    };
    if record.status() == upload(UploadStatus::Waiting)
        && ctx.advance(|r| r.transition(upload(UploadStatus::InProgress))) == Flow::Stop
    {
        return Flow::Stop;
    }

    let (tx, mut rx) = mpsc::channel(PROGRESS_CHANNEL);
    let put = ctx.inner.transport.put(PutRequest {
        source,
        key: key.clone(),
        credential,
        progress: tx,
        cancel: ctx.guard.token().clone(),
    });
    let interval = ctx.inner.config.progress_interval();
    let writer = async move {
        let mut throttle = ProgressThrottle::new(Some(interval));
        while let Some(pct) = rx.recv().await {
            if throttle.should_emit(pct) && !ctx.progress(pct) {
                break;
            }
        }
    };
    let (result, ()) = tokio::join!(put, writer);

    match result {
        Ok(()) => {
            let flow = ctx.advance(|r| {
                r.transition(upload(UploadStatus::StorageCompleted))?;
                r.progress = 100;
                Ok(())
            });
            if flow == Flow::Continue {
                info!(id = %record.id, %key, "all bytes stored, committing");
                if let Err(e) = ctx.inner.transport.clear_checkpoint(&key) {
                    warn!(%key, error = %e, "failed to clear upload checkpoint");
                }
            }
            flow
        }
        Err(e) if e.is_cancelled() || ctx.cancelled() => {
            debug!(id = %record.id, "upload stopped");
            Flow::Stop
        }
        Err(TransportError::CredentialRejected) => {
            if let Err(e) = ctx.inner.transport.clear_checkpoint(&key) {
                warn!(%key, error = %e, "failed to clear upload checkpoint");
            }
            if let Step::Rejected(e) = ctx.apply(|r| {
                r.clear_credential();
                r.fail("storage credential rejected; retry negotiates a new one")
            }) {
                warn!(id = %record.id, error = %e, "could not record failure");
            }
            Flow::Stop
        }
        Err(e) => {
            ctx.fail(format!("upload failed: {e}"));
            Flow::Stop
        }
    }
}

/// Records the stored file with the backend. A failure keeps the record in
/// `UPLOAD_STORAGE_COMPLETED` so a retry only repeats this step.
async fn commit(ctx: &StageContext<'_>, record: &TransferRecord) {
    let (Some(digests), Some(state), Some(credential)) =
        (record.digests.as_ref(), record.upload(), record.credential())
    else {
        commit_failed(ctx, "stored upload is missing its digests or credential");
        return;
    };
    let key = match ContentKey::from_hash(&ctx.inner.config.content_key_prefix, &digests.sha256) {
        Ok(key) => key,
        Err(e) => {
            commit_failed(ctx, format!("cannot derive content key: {e}"));
            return;
        }
    };
    let req = FinalizeUploadRequest {
        md5: digests.md5.clone(),
        sha256: digests.sha256.clone(),
        size: record.total_size,
        name: record.name.clone(),
        dest_folder: state.dest_folder.clone(),
        storage_id: credential.storage_id.clone(),
        key: key.as_str().to_string(),
    };

    let answered = tokio::select! {
        _ = ctx.guard.token().cancelled() => return,
        r = ctx.inner.backend.finalize_upload(&req) => r,
    };
    match answered {
        Ok(()) => {
            if ctx.advance(|r| r.transition(upload(UploadStatus::Completed))) == Flow::Continue {
                info!(id = %record.id, %key, "upload committed");
            }
        }
        Err(e) => {
            warn!(id = %record.id, error = %e, transient = e.is_transient(), "commit failed");
            commit_failed(ctx, e.to_string());
        }
    }
}

/// Notes a commit failure on the record. `UPLOAD_STORAGE_COMPLETED` cannot
/// move to `FAILED`; the status stays so a retry repeats only the commit.
fn commit_failed(ctx: &StageContext<'_>, reason: impl Into<String>) {
    let message = format!("commit failed: {}", reason.into());
    ctx.advance(|r| {
        r.message = Some(message.clone());
        r.touch();
        Ok(())
    });
}
