//! Resumable range download.
//!
//! Bytes land in `<final>.tmp` next to the destination. A resumed attempt
//! asks for `Range: bytes=<temp size>-`; the file is only moved into place
//! after the size and advertised digest check out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use driftbox_api::ApiClient;
use driftbox_transfer::{
    DownloadStatus, ProgressThrottle, TransferError, TransferRecord, TransferStatus, percent_of,
    resolve_within_root, verify_digest,
};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, HeaderMap, RANGE};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::stage::{Flow, StageContext};

/// Issues download requests, with or without the session bearer token.
#[derive(Clone)]
pub enum Fetcher {
    /// Goes through the [`ApiClient`], so expired tokens are refreshed.
    Authorized(Arc<ApiClient>),
    /// Pre-signed URLs that need no credentials.
    Anonymous(reqwest::Client),
}

impl Fetcher {
    pub fn anonymous(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Fetcher::Anonymous(http))
    }

    /// `GET url`, asking for the bytes from `offset` on when non-zero.
    pub async fn get(&self, url: &str, offset: u64) -> Result<reqwest::Response, TransportError> {
        let build = |http: &reqwest::Client| {
            let req = http.get(url);
            if offset > 0 {
                req.header(RANGE, format!("bytes={offset}-"))
            } else {
                req
            }
        };
        match self {
            Fetcher::Authorized(client) => Ok(client.send(build).await?),
            Fetcher::Anonymous(http) => Ok(build(http).send().await?),
        }
    }
}

/// Parsed `Content-Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte of the body; `None` for `bytes */N`.
    pub start: Option<u64>,
    /// Full resource length; `None` for `/*`.
    pub total: Option<u64>,
}

/// Parses `bytes 100-199/500`, `bytes */500` or `bytes 100-199/*`.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let start = match range.trim() {
        "*" => None,
        r => {
            let (first, last) = r.split_once('-')?;
            let first: u64 = first.trim().parse().ok()?;
            let last: u64 = last.trim().parse().ok()?;
            if last < first {
                return None;
            }
            Some(first)
        }
    };
    Some(ContentRange { start, total })
}

fn content_range(headers: &HeaderMap) -> Option<ContentRange> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()
        .and_then(parse_content_range)
}

/// Partial-data path for a destination: `a.jpg` -> `a.jpg.tmp`.
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn in_progress() -> TransferStatus {
    TransferStatus::Download(DownloadStatus::InProgress)
}

pub(crate) async fn drive(ctx: &StageContext<'_>) {
    let Some(record) = ctx.record() else { return };
    let Some(download) = record.download() else {
        return;
    };

    let final_path = match resolve_within_root(&download.root, &download.relative_path) {
        Ok(p) => p,
        Err(TransferError::Io(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            info!(id = %record.id, root = %download.root.display(), "download root not writable");
            ctx.advance(|r| {
                r.transition(TransferStatus::Download(DownloadStatus::WaitingForPermission))?;
                r.message = Some(format!("no write access to {}", e));
                Ok(())
            });
            return;
        }
        Err(e) => {
            ctx.fail(format!("invalid destination: {e}"));
            return;
        }
    };

    match download.status {
        DownloadStatus::Waiting => {
            if ctx.advance(|r| r.transition(in_progress())) == Flow::Stop {
                return;
            }
        }
        DownloadStatus::InProgress => {}
        _ => return,
    }

    fetch(ctx, &record, &final_path).await;
}

async fn fetch(ctx: &StageContext<'_>, record: &TransferRecord, final_path: &Path) {
    let Some(url) = record.remote_locator.as_deref() else {
        ctx.fail("no download URL");
        return;
    };
    let temp = temp_path(final_path);
    let mut offset = tokio::fs::metadata(&temp).await.map(|m| m.len()).unwrap_or(0);
    if offset > 0 {
        info!(id = %record.id, offset, "resuming download");
    }

    let sent = tokio::select! {
        _ = ctx.guard.token().cancelled() => return,
        r = ctx.inner.fetcher.get(url, offset) => r,
    };
    let mut resp = match sent {
        Ok(r) => r,
        Err(e) => {
            ctx.fail(format!("download request failed: {e}"));
            return;
        }
    };

    let status = resp.status();
    let total = match status {
        StatusCode::PARTIAL_CONTENT => {
            let range = content_range(resp.headers());
            let start = range.and_then(|r| r.start).unwrap_or(0);
            if start != offset {
                ctx.fail(format!("server resumed at byte {start}, expected {offset}"));
                return;
            }
            range
                .and_then(|r| r.total)
                .or_else(|| resp.content_length().map(|len| offset + len))
        }
        StatusCode::OK => {
            if offset > 0 {
                info!(id = %record.id, "server ignored range request, restarting");
                offset = 0;
            }
            resp.content_length()
        }
        StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
            let server_total = content_range(resp.headers()).and_then(|r| r.total);
            if server_total.unwrap_or(record.total_size) == offset {
                debug!(id = %record.id, offset, "temp file already complete");
                finish(ctx, record, &temp, final_path, offset).await;
            } else {
                remove_temp(&temp).await;
                ctx.fail(format!(
                    "partial data no longer matches the remote file (have {offset} bytes)"
                ));
            }
            return;
        }
        _ => {
            let body = resp.text().await.unwrap_or_default();
            ctx.fail(format!("download failed with {status}: {body}"));
            return;
        }
    };

    let opened = if offset == 0 {
        tokio::fs::File::create(&temp).await
    } else {
        tokio::fs::OpenOptions::new().append(true).open(&temp).await
    };
    let mut file = match opened {
        Ok(f) => f,
        Err(e) => {
            ctx.fail(format!("cannot write {}: {e}", temp.display()));
            return;
        }
    };

    let mut written = offset;
    let mut throttle = ProgressThrottle::new(Some(ctx.inner.config.progress_interval()));
    loop {
        let next = tokio::select! {
            _ = ctx.guard.token().cancelled() => {
                let _ = file.flush().await;
                debug!(id = %record.id, written, "download stopped");
                return;
            }
            c = resp.chunk() => c,
        };
        match next {
            Ok(Some(bytes)) => {
                if let Err(e) = file.write_all(&bytes).await {
                    ctx.fail(format!("write failed: {e}"));
                    return;
                }
                written += bytes.len() as u64;
                if let Some(total) = total {
                    let pct = percent_of(written, total);
                    if pct < 100 && throttle.should_emit(pct) && !ctx.progress(pct) {
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = file.flush().await;
                ctx.fail(format!("download interrupted at byte {written}: {e}"));
                return;
            }
        }
    }
    if let Err(e) = file.flush().await {
        ctx.fail(format!("write failed: {e}"));
        return;
    }
    drop(file);

    if let Some(total) = total
        && written != total
    {
        ctx.fail(format!("incomplete download: {written} of {total} bytes"));
        return;
    }
    finish(ctx, record, &temp, final_path, written).await;
}

/// Verifies the temp file and moves it into place.
async fn finish(
    ctx: &StageContext<'_>,
    record: &TransferRecord,
    temp: &Path,
    final_path: &Path,
    size: u64,
) {
    if size != record.total_size {
        debug!(id = %record.id, advertised = record.total_size, actual = size, "correcting size");
        if ctx.advance(|r| {
            r.total_size = size;
            Ok(())
        }) == Flow::Stop
        {
            return;
        }
    }

    let expected = record
        .download()
        .and_then(|d| d.expected_digest.clone())
        .filter(|d| !d.trim().is_empty());
    if let Some(expected) = expected {
        let path = temp.to_path_buf();
        let verified = tokio::task::spawn_blocking(move || verify_digest(&path, &expected)).await;
        match verified {
            Ok(Ok(())) => debug!(id = %record.id, "digest verified"),
            Ok(Err(e @ TransferError::ChecksumMismatch { .. })) => {
                remove_temp(temp).await;
                ctx.fail(e.to_string());
                return;
            }
            Ok(Err(e)) => {
                ctx.fail(format!("digest check failed: {e}"));
                return;
            }
            Err(e) => {
                ctx.fail(format!("digest check failed: {e}"));
                return;
            }
        }
    }

    if ctx.cancelled() {
        return;
    }
    let flow = ctx.advance(|r| {
        if final_path.exists() {
            std::fs::remove_file(final_path)?;
        }
        std::fs::rename(temp, final_path)?;
        r.transition(TransferStatus::Download(DownloadStatus::Completed))
    });
    if flow == Flow::Continue {
        info!(id = %record.id, path = %final_path.display(), size, "download completed");
    }
}

async fn remove_temp(temp: &Path) {
    match tokio::fs::remove_file(temp).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %temp.display(), error = %e, "failed to remove partial file"),
    }
}
