//! Shared fixtures: a mock storage/download HTTP server, an in-memory
//! backend, and an engine wired to both.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use driftbox_api::{
    ApiError, ApiFuture, BackendApi, BeginUploadRequest, BeginUploadResponse, DownloadManifest,
    FinalizeUploadRequest,
};
use driftbox_engine::{
    EngineConfig, EngineParts, Fetcher, HttpChunkedTransport, JsonTransferStore, TransferEngine,
    TransferStore, parse_content_range,
};
use driftbox_transfer::{TransferId, TransferRecord};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ---------------------------------------------------------------------------
// Mock HTTP server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    files: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    put_ranges: Mutex<Vec<String>>,
    get_ranges: Mutex<Vec<Option<String>>>,
    failing_gets: AtomicUsize,
    put_delay_ms: AtomicU64,
    stream_delay_ms: AtomicU64,
}

/// Serves `GET /files/{name}` with byte ranges and accepts
/// `PUT /upload/{key}` chunks.
pub struct MockServer {
    pub base: String,
    state: Arc<ServerState>,
}

struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(ServerState::default());

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&shared);
                tokio::spawn(async move { handle(stream, state).await });
            }
        });

        Self {
            base: format!("http://127.0.0.1:{port}"),
            state,
        }
    }

    pub fn serve_file(&self, name: &str, data: Vec<u8>) {
        self.state
            .files
            .lock()
            .unwrap()
            .insert(name.to_string(), data);
    }

    pub fn file_url(&self, name: &str) -> String {
        format!("{}/files/{name}", self.base)
    }

    /// Bytes received so far for a content key.
    pub fn uploaded(&self, key: &str) -> Option<Vec<u8>> {
        self.state.uploads.lock().unwrap().get(key).cloned()
    }

    /// `Content-Range` of every PUT, in arrival order.
    pub fn put_ranges(&self) -> Vec<String> {
        self.state.put_ranges.lock().unwrap().clone()
    }

    /// `Range` header of every GET, in arrival order.
    pub fn get_ranges(&self) -> Vec<Option<String>> {
        self.state.get_ranges.lock().unwrap().clone()
    }

    pub fn fail_next_gets(&self, n: usize) {
        self.state.failing_gets.store(n, Ordering::SeqCst);
    }

    pub fn set_put_delay(&self, ms: u64) {
        self.state.put_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Delay between 16 KiB pieces of a GET body.
    pub fn set_stream_delay(&self, ms: u64) {
        self.state.stream_delay_ms.store(ms, Ordering::SeqCst);
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|l| {
            let (name, value) = l.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();

    let body_len: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < body_len {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(body_len);

    Some(Request {
        method,
        path,
        headers,
        body,
    })
}

async fn respond(stream: &mut TcpStream, status: &str, headers: &[(&str, String)], body: &[u8]) {
    let mut head = format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n", body.len());
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body).await;
    let _ = stream.shutdown().await;
}

async fn handle(mut stream: TcpStream, state: Arc<ServerState>) {
    let Some(req) = read_request(&mut stream).await else {
        return;
    };

    if req.method == "PUT" {
        if let Some(key) = req.path.strip_prefix("/upload/") {
            let delay = state.put_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let range = req.headers.get("content-range").cloned().unwrap_or_default();
            let start = parse_content_range(&range)
                .and_then(|r| r.start)
                .unwrap_or(0) as usize;
            {
                let mut uploads = state.uploads.lock().unwrap();
                let stored = uploads.entry(key.to_string()).or_default();
                if stored.len() < start + req.body.len() {
                    stored.resize(start + req.body.len(), 0);
                }
                stored[start..start + req.body.len()].copy_from_slice(&req.body);
            }
            state.put_ranges.lock().unwrap().push(range);
            respond(&mut stream, "200 OK", &[], b"").await;
            return;
        }
    }

    if req.method == "GET" {
        if let Some(name) = req.path.strip_prefix("/files/") {
            let range = req.headers.get("range").cloned();
            state.get_ranges.lock().unwrap().push(range.clone());

            if state
                .failing_gets
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                respond(&mut stream, "500 Internal Server Error", &[], b"boom").await;
                return;
            }

            let data = state.files.lock().unwrap().get(name).cloned();
            let Some(data) = data else {
                respond(&mut stream, "404 Not Found", &[], b"").await;
                return;
            };
            let len = data.len();
            let start = range
                .as_deref()
                .and_then(|r| r.strip_prefix("bytes="))
                .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok());

            let (status, extra, body) = match start {
                Some(s) if s >= len => {
                    respond(
                        &mut stream,
                        "416 Range Not Satisfiable",
                        &[("Content-Range", format!("bytes */{len}"))],
                        b"",
                    )
                    .await;
                    return;
                }
                Some(s) => (
                    "206 Partial Content",
                    vec![("Content-Range", format!("bytes {s}-{}/{len}", len - 1))],
                    data[s..].to_vec(),
                ),
                None => ("200 OK", vec![], data),
            };

            let mut head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n",
                body.len()
            );
            for (name, value) in &extra {
                head.push_str(&format!("{name}: {value}\r\n"));
            }
            head.push_str("\r\n");
            if stream.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            let delay = state.stream_delay_ms.load(Ordering::SeqCst);
            for piece in body.chunks(16 * 1024) {
                if stream.write_all(piece).await.is_err() {
                    return;
                }
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
            let _ = stream.shutdown().await;
            return;
        }
    }

    respond(&mut stream, "404 Not Found", &[], b"").await;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Backend that issues credentials for unknown digests and remembers
/// committed ones.
#[derive(Default)]
pub struct FakeBackend {
    pub domains: Mutex<Vec<String>>,
    known: Mutex<HashSet<String>>,
    pub begin_calls: AtomicUsize,
    pub finalize_calls: AtomicUsize,
    finalize_failures: AtomicUsize,
    manifest: Mutex<Option<DownloadManifest>>,
}

impl FakeBackend {
    pub fn new(domains: Vec<String>) -> Self {
        Self {
            domains: Mutex::new(domains),
            ..Self::default()
        }
    }

    pub fn mark_known(&self, sha256: &str) {
        self.known.lock().unwrap().insert(sha256.to_string());
    }

    pub fn fail_next_finalizes(&self, n: usize) {
        self.finalize_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_manifest(&self, manifest: DownloadManifest) {
        *self.manifest.lock().unwrap() = Some(manifest);
    }

    pub fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }
}

impl BackendApi for FakeBackend {
    fn begin_upload<'a>(&'a self, req: &'a BeginUploadRequest) -> ApiFuture<'a, BeginUploadResponse> {
        Box::pin(async move {
            self.begin_calls.fetch_add(1, Ordering::SeqCst);
            if self.known.lock().unwrap().contains(&req.sha256) {
                return Ok(BeginUploadResponse {
                    exists: true,
                    ..BeginUploadResponse::default()
                });
            }
            Ok(BeginUploadResponse {
                exists: false,
                credential: Some("up-token".into()),
                domains: Some(self.domains.lock().unwrap().clone()),
                storage_id: Some("store-1".into()),
            })
        })
    }

    fn finalize_upload<'a>(&'a self, req: &'a FinalizeUploadRequest) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            self.finalize_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .finalize_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ApiError::Api {
                    status: 503,
                    body: "try later".into(),
                });
            }
            self.known.lock().unwrap().insert(req.sha256.clone());
            Ok(())
        })
    }

    fn begin_download<'a>(&'a self, file_id: &'a str) -> ApiFuture<'a, DownloadManifest> {
        Box::pin(async move {
            self.manifest.lock().unwrap().clone().ok_or(ApiError::Api {
                status: 404,
                body: format!("no such file {file_id}"),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub engine: TransferEngine,
    pub store: Arc<JsonTransferStore>,
    pub backend: Arc<FakeBackend>,
    pub transport: Arc<HttpChunkedTransport>,
    pub server: MockServer,
    pub dir: tempfile::TempDir,
}

pub fn test_config(dir: &Path, chunk_size: usize) -> EngineConfig {
    EngineConfig {
        download_root: dir.join("downloads"),
        store_path: dir.join("transfers.json"),
        checkpoint_dir: dir.join("checkpoints"),
        credentials_path: dir.join("credentials.json"),
        chunk_size,
        progress_interval_ms: 0,
        request_timeout_secs: 5,
        ..EngineConfig::default()
    }
}

impl Harness {
    pub async fn new(chunk_size: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let config = test_config(dir.path(), chunk_size);
        let store = Arc::new(JsonTransferStore::open(config.store_path.clone()).unwrap());
        let backend = Arc::new(FakeBackend::new(vec![server.base.clone()]));
        let transport = Arc::new(
            HttpChunkedTransport::new(
                config.checkpoint_dir.clone(),
                chunk_size,
                config.request_timeout(),
            )
            .unwrap(),
        );
        let engine = TransferEngine::new(
            config.clone(),
            EngineParts {
                store: store.clone(),
                backend: backend.clone(),
                transport: transport.clone(),
                fetcher: Fetcher::anonymous(config.request_timeout()).unwrap(),
            },
        );
        Self {
            engine,
            store,
            backend,
            transport,
            server,
            dir,
        }
    }

    pub fn write_source(&self, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    pub fn downloads(&self) -> std::path::PathBuf {
        self.dir.path().join("downloads")
    }

    pub fn record(&self, id: TransferId) -> Option<TransferRecord> {
        self.store.get(id).unwrap()
    }

    /// Polls the record until `pred` holds, panicking after 20 seconds.
    pub async fn wait_until(
        &self,
        id: TransferId,
        what: &str,
        pred: impl Fn(&TransferRecord) -> bool,
    ) -> TransferRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            if let Some(r) = self.record(id)
                && pred(&r)
            {
                return r;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}: {:?}", self.record(id));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Deterministic, non-repeating test content.
pub fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).to_le_bytes()[i % 4] ^ seed)
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
