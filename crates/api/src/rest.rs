//! REST implementations of [`BackendApi`] and [`CredentialRefresher`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use driftbox_session::{CredentialRefresher, RefreshedCredential, SessionError};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::debug;

use crate::backend::{ApiFuture, BackendApi};
use crate::client::{ApiClient, expect_success};
use crate::types::{
    BeginUploadRequest, BeginUploadResponse, DownloadManifest, FinalizeUploadRequest,
    RefreshRequest, RefreshResponse,
};
use crate::ApiError;

const REFRESH_PATH: &str = "/api/v1/auth/refresh";
const BEGIN_UPLOAD_PATH: &str = "/api/v1/uploads/begin";
const FINALIZE_UPLOAD_PATH: &str = "/api/v1/uploads/finalize";

/// Exchanges the refresh secret at the auth endpoint.
///
/// Uses its own unauthenticated client: a renewal must never recurse into
/// the renewal path.
pub struct RestRefresher {
    http: reqwest::Client,
    base_url: String,
}

impl RestRefresher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn exchange(&self, refresh_secret: &str) -> Result<RefreshedCredential, ApiError> {
        let url = format!("{}{REFRESH_PATH}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&RefreshRequest {
                refresh_token: refresh_secret,
            })
            .send()
            .await?;
        let body = expect_success(resp).await?.bytes().await?;
        let parsed: RefreshResponse = serde_json::from_slice(&body)?;
        if parsed.access_token.is_empty() {
            return Err(ApiError::InvalidResponse("empty access token".into()));
        }
        Ok(RefreshedCredential {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
        })
    }
}

impl CredentialRefresher for RestRefresher {
    fn refresh_credential<'a>(
        &'a self,
        refresh_secret: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshedCredential, SessionError>> + Send + 'a>> {
        Box::pin(async move {
            self.exchange(refresh_secret)
                .await
                .map_err(|e| SessionError::RefreshFailed(e.to_string()))
        })
    }
}

/// Backend reached over HTTP through an authorized [`ApiClient`].
pub struct RestBackend {
    client: Arc<ApiClient>,
}

impl RestBackend {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }
}

impl BackendApi for RestBackend {
    fn begin_upload<'a>(&'a self, req: &'a BeginUploadRequest) -> ApiFuture<'a, BeginUploadResponse> {
        Box::pin(async move {
            let url = self.client.url(BEGIN_UPLOAD_PATH);
            let resp: BeginUploadResponse = self
                .client
                .send_json(|http| http.post(&url).json(req))
                .await?;
            if !resp.exists && resp.credential.is_none() {
                return Err(ApiError::InvalidResponse(
                    "upload not deduplicated but no credential issued".into(),
                ));
            }
            debug!(name = %req.name, exists = resp.exists, "upload negotiated");
            Ok(resp)
        })
    }

    fn finalize_upload<'a>(&'a self, req: &'a FinalizeUploadRequest) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let url = self.client.url(FINALIZE_UPLOAD_PATH);
            let resp = self.client.send(|http| http.post(&url).json(req)).await?;
            expect_success(resp).await?;
            debug!(name = %req.name, key = %req.key, "upload finalized");
            Ok(())
        })
    }

    fn begin_download<'a>(&'a self, file_id: &'a str) -> ApiFuture<'a, DownloadManifest> {
        Box::pin(async move {
            let encoded = utf8_percent_encode(file_id, NON_ALPHANUMERIC).to_string();
            let url = self.client.url(&format!("/api/v1/files/{encoded}/download"));
            let manifest: DownloadManifest = self.client.send_json(|http| http.get(&url)).await?;
            debug!(
                file_id,
                entries = manifest.entries.len(),
                total_size = manifest.total_size,
                "download resolved"
            );
            Ok(manifest)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftbox_session::{Credentials, RefreshConfig, Session, TokenRefresher};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Starts a mock server that replies to one request per entry in
    /// `replies` and forwards each raw request to the returned receiver.
    async fn scripted_server(
        replies: Vec<(&'static str, String)>,
    ) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for (status, body) in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let _ = tx.send(read_request(&mut stream).await);
                let resp = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(resp.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });

        (format!("http://127.0.0.1:{port}"), rx)
    }

    /// Reads a full request: headers plus `Content-Length` bytes of body.
    async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let body_len = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn backend(url: &str) -> RestBackend {
        let session = Arc::new(Session::new());
        session
            .login(Credentials {
                access_token: "tok-1".into(),
                refresh_token: Some("secret".into()),
            })
            .unwrap();
        let refresher = Arc::new(RestRefresher::new(url, Duration::from_secs(5)).unwrap());
        let tokens = Arc::new(TokenRefresher::new(
            session,
            refresher,
            RefreshConfig::default(),
        ));
        RestBackend::new(Arc::new(
            ApiClient::new(url, tokens, Duration::from_secs(5)).unwrap(),
        ))
    }

    fn begin_request() -> BeginUploadRequest {
        BeginUploadRequest {
            sha256: "ab".repeat(32),
            md5: "cd".repeat(16),
            size: 42,
            name: "photo.jpg".into(),
            dest_folder: "/camera".into(),
        }
    }

    #[tokio::test]
    async fn begin_upload_sends_digests_and_bearer() {
        let (url, mut requests) = scripted_server(vec![(
            "200 OK",
            r#"{"exists":false,"credential":"up-tok","domains":["https://up.example"],"storageId":"s1"}"#
                .into(),
        )])
        .await;
        let backend = backend(&url);

        let resp = backend.begin_upload(&begin_request()).await.unwrap();
        assert!(!resp.exists);
        assert_eq!(resp.credential.as_deref(), Some("up-tok"));

        let raw = requests.recv().await.unwrap();
        assert!(raw.starts_with("POST /api/v1/uploads/begin"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer tok-1"));
        assert!(raw.contains(r#""destFolder":"/camera""#));
    }

    #[tokio::test]
    async fn begin_upload_without_credential_is_rejected() {
        let (url, _requests) = scripted_server(vec![("200 OK", r#"{"exists":false}"#.into())]).await;
        let backend = backend(&url);

        let err = backend.begin_upload(&begin_request()).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_through_auth_endpoint() {
        let (url, mut requests) = scripted_server(vec![
            ("401 Unauthorized", r#"{"error":"expired"}"#.into()),
            (
                "200 OK",
                r#"{"accessToken":"tok-2","refreshToken":"secret-2"}"#.into(),
            ),
            ("200 OK", r#"{"exists":true}"#.into()),
        ])
        .await;
        let backend = backend(&url);

        let resp = backend.begin_upload(&begin_request()).await.unwrap();
        assert!(resp.exists);

        let first = requests.recv().await.unwrap();
        let refresh = requests.recv().await.unwrap();
        let replay = requests.recv().await.unwrap();
        assert!(first.to_ascii_lowercase().contains("bearer tok-1"));
        assert!(refresh.starts_with("POST /api/v1/auth/refresh"));
        assert!(refresh.contains(r#""refreshToken":"secret""#));
        assert!(replay.to_ascii_lowercase().contains("bearer tok-2"));

        let session = backend.client().refresher().session();
        assert_eq!(session.refresh_token().as_deref(), Some("secret-2"));
    }

    #[tokio::test]
    async fn finalize_surfaces_server_error() {
        let (url, _requests) =
            scripted_server(vec![("500 Internal Server Error", "boom".into())]).await;
        let backend = backend(&url);

        let req = FinalizeUploadRequest {
            md5: "m".into(),
            sha256: "s".into(),
            size: 1,
            name: "a".into(),
            dest_folder: "/".into(),
            storage_id: "s1".into(),
            key: "k".into(),
        };
        let err = backend.finalize_upload(&req).await.unwrap_err();
        match &err {
            ApiError::Api { status, body } => {
                assert_eq!(*status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn begin_download_encodes_file_id() {
        let (url, mut requests) = scripted_server(vec![(
            "200 OK",
            r#"{"isFolder":false,"totalSize":3,"entries":[{"url":"http://h/x","path":"x.txt","name":"x.txt","size":3}]}"#
                .into(),
        )])
        .await;
        let backend = backend(&url);

        let manifest = backend.begin_download("dir/x y").await.unwrap();
        assert_eq!(manifest.entries.len(), 1);

        let raw = requests.recv().await.unwrap();
        assert!(raw.starts_with("GET /api/v1/files/dir%2Fx%20y/download"));
    }
}
