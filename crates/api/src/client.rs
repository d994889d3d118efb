//! Authorized HTTP client.
//!
//! Async HTTP client using `reqwest` with Bearer token authentication and
//! transparent credential renewal.

use std::sync::Arc;
use std::time::Duration;

use driftbox_session::{Recovery, TokenRefresher};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::ApiError;

/// HTTP client that authorizes every request with the session's bearer token.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    refresher: Arc<TokenRefresher>,
}

impl ApiClient {
    /// Creates a client for `base_url`.
    ///
    /// `timeout` bounds connection setup and each read; long downloads are not
    /// cut off as a whole.
    pub fn new(
        base_url: &str,
        refresher: Arc<TokenRefresher>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            refresher,
        })
    }

    /// Absolute URL for an API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn refresher(&self) -> &Arc<TokenRefresher> {
        &self.refresher
    }

    /// Sends an authorized request built by `build`.
    ///
    /// `build` may run twice: once with the current token and, after a 401,
    /// once more with the renewed one. Any status other than 401 is returned
    /// to the caller unchanged.
    pub async fn send<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let token = self
            .refresher
            .ensure_fresh()
            .await
            .ok_or(ApiError::NotAuthenticated)?;

        let resp = build(&self.http).bearer_auth(&token).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        debug!(url = %resp.url(), "request unauthorized, recovering credential");
        match self.refresher.recover(&token).await {
            Recovery::Retry(fresh) => {
                let resp = build(&self.http).bearer_auth(&fresh).send().await?;
                if resp.status() == StatusCode::UNAUTHORIZED {
                    return Err(ApiError::Unauthorized);
                }
                Ok(resp)
            }
            Recovery::Declined => Err(ApiError::SessionExpired),
        }
    }

    /// Sends an authorized request and decodes a JSON body from a 2xx reply.
    pub async fn send_json<T, F>(&self, build: F) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let resp = expect_success(self.send(build).await?).await?;
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Turns a non-2xx response into [`ApiError::Api`].
pub async fn expect_success(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::Api {
        status: status.as_u16(),
        body,
    })
}
