//! HTTP client for a running daemon.
//!
//! Used by the `status`, `sessions` and `jobs` subcommands. Talks to the
//! same routes as any remote caller, with the same bearer key.

use std::time::Duration;

use protocol::messages::{HealthResponse, JobListResponse, SessionListResponse, StopResponse};
use protocol::ErrorBody;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default timeout for client requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Errors from talking to the daemon.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Connection failure, timeout or undecodable body.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The daemon answered with an error body.
    #[error("daemon returned {status}: {} ({})", .body.error, .body.code)]
    Api { status: StatusCode, body: ErrorBody },

    /// The daemon answered with a non-JSON error.
    #[error("daemon returned {status}: {text}")]
    Unexpected { status: StatusCode, text: String },
}

impl ClientError {
    /// Returns whether the daemon could not be reached at all.
    pub fn is_connect(&self) -> bool {
        matches!(self, ClientError::Http(e) if e.is_connect())
    }
}

/// Client for the daemon's HTTP API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    /// Creates a client for `base_url` (e.g. `http://127.0.0.1:3000`).
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Creates a client with a custom request timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.bearer_auth(&self.api_key).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await?;
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(ClientError::Api { status, body }),
            Err(_) => Err(ClientError::Unexpected { status, text }),
        }
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.send(self.http.get(self.url("/health"))).await
    }

    /// `GET /sessions`
    pub async fn list_sessions(&self) -> Result<SessionListResponse, ClientError> {
        self.send(self.http.get(self.url("/sessions"))).await
    }

    /// `POST /session/:id/stop`
    pub async fn stop_session(&self, id: &str) -> Result<StopResponse, ClientError> {
        self.send(self.http.post(self.url(&format!("/session/{}/stop", id))))
            .await
    }

    /// `GET /jobs`
    pub async fn list_jobs(&self) -> Result<JobListResponse, ClientError> {
        self.send(self.http.get(self.url("/jobs"))).await
    }

    /// `POST /job/:id/stop`
    pub async fn stop_job(&self, id: &str) -> Result<StopResponse, ClientError> {
        self.send(self.http.post(self.url(&format!("/job/{}/stop", id))))
            .await
    }
}
