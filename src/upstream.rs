//! Client for the remote agent backend
//!
//! One POST per chat message, answered with an SSE byte stream. The configured timeout is a hard
//! wall-clock ceiling that covers both the response headers and every subsequent body read: once it
//! elapses the stream yields [`UpstreamError::Timeout`] and ends, dropping (and so aborting) the
//! underlying connection. There are no retries.
use axum::body::{Body, Bytes, HttpBody};
use axum::http::{Method, Request, header};
use bon::Builder;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};
use url::Url;

use crate::client::HttpClient;

/// The two backend payload shapes we know how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BackendMode {
    /// Incremental `{node, content}` updates. Tool calls can take minutes.
    #[default]
    NodeTagged,
    /// Each frame carries the whole reply so far.
    WholeContent,
}

impl BackendMode {
    pub fn default_path(self) -> &'static str {
        match self {
            BackendMode::NodeTagged => "/chat/stream",
            BackendMode::WholeContent => "/chat",
        }
    }

    pub fn default_timeout(self) -> Duration {
        match self {
            BackendMode::NodeTagged => Duration::from_secs(300),
            BackendMode::WholeContent => Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("backend responded with status {0}")]
    Status(u16),
    #[error("backend responded without a body")]
    EmptyBody,
    #[error("error reading backend stream: {0}")]
    Body(String),
    #[error("could not build backend request: {0}")]
    InvalidRequest(String),
}

/// Where and how to reach the backend. Read once at startup.
#[derive(Debug, Clone, Builder)]
pub struct UpstreamConfig {
    pub base_url: Url,
    #[builder(default)]
    pub mode: BackendMode,
    /// Overrides [`BackendMode::default_path`].
    pub path: Option<String>,
    /// Overrides [`BackendMode::default_timeout`].
    pub timeout: Option<Duration>,
}

impl UpstreamConfig {
    pub fn endpoint(&self) -> Result<Url, UpstreamError> {
        let path = self
            .path
            .as_deref()
            .unwrap_or_else(|| self.mode.default_path());
        // `Url::join` replaces the last segment of a base without a trailing slash.
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(path.strip_prefix('/').unwrap_or(path))
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| self.mode.default_timeout())
    }
}

#[derive(Debug, Serialize)]
struct BackendRequest<'a> {
    message: &'a str,
    thread_id: &'a str,
}

pub type UpstreamStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

#[derive(Debug, Clone)]
pub struct UpstreamClient<T: HttpClient> {
    http_client: T,
    config: UpstreamConfig,
}

impl<T: HttpClient + Clone + Send + Sync + 'static> UpstreamClient<T> {
    pub fn new(http_client: T, config: UpstreamConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    /// Send one message to the backend and return its body as a deadline-bounded byte stream.
    pub async fn open(&self, message: &str, thread_id: &str) -> Result<UpstreamStream, UpstreamError> {
        let limit = self.config.timeout();
        let deadline = Instant::now() + limit;
        let endpoint = self.config.endpoint()?;

        let body = serde_json::to_vec(&BackendRequest { message, thread_id })
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;
        let req = Request::builder()
            .method(Method::POST)
            .uri(endpoint.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::from(body))
            .map_err(|e| UpstreamError::InvalidRequest(e.to_string()))?;

        debug!(url = %endpoint, timeout_secs = limit.as_secs(), "Opening backend stream");

        let response = match tokio::time::timeout_at(deadline, self.http_client.request(req)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(url = %endpoint, error = %e, "Backend request failed");
                return Err(UpstreamError::Connect(e.to_string()));
            }
            Err(_) => {
                error!(url = %endpoint, "Backend request timed out waiting for headers");
                return Err(UpstreamError::Timeout(limit));
            }
        };

        let status = response.status();
        if !status.is_success() {
            error!(url = %endpoint, status = status.as_u16(), "Backend returned error status");
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let body = response.into_body();
        if body.is_end_stream() {
            error!(url = %endpoint, "Backend returned an empty body");
            return Err(UpstreamError::EmptyBody);
        }

        Ok(Box::pin(bounded_by(body.into_data_stream(), deadline, limit)))
    }
}

/// Yield chunks from `data` until it ends, errors, or `deadline` passes. The inner stream is
/// dropped as soon as this stream finishes.
fn bounded_by<S, E>(
    data: S,
    deadline: Instant,
    limit: Duration,
) -> impl Stream<Item = Result<Bytes, UpstreamError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut data = Box::pin(data);
        loop {
            match tokio::time::timeout_at(deadline, data.next()).await {
                Ok(Some(Ok(bytes))) => yield Ok(bytes),
                Ok(Some(Err(e))) => {
                    yield Err(UpstreamError::Body(e.to_string()));
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    yield Err(UpstreamError::Timeout(limit));
                    break;
                }
            }
        }
    }
}
