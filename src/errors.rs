//! Error taxonomy for the chat endpoint
//!
//! Errors raised before the SSE response is committed are rendered as a JSON body with a stable
//! `code`. Once streaming has started, the multiplexer downgrades errors to an in-band `error`
//! event instead (see [`crate::multiplexer`]).
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::traits::StoreError;
use crate::upstream::UpstreamError;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("You do not have access to this chat")]
    Forbidden,

    #[error("Chat not found")]
    NotFound,

    #[error("Message limit of {limit} per day exceeded")]
    RateLimited { limit: usize },

    #[error("Server misconfigured: {0}")]
    Configuration(String),

    #[error("Agent backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Agent backend returned {}", describe_status(.status))]
    BackendError { status: Option<u16> },

    #[error("Failed to process the agent stream: {0}")]
    StreamProcessing(String),

    #[error("Internal error (correlation id {correlation_id})")]
    Unhandled {
        correlation_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ChatError {
    /// Wrap an unexpected failure, logging it under a fresh correlation id.
    pub fn unhandled(source: impl Into<anyhow::Error>) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let source = source.into();
        error!(correlation_id = %correlation_id, error = %source, "Unhandled error");
        ChatError::Unhandled {
            correlation_id,
            source,
        }
    }

    /// The stable, client-visible error code.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::BadRequest(_) => "bad_request",
            ChatError::Unauthorized => "unauthorized",
            ChatError::Forbidden => "forbidden",
            ChatError::NotFound => "not_found",
            ChatError::RateLimited { .. } => "rate_limited",
            ChatError::Configuration(_) => "configuration_error",
            ChatError::BackendUnavailable(_) => "backend_unavailable",
            ChatError::BackendError { .. } => "backend_error",
            ChatError::StreamProcessing(_) => "stream_processing_error",
            ChatError::Unhandled { .. } => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden => StatusCode::FORBIDDEN,
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::BackendUnavailable(_) | ChatError::BackendError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ChatError::Configuration(_)
            | ChatError::StreamProcessing(_)
            | ChatError::Unhandled { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn describe_status(status: &Option<u16>) -> String {
    match status {
        Some(status) => format!("status {status}"),
        None => "an empty body".to_string(),
    }
}

impl From<UpstreamError> for ChatError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Timeout(limit) => {
                ChatError::BackendUnavailable(format!("timed out after {}s", limit.as_secs()))
            }
            UpstreamError::Connect(msg) => ChatError::BackendUnavailable(msg),
            UpstreamError::Status(status) => ChatError::BackendError {
                status: Some(status),
            },
            UpstreamError::EmptyBody => ChatError::BackendError { status: None },
            UpstreamError::Body(msg) => ChatError::StreamProcessing(msg),
            UpstreamError::InvalidRequest(msg) => ChatError::Configuration(msg),
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        ChatError::unhandled(err)
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}
