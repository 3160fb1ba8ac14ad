//! Chatstream - a chat front end for remote agent backends
//!
//! This library relays a user's message to an agent backend and re-encodes the backend's SSE
//! stream as a UI message stream for the chat widget, while saving the finished reply.
//!
//! The pipeline for one request is
//! [`upstream`] → [`sse`] → [`transcoder`] → [`multiplexer`], run by a single task.

use axum::Router;
use axum::routing::{delete, get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod auth;
pub mod client;
pub mod errors;
pub mod handlers;
pub mod message;
pub mod multiplexer;
pub mod protocol;
pub mod sse;
pub mod traits;
pub mod transcoder;
pub mod upstream;

use auth::Sessions;
use client::{HttpClient, HyperClient, PoolConfig};
use handlers::{chat_handler, delete_chat_handler, health};
use traits::{ChatStore, FirstLineTitleGenerator, InMemoryChatStore, TitleGenerator};
use upstream::{UpstreamClient, UpstreamConfig};

/// Default per-user message limit over 24 hours.
pub const DEFAULT_MAX_MESSAGES_PER_DAY: usize = 100;

/// The main application state shared by all requests. Nothing in it changes after startup.
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    /// `None` when no backend URL is configured.
    pub upstream: Option<UpstreamClient<T>>,
    pub store: Arc<dyn ChatStore>,
    pub titles: Arc<dyn TitleGenerator>,
    pub sessions: Arc<Sessions>,
    pub max_messages_per_day: usize,
}

impl AppState<HyperClient> {
    /// Create a new AppState with the default Hyper client
    pub fn new(upstream: Option<UpstreamConfig>, pool: PoolConfig) -> Self {
        Self::with_client(upstream, client::create_hyper_client(pool))
    }
}

impl<T: HttpClient + Clone + Send + Sync + 'static> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(upstream: Option<UpstreamConfig>, http_client: T) -> Self {
        Self {
            upstream: upstream.map(|config| UpstreamClient::new(http_client, config)),
            store: Arc::new(InMemoryChatStore::new()),
            titles: Arc::new(FirstLineTitleGenerator::default()),
            sessions: Arc::new(Sessions::default()),
            max_messages_per_day: DEFAULT_MAX_MESSAGES_PER_DAY,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_title_generator(mut self, titles: Arc<dyn TitleGenerator>) -> Self {
        self.titles = titles;
        self
    }

    pub fn with_sessions(mut self, sessions: Sessions) -> Self {
        self.sessions = Arc::new(sessions);
        self
    }

    pub fn with_max_messages_per_day(mut self, limit: usize) -> Self {
        self.max_messages_per_day = limit;
        self
    }
}

/// Build the main router
/// This creates routes for:
/// - `POST /api/chat` - Streams the agent's reply to one message
/// - `DELETE /api/chat/{id}` - Deletes a chat
/// - `GET /health` - Liveness probe
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/api/chat", post(chat_handler::<T>))
        .route("/api/chat/{id}", delete(delete_chat_handler::<T>))
        .route("/health", get(health))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// # Parameters
/// - `prefix`: A string prefix for the metrics, which can be either a string literal or an owned string.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::MatchedPath)
        .with_default_metrics()
        .build_pair()
}
