//! Configuration parsing and validation for the chat server
//!
//! This module handles command-line argument parsing and validation using clap. Every flag can
//! also be supplied through the environment, which is how the backend URL is usually provided.
use anyhow::anyhow;
use chatstream::auth::{Sessions, parse_token_mapping};
use chatstream::client::PoolConfig;
use chatstream::upstream::{BackendMode, UpstreamConfig};
use clap::{ArgAction, Parser};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the chat server will listen.
    #[arg(short = 'p', long, env = "CHATSTREAM_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Base URL of the agent backend. Without it every chat request fails with a
    /// configuration error.
    #[arg(long, env = "AGENT_BACKEND_URL")]
    pub backend_url: Option<Url>,

    /// Payload shape the backend streams.
    #[arg(long, env = "AGENT_BACKEND_MODE", value_enum, default_value_t = BackendMode::NodeTagged)]
    pub backend_mode: BackendMode,

    /// Path of the streaming endpoint, relative to the base URL. Defaults per backend mode.
    #[arg(long, env = "AGENT_BACKEND_PATH")]
    pub backend_path: Option<String>,

    /// Hard limit on one backend request, body included. Defaults per backend mode
    /// (300s for node-tagged, 60s for whole-content).
    #[arg(long, env = "AGENT_BACKEND_TIMEOUT_SECS")]
    pub backend_timeout_secs: Option<u64>,

    /// Maximum number of messages a user may send in 24 hours.
    #[arg(long, env = "CHATSTREAM_MAX_MESSAGES_PER_DAY", default_value_t = 100)]
    pub max_messages_per_day: usize,

    /// Accepted bearer tokens, as TOKEN=USER_ID. Repeat the flag or comma-separate.
    #[arg(
        long = "user-token",
        env = "CHATSTREAM_USER_TOKENS",
        value_delimiter = ',',
        value_parser = parse_token_mapping
    )]
    pub user_tokens: Vec<(String, String)>,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, action = ArgAction::Set, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "chatstream")]
    pub metrics_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive to the backend.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if self.backend_timeout_secs == Some(0) {
            return Err(anyhow!("Backend timeout must be at least one second"));
        }
        if self.metrics && self.metrics_port == self.port {
            return Err(anyhow!(
                "Metrics port {} clashes with the server port",
                self.metrics_port
            ));
        }
        if self.max_messages_per_day == 0 {
            return Err(anyhow!("max-messages-per-day must be positive"));
        }
        Ok(self)
    }

    /// `None` when no backend URL was configured.
    pub fn upstream(&self) -> Option<UpstreamConfig> {
        let base_url = self.backend_url.clone()?;
        Some(
            UpstreamConfig::builder()
                .base_url(base_url)
                .mode(self.backend_mode)
                .maybe_path(self.backend_path.clone())
                .maybe_timeout(self.backend_timeout_secs.map(Duration::from_secs))
                .build(),
        )
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            max_idle_per_host: self.pool_max_idle_per_host,
        }
    }

    pub fn sessions(&self) -> Sessions {
        Sessions::new(self.user_tokens.iter().cloned())
    }
}
