//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the bridge.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::protocol::ConnectionId;

/// Root configuration for the HTTP bridge.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    /// Channel naming and reply behaviour.
    pub bridge: ChannelConfig,

    /// Worker pool sizing and shutdown.
    pub pool: PoolConfig,

    /// Parameters handed to the HTTP client.
    pub http: HttpConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Channel naming configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Prefix shared by every channel the bridge owns (e.g., "ndn:/intel/node/host").
    pub node_uri: String,

    /// Name of the well-known command channel under `node_uri`.
    pub command_channel: String,

    /// Per-connection data command channel, suffixed with `-{connectionId}`.
    pub data_channel_prefix: String,

    /// Per-connection data command return channel, suffixed with `-{connectionId}`.
    pub data_return_channel_prefix: String,

    /// How long a reply channel stays open after publishing, in milliseconds.
    pub reply_grace_ms: u64,
}

impl ChannelConfig {
    pub fn reply_grace(&self) -> Duration {
        Duration::from_millis(self.reply_grace_ms)
    }

    /// The well-known channel Setup and Teardown commands arrive on.
    pub fn command_uri(&self) -> Result<Url, url::ParseError> {
        self.channel_uri(&self.command_channel)
    }

    /// Where a connection's data commands are published.
    pub fn data_uri(&self, id: ConnectionId) -> Result<Url, url::ParseError> {
        self.channel_uri(&format!("{}-{}", self.data_channel_prefix, id))
    }

    /// Where a connection's data command replies are published.
    pub fn data_return_uri(&self, id: ConnectionId) -> Result<Url, url::ParseError> {
        self.channel_uri(&format!("{}-{}", self.data_return_channel_prefix, id))
    }

    fn channel_uri(&self, name: &str) -> Result<Url, url::ParseError> {
        Url::parse(&format!("{}/{}", self.node_uri.trim_end_matches('/'), name))
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            node_uri: "ndn:/intel/node/local".to_string(),
            command_channel: "HTTPBridge-CMD".to_string(),
            data_channel_prefix: "HTTPBridge-DATACMD".to_string(),
            data_return_channel_prefix: "HttpBridge-DATACMDRETURN".to_string(),
            reply_grace_ms: 1000,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrently running connection workers.
    pub max_workers: usize,

    /// Time given to workers to exit on shutdown before they are aborted.
    pub shutdown_grace_secs: u64,
}

impl PoolConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 15,
            shutdown_grace_secs: 5,
        }
    }
}

/// HTTP client configuration.
///
/// Timeouts are optional; when absent the client's own defaults apply.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HttpConfig {
    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: Option<u64>,

    /// Whole request/response timeout in seconds.
    pub request_timeout_secs: Option<u64>,

    /// Keep idle connections between data commands.
    pub keep_alive: bool,

    /// Honour HTTP_PROXY/HTTPS_PROXY when a connection has no explicit proxy.
    pub use_system_proxy: bool,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter directive, overridden by RUST_LOG.
    pub log_filter: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "http_bridge=info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
