//! Command message schema.
//!
//! Every command carries a [`CommandHeader`] (return channel, connection id,
//! status). The engine mutates the received message and publishes it back, so
//! request and reply share one type.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::status::BridgeStatus;

/// Default seconds a data command waits for its input channel.
pub const DEFAULT_INPUT_TIMEOUT_SECS: u64 = 30;

/// Correlation key for one bridged connection.
///
/// Zero means "not assigned yet"; the registry never hands it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// The unassigned identifier carried by a Setup before it completes.
    pub const NONE: ConnectionId = ConnectionId(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a command was rejected before any I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing return command channel URI")]
    MissingReturnChannel,

    #[error("missing connection URL")]
    MissingConnectionUrl,

    #[error("connection id {0} not found")]
    UnknownConnection(ConnectionId),

    #[error("data command missing httpRequest")]
    MissingHttpRequest,

    #[error("{0} command is not accepted on this channel")]
    WrongChannel(&'static str),
}

/// Fields shared by every command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandHeader {
    /// Where the outcome is published.
    #[serde(rename = "cmdReturnChannelURI", default, skip_serializing_if = "Option::is_none")]
    pub cmd_return_channel_uri: Option<Url>,

    /// Assigned by a successful Setup, required by everything after it.
    #[serde(default)]
    pub connection_id: ConnectionId,

    /// Written by the engine.
    #[serde(default)]
    pub status: BridgeStatus,
}

/// Establish a logical connection to `connection_url`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupCommand {
    #[serde(flatten)]
    pub header: CommandHeader,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_url: Option<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,

    /// Filled in on success: publish [`DataCommand`]s here.
    #[serde(rename = "dataCmdChannelURI", default, skip_serializing_if = "Option::is_none")]
    pub data_cmd_channel_uri: Option<Url>,

    /// Filled in on success: data command replies arrive here.
    #[serde(rename = "dataCmdReturnChannelURI", default, skip_serializing_if = "Option::is_none")]
    pub data_cmd_return_channel_uri: Option<Url>,
}

impl SetupCommand {
    pub fn new(return_channel: Url, connection_url: Url) -> Self {
        Self {
            header: CommandHeader {
                cmd_return_channel_uri: Some(return_channel),
                ..CommandHeader::default()
            },
            connection_url: Some(connection_url),
            ..Self::default()
        }
    }

    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy_host = Some(host.into());
        self.proxy_port = Some(port);
        self
    }

    /// Proxy host, ignoring blank values.
    pub fn proxy(&self) -> Option<(&str, Option<u16>)> {
        self.proxy_host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(|host| (host, self.proxy_port))
    }

    /// Both the return channel and the target URL must be present.
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        self.header.status = BridgeStatus::ErrorOnSyntax;
        if self.header.cmd_return_channel_uri.is_none() {
            return Err(ValidationError::MissingReturnChannel);
        }
        if self.connection_url.is_none() {
            return Err(ValidationError::MissingConnectionUrl);
        }
        self.header.status = BridgeStatus::Ok;
        Ok(())
    }
}

/// One HTTP request/response cycle within an established connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCommand {
    #[serde(flatten)]
    pub header: CommandHeader,

    /// HTTP method, sent verbatim. The only required field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_request: Option<String>,

    /// Appended to the Setup URL for this request only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub use_cache: bool,

    /// Request body source, read once as "latest value".
    #[serde(rename = "inputHttpChannelURI", default, skip_serializing_if = "Option::is_none")]
    pub input_http_channel_uri: Option<Url>,

    #[serde(default = "default_input_timeout")]
    pub input_timeout_seconds: u64,

    /// Response body sink, published once with the whole body.
    #[serde(rename = "outputHttpChannelURI", default, skip_serializing_if = "Option::is_none")]
    pub output_http_channel_uri: Option<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, Vec<String>>>,
}

fn default_input_timeout() -> u64 {
    DEFAULT_INPUT_TIMEOUT_SECS
}

impl Default for DataCommand {
    fn default() -> Self {
        Self {
            header: CommandHeader::default(),
            http_request: None,
            url_path: None,
            request_headers: None,
            use_cache: false,
            input_http_channel_uri: None,
            input_timeout_seconds: DEFAULT_INPUT_TIMEOUT_SECS,
            output_http_channel_uri: None,
            response_code: None,
            response_message: None,
            response_headers: None,
        }
    }
}

impl DataCommand {
    pub fn new(connection_id: ConnectionId, method: impl Into<String>) -> Self {
        Self {
            header: CommandHeader {
                connection_id,
                ..CommandHeader::default()
            },
            http_request: Some(method.into()),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.url_path = Some(path.into());
        self
    }

    pub fn with_input(mut self, channel: Url, timeout_secs: u64) -> Self {
        self.input_http_channel_uri = Some(channel);
        self.input_timeout_seconds = timeout_secs;
        self
    }

    pub fn with_output(mut self, channel: Url) -> Self {
        self.output_http_channel_uri = Some(channel);
        self
    }

    pub fn validate(&mut self) -> Result<(), ValidationError> {
        if self.http_request.is_none() {
            self.header.status = BridgeStatus::ErrorOnSyntax;
            return Err(ValidationError::MissingHttpRequest);
        }
        self.header.status = BridgeStatus::Ok;
        Ok(())
    }
}

/// Release a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeardownCommand {
    #[serde(flatten)]
    pub header: CommandHeader,
}

impl TeardownCommand {
    pub fn new(connection_id: ConnectionId, return_channel: Url) -> Self {
        Self {
            header: CommandHeader {
                cmd_return_channel_uri: Some(return_channel),
                connection_id,
                status: BridgeStatus::Ok,
            },
        }
    }
}

/// The closed set of commands understood by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum CommandMessage {
    Setup(SetupCommand),
    Data(DataCommand),
    Teardown(TeardownCommand),
}

impl CommandMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Command name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandMessage::Setup(_) => "setup",
            CommandMessage::Data(_) => "data",
            CommandMessage::Teardown(_) => "teardown",
        }
    }

    pub fn header(&self) -> &CommandHeader {
        match self {
            CommandMessage::Setup(cmd) => &cmd.header,
            CommandMessage::Data(cmd) => &cmd.header,
            CommandMessage::Teardown(cmd) => &cmd.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut CommandHeader {
        match self {
            CommandMessage::Setup(cmd) => &mut cmd.header,
            CommandMessage::Data(cmd) => &mut cmd.header,
            CommandMessage::Teardown(cmd) => &mut cmd.header,
        }
    }

    pub fn status(&self) -> BridgeStatus {
        self.header().status
    }

    pub fn set_status(&mut self, status: BridgeStatus) {
        self.header_mut().status = status;
    }
}

impl From<SetupCommand> for CommandMessage {
    fn from(cmd: SetupCommand) -> Self {
        CommandMessage::Setup(cmd)
    }
}

impl From<DataCommand> for CommandMessage {
    fn from(cmd: DataCommand) -> Self {
        CommandMessage::Data(cmd)
    }
}

impl From<TeardownCommand> for CommandMessage {
    fn from(cmd: TeardownCommand) -> Self {
        CommandMessage::Teardown(cmd)
    }
}

/// Build a syntax-error reply for a payload that failed to decode.
///
/// Only possible when the payload is a JSON object naming a usable return
/// channel; the raw object is echoed back with its status overwritten.
pub fn syntax_error_reply(payload: &[u8]) -> Option<(Url, Bytes)> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    let return_uri = value
        .get("cmdReturnChannelURI")
        .and_then(|v| v.as_str())
        .and_then(|s| Url::parse(s).ok())?;
    Some((return_uri, mark_syntax_error(value)?))
}

/// Echo a JSON object payload back with `status` set to `ERROR_ON_SYNTAX`.
pub fn syntax_error_payload(payload: &[u8]) -> Option<Bytes> {
    mark_syntax_error(serde_json::from_slice(payload).ok()?)
}

fn mark_syntax_error(mut value: serde_json::Value) -> Option<Bytes> {
    value.as_object_mut()?.insert(
        "status".to_string(),
        serde_json::Value::String(BridgeStatus::ErrorOnSyntax.as_str().to_string()),
    );
    serde_json::to_vec(&value).ok().map(Bytes::from)
}
