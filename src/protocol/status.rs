//! Result codes written into every reply.

use serde::{Deserialize, Serialize};

/// Outcome of a command, as seen by the caller.
///
/// The code is deliberately coarse; the log carries the detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeStatus {
    /// The command completed.
    #[default]
    Ok,
    /// Missing or malformed fields, bad method string, unknown connection id.
    ErrorOnSyntax,
    /// The HTTP connection (or a channel it needs) could not be established.
    ErrorOnConnect,
    /// HTTP status >= 400, or the input channel produced nothing in time.
    ErrorOnResponse,
    /// Streaming bytes failed after the response was otherwise obtained.
    ErrorOnIo,
}

impl BridgeStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, BridgeStatus::Ok)
    }

    /// Label used for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Ok => "OK",
            BridgeStatus::ErrorOnSyntax => "ERROR_ON_SYNTAX",
            BridgeStatus::ErrorOnConnect => "ERROR_ON_CONNECT",
            BridgeStatus::ErrorOnResponse => "ERROR_ON_RESPONSE",
            BridgeStatus::ErrorOnIo => "ERROR_ON_IO",
        }
    }
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
