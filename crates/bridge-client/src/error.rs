//! Bridge client error types.

use std::time::Duration;
use thiserror::Error;

use crate::protocol::error_codes;

/// A specialized `Result` type for bridge client operations.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Represents errors that can occur while operating the bridge client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BridgeError {
    /// An identity could not be minted or refreshed.
    ///
    /// `status` is the HTTP status of the issuance service when it answered,
    /// and `body` is the response body exactly as received.
    #[error("{}", issuance_message(*status, body))]
    Issuance {
        /// HTTP status returned by the issuance service, if any
        status: Option<u16>,
        /// Response body or transport failure description
        body: String,
    },

    /// The channel failed to open.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The channel did not open within the configured timeout.
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The server rejected the identity presented on the channel.
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// A frame was sent while no channel was open.
    #[error("Not connected")]
    NotConnected,

    /// A received frame could not be parsed.
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// A tool handler failed.
    #[error("Tool handler failed: {0}")]
    Handler(String),

    /// An invocation referenced an unregistered or handler-less tool.
    #[error("Tool not found: {0}")]
    MethodNotFound(String),

    /// Durable identity storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The client was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

fn issuance_message(status: Option<u16>, body: &str) -> String {
    match status {
        Some(status) => format!("Identity issuance failed with status {status}: {body}"),
        None => format!("Identity issuance failed: {body}"),
    }
}

impl BridgeError {
    /// Create an issuance error for a service that answered with a non-success status.
    pub fn issuance(status: u16, body: impl Into<String>) -> Self {
        Self::Issuance {
            status: Some(status),
            body: body.into(),
        }
    }

    /// Create an issuance error for a service that could not be reached.
    pub fn issuance_unreachable(reason: impl Into<String>) -> Self {
        Self::Issuance {
            status: None,
            body: reason.into(),
        }
    }

    /// Whether the host application should offer a "reset credentials" action.
    pub fn is_credential_resettable(&self) -> bool {
        matches!(
            self,
            Self::Issuance { .. } | Self::AuthenticationRejected(_)
        )
    }

    /// Whether this error should trigger the reconnection policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::ConnectTimeout(_))
    }

    /// JSON-RPC error code used when this error is reported to a remote peer.
    pub fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::ProtocolDecode(_) => error_codes::PARSE_ERROR,
            _ => error_codes::INTERNAL_ERROR,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolDecode(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Error returned by a tool handler.
///
/// The message is forwarded to the calling peer as the `data` field of a
/// `-32603` JSON-RPC error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ToolError {
    message: String,
}

impl ToolError {
    /// Create a tool error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The diagnostic message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for ToolError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ToolError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid arguments: {err}"))
    }
}

impl From<ToolError> for BridgeError {
    fn from(err: ToolError) -> Self {
        Self::Handler(err.message)
    }
}
