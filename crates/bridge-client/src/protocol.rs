//! # Bridge wire protocol
//!
//! Frames exchanged with the bridge server are JSON text messages. Two
//! families share the channel:
//!
//! - **Bridge frames**, discriminated by a `type` field
//!   (`tools-registration`, `agent-connected`, `agent-disconnected`)
//! - **JSON-RPC 2.0 frames** relayed from a bridged agent, extended with an
//!   `agentSessionId` field so the server can route responses back
//!
//! Anything that fits neither family is surfaced to the host application
//! unchanged.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use crate::error::{BridgeError, BridgeResult};
use crate::registry::ToolSchema;

/// JSON-RPC version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of a tool invocation request
pub const TOOLS_CALL_METHOD: &str = "tools/call";

/// Method name of a liveness probe from a bridged agent
pub const PING_METHOD: &str = "ping";

/// Standard JSON-RPC error codes
pub mod error_codes {
    /// Parse error
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method (tool) not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// JSON-RPC version marker that only (de)serializes as `"2.0"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(JsonRpcVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "Invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// JSON-RPC request identifier (number or string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric identifier
    Number(i64),
    /// String identifier
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create a new JSON-RPC error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a method not found error (-32601)
    pub fn method_not_found(name: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {name}"),
        )
    }

    /// Create an internal error (-32603) carrying the diagnostic as `data`
    pub fn internal_error(details: impl Into<String>) -> Self {
        Self {
            code: error_codes::INTERNAL_ERROR,
            message: "Internal error".to_string(),
            data: Some(Value::String(details.into())),
        }
    }
}

impl From<&BridgeError> for JsonRpcError {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::MethodNotFound(name) => Self::method_not_found(name),
            BridgeError::Handler(message) => Self::internal_error(message.clone()),
            other => Self::new(other.jsonrpc_code(), other.to_string()),
        }
    }
}

/// Response payload - ensures mutual exclusion of result and error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ResponsePayload {
    /// Successful response with result
    Success {
        /// Response result
        result: Value,
    },
    /// Error response
    Error {
        /// Response error
        error: JsonRpcError,
    },
}

/// JSON-RPC response routed back to a bridged agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// JSON-RPC version
    pub jsonrpc: JsonRpcVersion,
    /// Request identifier this response answers
    pub id: RequestId,
    /// Result or error
    #[serde(flatten)]
    pub payload: ResponsePayload,
    /// Agent session the request arrived from
    #[serde(rename = "agentSessionId", skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

impl JsonRpcResponse {
    /// Build a success response
    pub fn success(id: RequestId, result: Value, agent_session_id: Option<String>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            payload: ResponsePayload::Success { result },
            agent_session_id,
        }
    }

    /// Build an error response
    pub fn error(id: RequestId, error: JsonRpcError, agent_session_id: Option<String>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            payload: ResponsePayload::Error { error },
            agent_session_id,
        }
    }

    /// The error object, if this is an error response
    pub fn error_object(&self) -> Option<&JsonRpcError> {
        match &self.payload {
            ResponsePayload::Error { error } => Some(error),
            ResponsePayload::Success { .. } => None,
        }
    }
}

/// Frames sent from this client to the bridge server
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Advertisement of the locally callable tools
    ToolsRegistration {
        /// Tool schemas (never handlers)
        tools: Vec<ToolSchema>,
    },
    /// Response to a relayed JSON-RPC request
    Response(JsonRpcResponse),
    /// Host-defined frame, sent verbatim
    Message(Value),
}

#[derive(Serialize)]
struct RegistrationWire<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    tools: &'a [ToolSchema],
}

impl OutboundFrame {
    /// Encode the frame as wire text
    pub fn encode(&self) -> BridgeResult<String> {
        let text = match self {
            Self::ToolsRegistration { tools } => serde_json::to_string(&RegistrationWire {
                kind: "tools-registration",
                tools,
            }),
            Self::Response(response) => serde_json::to_string(response),
            Self::Message(value) => serde_json::to_string(value),
        };
        text.map_err(|e| BridgeError::ProtocolDecode(format!("failed to encode frame: {e}")))
    }
}

/// Arguments of a `tools/call` request
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Call identifier used to correlate the response
    pub id: RequestId,
    /// Name of the tool to invoke
    pub name: String,
    /// Tool arguments (`null` when omitted)
    pub arguments: Value,
    /// Agent session that issued the call
    pub agent_session_id: String,
}

/// Frames received from the bridge server, classified
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A remote agent attached to this session
    AgentConnected {
        /// Identifier of the agent session
        agent_session_id: Option<String>,
    },
    /// A remote agent detached from this session
    AgentDisconnected {
        /// Identifier of the agent session
        agent_session_id: Option<String>,
    },
    /// A tool invocation request
    ToolCall(ToolCallRequest),
    /// A liveness probe from an agent
    Ping {
        /// Request identifier
        id: RequestId,
        /// Agent session that issued the probe
        agent_session_id: String,
    },
    /// Any other well-formed frame, republished verbatim
    Message(Value),
}

#[derive(Deserialize)]
struct RelayedRequest {
    #[serde(rename = "jsonrpc")]
    _version: JsonRpcVersion,
    method: String,
    id: RequestId,
    #[serde(rename = "agentSessionId")]
    agent_session_id: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl InboundFrame {
    /// Decode and classify a text frame.
    ///
    /// Only a payload that is not valid JSON is a decode error; well-formed
    /// frames of unknown shape classify as [`InboundFrame::Message`].
    pub fn decode(text: &str) -> BridgeResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::ProtocolDecode(format!("malformed frame: {e}")))?;
        Ok(Self::classify(value))
    }

    /// Classify an already parsed frame.
    pub fn classify(value: Value) -> Self {
        let session_of = |value: &Value| {
            value
                .get("agentSessionId")
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        match value.get("type").and_then(Value::as_str) {
            Some("agent-connected") => {
                return Self::AgentConnected {
                    agent_session_id: session_of(&value),
                };
            }
            Some("agent-disconnected") => {
                return Self::AgentDisconnected {
                    agent_session_id: session_of(&value),
                };
            }
            _ => {}
        }

        if value.get("jsonrpc").is_some()
            && let Ok(request) = RelayedRequest::deserialize(&value)
        {
            match request.method.as_str() {
                TOOLS_CALL_METHOD => {
                    if let Some(params) = request.params.as_ref()
                        && let Ok(call) = ToolCallParams::deserialize(params)
                    {
                        return Self::ToolCall(ToolCallRequest {
                            id: request.id,
                            name: call.name,
                            arguments: call.arguments,
                            agent_session_id: request.agent_session_id,
                        });
                    }
                }
                PING_METHOD => {
                    return Self::Ping {
                        id: request.id,
                        agent_session_id: request.agent_session_id,
                    };
                }
                _ => {}
            }
        }

        Self::Message(value)
    }
}
