//! Inbound frame routing
//!
//! The [`DispatchRouter`] decodes every text frame received on the channel
//! and classifies it. Tool invocations and pings are answered here; the
//! handler runs on its own task so a slow tool never holds up the frames
//! behind it. Everything else is handed back to the caller as a [`Routed`]
//! value for the connection manager to act on.
//!
//! Each call carries its own [`CallContext`] from receipt to response, so
//! concurrent invocations from different agents are always answered to the
//! agent that asked.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Value, json};
use tracing::{Instrument, debug, debug_span, warn};

use crate::error::BridgeResult;
use crate::protocol::{
    InboundFrame, JsonRpcError, JsonRpcResponse, OutboundFrame, RequestId, ToolCallRequest,
};
use crate::registry::ToolRegistry;

/// Destination for frames produced while handling inbound traffic
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send a frame on the current channel
    async fn send_frame(&self, frame: OutboundFrame) -> BridgeResult<()>;
}

/// State of a single inbound call, owned by the task that answers it
#[derive(Debug, Clone, PartialEq)]
pub struct CallContext {
    /// Call identifier the response is correlated with
    pub id: RequestId,
    /// Agent session the response is routed to
    pub agent_session_id: String,
    /// Invoked tool
    pub tool: String,
}

impl CallContext {
    fn respond(self, result: Result<Value, JsonRpcError>) -> JsonRpcResponse {
        let session = Some(self.agent_session_id);
        match result {
            Ok(value) => JsonRpcResponse::success(self.id, value, session),
            Err(error) => JsonRpcResponse::error(self.id, error, session),
        }
    }
}

/// Outcome of routing one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// An agent attached
    PeerConnected(Option<String>),
    /// An agent detached
    PeerDisconnected(Option<String>),
    /// A frame the core does not interpret
    Message(Value),
    /// A request was accepted and will be answered asynchronously
    Dispatched,
}

/// Routes inbound frames to tool handlers
#[derive(Debug, Clone)]
pub struct DispatchRouter {
    registry: ToolRegistry,
}

impl DispatchRouter {
    /// Create a router resolving tools from `registry`
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    /// The registry calls are resolved against
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Decode and route one text frame.
    ///
    /// Fails only when the payload is not valid JSON. Must be called from
    /// within a tokio runtime.
    pub fn route(&self, text: &str, sink: &Arc<dyn FrameSink>) -> BridgeResult<Routed> {
        let routed = match InboundFrame::decode(text)? {
            InboundFrame::AgentConnected { agent_session_id } => {
                Routed::PeerConnected(agent_session_id)
            }
            InboundFrame::AgentDisconnected { agent_session_id } => {
                Routed::PeerDisconnected(agent_session_id)
            }
            InboundFrame::ToolCall(call) => {
                self.dispatch_call(call, Arc::clone(sink));
                Routed::Dispatched
            }
            InboundFrame::Ping {
                id,
                agent_session_id,
            } => {
                let response = JsonRpcResponse::success(id, json!({}), Some(agent_session_id));
                tokio::spawn(deliver(Arc::clone(sink), response));
                Routed::Dispatched
            }
            InboundFrame::Message(value) => Routed::Message(value),
        };
        Ok(routed)
    }

    fn dispatch_call(&self, call: ToolCallRequest, sink: Arc<dyn FrameSink>) {
        let ToolCallRequest {
            id,
            name,
            arguments,
            agent_session_id,
        } = call;
        let span = debug_span!("tool_call", tool = %name, id = %id, agent = %agent_session_id);
        let resolved = self.registry.resolve(&name);
        let context = CallContext {
            id,
            agent_session_id,
            tool: name,
        };

        let task = async move {
            let result = match resolved {
                Ok(handler) => {
                    debug!("Invoking tool handler");
                    let invocation = AssertUnwindSafe(async move { handler(arguments).await });
                    match invocation.catch_unwind().await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => {
                            warn!(error = %e, "Tool handler failed");
                            Err(JsonRpcError::internal_error(e.message()))
                        }
                        Err(panic) => {
                            let message = panic_message(panic.as_ref());
                            warn!(panic = %message, "Tool handler panicked");
                            Err(JsonRpcError::internal_error(message))
                        }
                    }
                }
                Err(e) => {
                    debug!("No handler for tool");
                    Err(JsonRpcError::from(&e))
                }
            };
            deliver(sink, context.respond(result)).await;
        };
        tokio::spawn(task.instrument(span));
    }
}

async fn deliver(sink: Arc<dyn FrameSink>, response: JsonRpcResponse) {
    let id = response.id.clone();
    if let Err(e) = sink.send_frame(OutboundFrame::Response(response)).await {
        warn!(id = %id, error = %e, "Failed to send response");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "tool handler panicked".to_string()
    }
}
