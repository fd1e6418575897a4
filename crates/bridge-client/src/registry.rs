//! Tool registry
//!
//! Holds the set of locally callable tools. A tool is always described by a
//! [`ToolSchema`]; wiring a handler is a separate, optional step so a host
//! can declare schemas up front and attach handlers later.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{BridgeError, BridgeResult, ToolError};

/// Future returned by a tool handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

/// Tool handler: receives the call arguments and resolves to a JSON result
pub type ToolHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(move |args| -> HandlerFuture { Box::pin(f(args)) })
}

/// Wire description of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool name
    pub name: String,
    /// Human readable description
    pub description: String,
    /// JSON Schema of the tool arguments
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolSchema {
    /// Create a tool schema
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A registered tool: either only declared, or declared and callable
#[derive(Clone)]
pub enum ToolDescriptor {
    /// Schema without a handler; calls to it answer "method not found"
    SchemaOnly(ToolSchema),
    /// Schema with a handler
    WithHandler {
        /// Tool schema
        schema: ToolSchema,
        /// Tool handler
        handler: ToolHandler,
    },
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchemaOnly(schema) => f.debug_tuple("SchemaOnly").field(schema).finish(),
            Self::WithHandler { schema, .. } => f
                .debug_struct("WithHandler")
                .field("schema", schema)
                .field("handler", &"<fn>")
                .finish(),
        }
    }
}

impl ToolDescriptor {
    /// The tool schema
    pub fn schema(&self) -> &ToolSchema {
        match self {
            Self::SchemaOnly(schema) | Self::WithHandler { schema, .. } => schema,
        }
    }

    /// The tool name
    pub fn name(&self) -> &str {
        &self.schema().name
    }

    /// The handler, when one is wired
    pub fn handler(&self) -> Option<&ToolHandler> {
        match self {
            Self::SchemaOnly(_) => None,
            Self::WithHandler { handler, .. } => Some(handler),
        }
    }
}

/// Registry of tools, keyed by name, in registration order.
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<Vec<ToolDescriptor>>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tool by name.
    ///
    /// The latest schema always wins. A schema-only registration never drops
    /// a handler that is already wired under the same name.
    pub fn register(&self, descriptor: ToolDescriptor) {
        let mut tools = self.tools.write();
        let position = tools.iter().position(|t| t.name() == descriptor.name());

        let Some(index) = position else {
            debug!(tool = descriptor.name(), "Registered tool");
            tools.push(descriptor);
            return;
        };

        let merged = match (descriptor, &tools[index]) {
            (ToolDescriptor::SchemaOnly(schema), ToolDescriptor::WithHandler { handler, .. }) => {
                ToolDescriptor::WithHandler {
                    schema,
                    handler: handler.clone(),
                }
            }
            (descriptor, _) => descriptor,
        };
        debug!(tool = merged.name(), "Replaced tool registration");
        tools[index] = merged;
    }

    /// Declare a tool without a handler
    pub fn register_schema(&self, schema: ToolSchema) {
        self.register(ToolDescriptor::SchemaOnly(schema));
    }

    /// Register a tool together with its handler
    pub fn register_handler(&self, schema: ToolSchema, handler: ToolHandler) {
        self.register(ToolDescriptor::WithHandler { schema, handler });
    }

    /// Register a tool whose handler is an async closure
    pub fn register_fn<F, Fut>(&self, schema: ToolSchema, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.register_handler(schema, handler_fn(f));
    }

    /// Remove a tool, returning whether it was present
    pub fn unregister(&self, name: &str) -> bool {
        let mut tools = self.tools.write();
        let before = tools.len();
        tools.retain(|t| t.name() != name);
        before != tools.len()
    }

    /// Look up a tool by name
    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.read().iter().find(|t| t.name() == name).cloned()
    }

    /// Resolve the handler for a call.
    ///
    /// Fails with [`BridgeError::MethodNotFound`] when the tool is unknown or
    /// has no handler wired.
    pub fn resolve(&self, name: &str) -> BridgeResult<ToolHandler> {
        self.get(name)
            .and_then(|t| t.handler().cloned())
            .ok_or_else(|| BridgeError::MethodNotFound(name.to_string()))
    }

    /// Schemas of every registered tool, handlers stripped
    pub fn list(&self) -> Vec<ToolSchema> {
        self.tools.read().iter().map(|t| t.schema().clone()).collect()
    }

    /// Names of every registered tool
    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    /// Whether no tools are registered
    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}
