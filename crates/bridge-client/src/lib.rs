//! # Bridge Client
//!
//! Keeps a persistent, authenticated channel open to a bridge server,
//! advertises a set of locally callable tools, and answers the tool calls
//! that bridged agents send over that channel.
//!
//! ## Overview
//!
//! - **Tools**: [`ToolRegistry`], [`ToolSchema`], [`ToolDescriptor`]
//! - **Identity**: [`CredentialStore`], [`Identity`], [`IdentityIssuer`], [`IdentityStorage`]
//! - **Connection**: [`ConnectionManager`], [`ConnectionStatus`], [`Connector`]
//! - **Dispatch**: [`DispatchRouter`], [`CallContext`]
//! - **Events**: [`EventBus`], [`BridgeEvent`]
//! - **Config**: [`BridgeConfig`], [`ReconnectConfig`], [`ServerEndpoint`]
//! - **Errors**: [`BridgeError`], [`BridgeResult`], [`ToolError`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bridge_client::{
//!     BridgeConfig, ConnectionManager, CredentialStore, FileIdentityStorage,
//!     HttpIdentityIssuer, ServerEndpoint, ToolRegistry, ToolSchema,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> bridge_client::BridgeResult<()> {
//! let config = BridgeConfig::new("my-app", ServerEndpoint::from_origin("https://bridge.example.com")?);
//! let credentials = CredentialStore::new(
//!     "my-app",
//!     Arc::new(FileIdentityStorage::new(".bridge")),
//!     Arc::new(HttpIdentityIssuer::new("https://bridge.example.com/api/identity")),
//! );
//!
//! let tools = ToolRegistry::new();
//! tools.register_fn(
//!     ToolSchema::new("echo", "Echo the arguments", json!({ "type": "object" })),
//!     |args| async move { Ok(args) },
//! );
//!
//! let manager = ConnectionManager::new(config, credentials, tools)?;
//! manager.events().subscribe(|event| println!("{event:?}"));
//! manager.connect().await?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

pub mod config;
pub mod connection;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;

pub use config::{BridgeConfig, ReconnectConfig, ServerEndpoint};
pub use connection::{
    CHANNEL_BUFFER, Channel, ConnectionManager, ConnectionStatus, Connector, OutboundWire,
    ReconnectSnapshot, WebSocketConnector, WireEvent,
};
pub use credentials::{
    CredentialStore, FileIdentityStorage, HttpIdentityIssuer, Identity, IdentityIssuer,
    IdentityStorage, MemoryIdentityStorage, Secret,
};
pub use dispatch::{CallContext, DispatchRouter, FrameSink, Routed};
pub use error::{BridgeError, BridgeResult, ToolError};
pub use events::{BridgeEvent, ErrorEvent, EventBus, EventKind, SubscriptionId};
pub use protocol::{JsonRpcError, JsonRpcResponse, OutboundFrame, RequestId};
pub use registry::{ToolDescriptor, ToolHandler, ToolRegistry, ToolSchema, handler_fn};
