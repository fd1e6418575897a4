//! Common test utilities for integration tests
//!
//! This module provides an in-process [`Connector`] whose server end is
//! handed to the test, a scriptable identity issuer, and an event recorder.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bridge_client::{
    BridgeConfig, BridgeError, BridgeEvent, BridgeResult, CHANNEL_BUFFER, Channel,
    ConnectionManager, ConnectionStatus, Connector, CredentialStore, Identity, IdentityIssuer,
    MemoryIdentityStorage, OutboundWire, ServerEndpoint, ToolRegistry, WireEvent,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use url::Url;

/// Upper bound on any single wait in a test
pub const WAIT: Duration = Duration::from_secs(120);

/// What the next `open` does
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    Accept,
    Fail(BridgeError),
    Hang,
    /// Accept once the gate is notified
    Gated(Arc<Notify>),
    /// Accept with a writer that is already closed
    AcceptClosed,
}

/// Server end of a channel opened through [`MockConnector`]
#[derive(Debug)]
pub struct ServerEnd {
    pub url: Url,
    outbound: mpsc::UnboundedReceiver<OutboundWire>,
    inbound: mpsc::Sender<WireEvent>,
}

impl ServerEnd {
    /// Next frame the client wrote
    pub async fn recv(&mut self) -> OutboundWire {
        tokio::time::timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("client channel closed")
    }

    /// Next text frame the client wrote, parsed
    pub async fn recv_json(&mut self) -> Value {
        match self.recv().await {
            OutboundWire::Text(text) => serde_json::from_str(&text).expect("client sent invalid JSON"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Whether the client wrote anything not yet consumed
    pub fn try_recv(&mut self) -> Option<OutboundWire> {
        self.outbound.try_recv().ok()
    }

    /// Deliver a JSON frame to the client
    pub async fn send_json(&self, value: Value) {
        self.send_text(value.to_string()).await;
    }

    /// Deliver a raw text frame to the client
    pub async fn send_text(&self, text: impl Into<String>) {
        self.inbound
            .send(WireEvent::Text(text.into()))
            .await
            .expect("client stopped reading");
    }

    /// Close the channel from the server side
    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .inbound
            .send(WireEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await;
    }
}

/// In-process [`Connector`]
#[derive(Debug)]
pub struct MockConnector {
    script: Mutex<VecDeque<OpenBehavior>>,
    default: Mutex<OpenBehavior>,
    attempts: Mutex<Vec<(Instant, Url)>>,
    preloaded: Mutex<Vec<String>>,
    accepted_tx: mpsc::UnboundedSender<ServerEnd>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(OpenBehavior::Accept),
            attempts: Mutex::new(Vec::new()),
            preloaded: Mutex::new(Vec::new()),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
        }
    }
}

impl MockConnector {
    /// Script the behaviour of the next `open`
    pub fn push(&self, behavior: OpenBehavior) {
        self.script.lock().push_back(behavior);
    }

    /// Behaviour once the script is exhausted
    pub fn set_default(&self, behavior: OpenBehavior) {
        *self.default.lock() = behavior;
    }

    /// Queue a frame on the next accepted channel before it is handed out
    pub fn preload(&self, text: impl Into<String>) {
        self.preloaded.lock().push(text.into());
    }

    /// Wait until `open` has been called `count` times
    pub async fn wait_for_attempts(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.attempts() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timed out waiting for a connection attempt");
    }

    /// Number of `open` calls so far
    pub fn attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Instants of every `open` call
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().iter().map(|(at, _)| *at).collect()
    }

    /// URLs of every `open` call
    pub fn urls(&self) -> Vec<Url> {
        self.attempts.lock().iter().map(|(_, url)| url.clone()).collect()
    }

    /// Server end of the next accepted channel
    pub async fn accept(&self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.accepted_rx.lock().await.recv())
            .await
            .expect("timed out waiting for a channel")
            .expect("connector dropped")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, url: &Url) -> BridgeResult<Channel> {
        self.attempts.lock().push((Instant::now(), url.clone()));
        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().clone());

        match behavior {
            OpenBehavior::Accept => {}
            OpenBehavior::Fail(err) => return Err(err),
            OpenBehavior::Hang => std::future::pending::<()>().await,
            OpenBehavior::Gated(gate) => gate.notified().await,
            OpenBehavior::AcceptClosed => {
                let (outgoing, _) = mpsc::channel(CHANNEL_BUFFER);
                let (_client_in_tx, incoming) = mpsc::channel(CHANNEL_BUFFER);
                return Ok(Channel { outgoing, incoming });
            }
        }

        let (client_out_tx, mut client_out_rx) = mpsc::channel::<OutboundWire>(CHANNEL_BUFFER);
        let (client_in_tx, client_in_rx) = mpsc::channel(CHANNEL_BUFFER);
        for text in self.preloaded.lock().drain(..) {
            client_in_tx
                .try_send(WireEvent::Text(text))
                .expect("preloaded frames fit the channel buffer");
        }
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        // Answers a client close frame the way a real server would.
        let echo = client_in_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = client_out_rx.recv().await {
                if let OutboundWire::Close { code, reason } = &frame {
                    let _ = echo
                        .send(WireEvent::Closed {
                            code: *code,
                            reason: reason.clone(),
                        })
                        .await;
                    let _ = seen_tx.send(frame);
                    return;
                }
                let _ = seen_tx.send(frame);
            }
        });

        let _ = self.accepted_tx.send(ServerEnd {
            url: url.clone(),
            outbound: seen_rx,
            inbound: client_in_tx,
        });
        Ok(Channel {
            outgoing: client_out_tx,
            incoming: client_in_rx,
        })
    }
}

/// Issuer handing out scripted identities
#[derive(Debug, Default)]
pub struct ScriptedIssuer {
    script: Mutex<VecDeque<BridgeResult<Identity>>>,
    calls: AtomicUsize,
}

impl ScriptedIssuer {
    pub fn push(&self, outcome: BridgeResult<Identity>) {
        self.script.lock().push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityIssuer for ScriptedIssuer {
    async fn issue(&self, _app_id: &str) -> BridgeResult<Identity> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Identity::with_user_key(format!("user-{n}"), format!("key-{n}"))))
    }
}

/// Records every event and lets a test wait for specific ones
#[derive(Debug)]
pub struct EventLog {
    seen: Arc<Mutex<Vec<BridgeEvent>>>,
    rx: mpsc::UnboundedReceiver<BridgeEvent>,
}

impl EventLog {
    pub fn attach(manager: &ConnectionManager) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = seen.clone();
        manager.events().subscribe(move |event| {
            sink.lock().push(event.clone());
            let _ = tx.send(event.clone());
        });
        Self { seen, rx }
    }

    /// Every event so far
    pub fn all(&self) -> Vec<BridgeEvent> {
        self.seen.lock().clone()
    }

    /// Status values reported so far
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                BridgeEvent::Status { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Wait for the next event matching `predicate`
    pub async fn wait_for<F>(&mut self, predicate: F) -> BridgeEvent
    where
        F: Fn(&BridgeEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.rx.recv().await.expect("event bus dropped");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Wait for a status event reporting `status`
    pub async fn wait_for_status(&mut self, status: ConnectionStatus) -> Option<String> {
        match self
            .wait_for(|event| matches!(event, BridgeEvent::Status { status: s, .. } if *s == status))
            .await
        {
            BridgeEvent::Status { error, .. } => error,
            _ => unreachable!(),
        }
    }
}

/// A manager wired to in-process collaborators
pub struct Harness {
    pub manager: ConnectionManager,
    pub connector: Arc<MockConnector>,
    pub storage: Arc<MemoryIdentityStorage>,
    pub issuer: Arc<ScriptedIssuer>,
    pub events: EventLog,
}

pub const APP_ID: &str = "app";

pub fn config() -> BridgeConfig {
    BridgeConfig::new(APP_ID, ServerEndpoint::new("bridge.test"))
}

/// Storage already holding `identity`
pub fn storage_with(identity: &Identity) -> Arc<MemoryIdentityStorage> {
    Arc::new(MemoryIdentityStorage::with_entry(
        format!("bridge-identity.{APP_ID}"),
        serde_json::to_string(identity).expect("identity serializes"),
    ))
}

pub fn harness(
    config: BridgeConfig,
    storage: Arc<MemoryIdentityStorage>,
    registry: ToolRegistry,
) -> Harness {
    let connector = Arc::new(MockConnector::default());
    let issuer = Arc::new(ScriptedIssuer::default());
    let credentials = CredentialStore::new(APP_ID, storage.clone(), issuer.clone());
    let manager =
        ConnectionManager::with_connector(config, credentials, registry, connector.clone())
            .expect("valid configuration");
    let events = EventLog::attach(&manager);

    Harness {
        manager,
        connector,
        storage,
        issuer,
        events,
    }
}

/// Harness with a persisted user-key identity `u0` / `s0`
pub fn connected_harness(registry: ToolRegistry) -> Harness {
    harness(
        config(),
        storage_with(&Identity::with_user_key("u0", "s0")),
        registry,
    )
}
