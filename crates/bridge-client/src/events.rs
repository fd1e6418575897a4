//! Event surface
//!
//! Lets the host application observe lifecycle transitions and protocol
//! activity without polling. Delivery is synchronous, in registration order,
//! and each listener runs in isolation: a panicking listener is logged and
//! skipped, the remaining listeners still receive the event.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{trace, warn};

use crate::connection::ConnectionStatus;
use crate::credentials::Identity;
use crate::error::BridgeError;

/// Payload of an `error` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Human readable description
    pub message: String,
    /// Whether the host should offer a "reset credentials" action
    pub resettable: bool,
}

impl From<&BridgeError> for ErrorEvent {
    fn from(err: &BridgeError) -> Self {
        Self {
            message: err.to_string(),
            resettable: err.is_credential_resettable(),
        }
    }
}

/// Events published by the bridge client
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The connection status changed
    Status {
        /// New status
        status: ConnectionStatus,
        /// Failure that caused the change, if any
        error: Option<String>,
    },
    /// A fresh identity was issued
    IdentityReady(Identity),
    /// A remote agent attached
    PeerConnected {
        /// Agent session identifier
        agent_session_id: Option<String>,
    },
    /// A remote agent detached
    PeerDisconnected {
        /// Agent session identifier
        agent_session_id: Option<String>,
    },
    /// An inbound frame the core does not interpret
    Message(Value),
    /// A failure the host should know about
    Error(ErrorEvent),
}

impl BridgeEvent {
    /// The kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Status { .. } => EventKind::Status,
            Self::IdentityReady(_) => EventKind::IdentityReady,
            Self::PeerConnected { .. } => EventKind::PeerConnected,
            Self::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            Self::Message(_) => EventKind::Message,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// Discriminant of [`BridgeEvent`], used to filter subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `status`
    Status,
    /// `identity-ready`
    IdentityReady,
    /// `peer-connected`
    PeerConnected,
    /// `peer-disconnected`
    PeerDisconnected,
    /// `message`
    Message,
    /// `error`
    Error,
}

impl EventKind {
    /// Canonical event name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::IdentityReady => "identity-ready",
            Self::PeerConnected => "peer-connected",
            Self::PeerDisconnected => "peer-disconnected",
            Self::Message => "message",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&BridgeEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    filter: Option<EventKind>,
    listener: Listener,
}

/// Synchronous publish/subscribe surface for [`BridgeEvent`]s.
///
/// Cloning yields another handle onto the same set of listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventBus {
    /// Create an event bus with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for one kind of event
    pub fn on<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(listener))
    }

    /// Listen for every event
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&BridgeEvent) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(listener))
    }

    /// Remove a listener, returning whether it was registered
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        before != subscriptions.len()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Deliver an event to every matching listener, in registration order.
    pub fn emit(&self, event: BridgeEvent) {
        let kind = event.kind();
        // Snapshot so listeners may (un)subscribe while being called.
        let listeners: Vec<Listener> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.filter.is_none_or(|k| k == kind))
            .map(|s| s.listener.clone())
            .collect();

        trace!(event = %kind, listeners = listeners.len(), "Emitting event");
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(event = %kind, "Event listener panicked");
            }
        }
    }

    /// Emit a `status` event
    pub fn emit_status(&self, status: ConnectionStatus, error: Option<String>) {
        self.emit(BridgeEvent::Status { status, error });
    }

    /// Emit an `error` event
    pub fn emit_error(&self, error: &BridgeError) {
        self.emit(BridgeEvent::Error(error.into()));
    }

    fn insert(&self, filter: Option<EventKind>, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            filter,
            listener,
        });
        id
    }
}
