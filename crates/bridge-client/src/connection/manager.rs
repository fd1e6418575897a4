//! Connection manager: state machine, authentication bootstrap and reconnection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::close::{CloseDisposition, close_codes};
use super::transport::{Channel, Connector, OutboundWire, WebSocketConnector, WireEvent};
use super::ConnectionStatus;
use crate::config::BridgeConfig;
use crate::credentials::{CredentialStore, Identity};
use crate::dispatch::{DispatchRouter, FrameSink, Routed};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{BridgeEvent, EventBus};
use crate::protocol::OutboundFrame;
use crate::registry::{ToolDescriptor, ToolRegistry};

/// Point-in-time view of the reconnection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSnapshot {
    /// Retries scheduled since the last successful connect
    pub attempt: u32,
    /// Whether a retry is waiting or in flight
    pub pending: bool,
    /// Delay of the pending retry
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Connect,
    Reconnect,
}

#[derive(Default)]
struct State {
    status: ConnectionStatus,
    identity: Option<Identity>,
    peer: Option<String>,
    outgoing: Option<mpsc::Sender<OutboundWire>>,
    driver: Option<JoinHandle<()>>,
    /// Bumped whenever a channel opens or the host disconnects; work tagged
    /// with an older value is stale and must not touch the state.
    generation: u64,
    attempt: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_delay: Option<Duration>,
    auth_reset_attempted: bool,
}

enum RetryOutcome {
    Scheduled(Duration),
    Exhausted(u32),
    Disabled,
}

struct Inner {
    config: BridgeConfig,
    credentials: CredentialStore,
    connector: Arc<dyn Connector>,
    router: DispatchRouter,
    events: EventBus,
    state: Mutex<State>,
    /// Serializes open attempts from `connect()` and reconnect timers
    connect_lock: tokio::sync::Mutex<()>,
}

/// Owns the channel to the bridge server.
///
/// Cloning yields another handle onto the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("app_id", &self.inner.config.app_id)
            .field("status", &self.status())
            .field("connector", &self.inner.connector)
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager that opens WebSocket channels
    pub fn new(
        config: BridgeConfig,
        credentials: CredentialStore,
        registry: ToolRegistry,
    ) -> BridgeResult<Self> {
        Self::with_connector(config, credentials, registry, Arc::new(WebSocketConnector::new()))
    }

    /// Create a manager that opens channels through `connector`
    pub fn with_connector(
        config: BridgeConfig,
        credentials: CredentialStore,
        registry: ToolRegistry,
        connector: Arc<dyn Connector>,
    ) -> BridgeResult<Self> {
        config.validate()?;
        if credentials.app_id() != config.app_id {
            return Err(BridgeError::Configuration(format!(
                "credential store is bound to app '{}', configuration names '{}'",
                credentials.app_id(),
                config.app_id
            )));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                credentials,
                connector,
                router: DispatchRouter::new(registry),
                events: EventBus::new(),
                state: Mutex::new(State::default()),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Event surface of this connection
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Tools advertised on this connection
    pub fn registry(&self) -> &ToolRegistry {
        self.inner.router.registry()
    }

    /// Configuration this manager was built with
    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Identity used for the current or last channel
    pub fn identity(&self) -> Option<Identity> {
        self.inner.state.lock().identity.clone()
    }

    /// Agent session currently bridged, if any
    pub fn bridged_peer(&self) -> Option<String> {
        let state = self.inner.state.lock();
        match state.status {
            ConnectionStatus::Bridged => state.peer.clone(),
            _ => None,
        }
    }

    /// Current reconnection state
    pub fn reconnect_state(&self) -> ReconnectSnapshot {
        let state = self.inner.state.lock();
        let pending = state
            .reconnect_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished());
        ReconnectSnapshot {
            attempt: state.attempt,
            pending,
            delay: state.reconnect_delay.filter(|_| pending),
        }
    }

    /// Open the channel and wait until it is connected.
    ///
    /// Returns immediately when already connected. Without a persisted
    /// identity a new one is issued first; if issuance fails no channel is
    /// opened. A failed open is reported here and also starts the
    /// reconnection policy.
    pub async fn connect(&self) -> BridgeResult<()> {
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;
        {
            let mut state = inner.state.lock();
            if state.status.is_open() {
                return Ok(());
            }
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            state.reconnect_delay = None;
            // A host-initiated connect starts a fresh backoff series.
            state.attempt = 0;
        }
        inner.establish(Trigger::Connect).await
    }

    /// Close the channel and wait for the close handshake.
    ///
    /// Cancels any pending reconnection. The handshake is bounded by the
    /// configured close timeout.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let (outgoing, driver) = {
            let mut state = inner.state.lock();
            state.generation += 1;
            state.attempt = 0;
            state.reconnect_delay = None;
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            (state.outgoing.take(), state.driver.take())
        };

        if let Some(outgoing) = outgoing {
            debug!("Sending close frame");
            let _ = outgoing
                .send(OutboundWire::Close {
                    code: close_codes::NORMAL,
                    reason: "client disconnect".to_string(),
                })
                .await;
            drop(outgoing);

            if let Some(mut driver) = driver
                && tokio::time::timeout(inner.config.close_timeout, &mut driver)
                    .await
                    .is_err()
            {
                warn!(timeout = ?inner.config.close_timeout, "Close handshake timed out");
                driver.abort();
            }
        }

        inner.transition(ConnectionStatus::Disconnected, None);
        info!(app_id = %inner.config.app_id, "Disconnected");
    }

    /// Send a frame on the open channel.
    ///
    /// Fails with [`BridgeError::NotConnected`] when no channel is open.
    pub async fn send(&self, frame: OutboundFrame) -> BridgeResult<()> {
        self.inner.send(frame).await
    }

    /// Register a tool and re-advertise when a channel is open
    pub async fn register_tool(&self, descriptor: ToolDescriptor) -> BridgeResult<()> {
        self.registry().register(descriptor);
        if self.status().is_open() {
            self.inner.advertise().await?;
        }
        Ok(())
    }

    /// Discard the persisted identity and issue a new one.
    ///
    /// An open or reconnecting channel is closed first and reopened with the
    /// new identity afterwards.
    pub async fn reset_credentials(&self) -> BridgeResult<Identity> {
        let reopen = {
            let state = self.inner.state.lock();
            state.status != ConnectionStatus::Disconnected
                || state
                    .reconnect_timer
                    .as_ref()
                    .is_some_and(|timer| !timer.is_finished())
        };
        if reopen {
            self.disconnect().await;
        }

        let identity = self.inner.renew_identity().await?;
        if reopen {
            self.connect().await?;
        }
        Ok(identity)
    }
}

#[async_trait]
impl FrameSink for ConnectionManager {
    async fn send_frame(&self, frame: OutboundFrame) -> BridgeResult<()> {
        self.inner.send(frame).await
    }
}

impl Inner {
    async fn establish(self: &Arc<Self>, trigger: Trigger) -> BridgeResult<()> {
        let attempt_generation = self.state.lock().generation;
        self.transition(ConnectionStatus::Connecting, None);

        let identity = match self.identity_for(trigger).await {
            Ok(identity) => identity,
            Err(e) => {
                self.attempt_failed(attempt_generation, &e);
                return Err(e);
            }
        };

        let url = match self.config.endpoint.url_for(&self.config.app_id, &identity) {
            Ok(url) => url,
            Err(e) => {
                self.attempt_failed(attempt_generation, &e);
                return Err(e);
            }
        };

        debug!(
            app_id = %self.config.app_id,
            user_id = %identity.user_id,
            host = url.host_str().unwrap_or_default(),
            ?trigger,
            "Opening channel"
        );
        let opened = match tokio::time::timeout(self.config.connect_timeout, self.connector.open(&url))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BridgeError::ConnectTimeout(self.config.connect_timeout)),
        };
        let Channel { outgoing, incoming } = match opened {
            Ok(channel) => channel,
            Err(e) => {
                self.attempt_failed(attempt_generation, &e);
                return Err(e);
            }
        };

        let generation = {
            let mut state = self.state.lock();
            if state.generation != attempt_generation {
                None
            } else {
                state.generation += 1;
                state.status = ConnectionStatus::Connected;
                state.peer = None;
                state.outgoing = Some(outgoing.clone());
                state.attempt = 0;
                state.reconnect_timer = None;
                state.reconnect_delay = None;
                state.auth_reset_attempted = false;
                Some(state.generation)
            }
        };
        let Some(generation) = generation else {
            debug!("Connection attempt superseded by disconnect");
            let _ = outgoing
                .send(OutboundWire::Close {
                    code: close_codes::NORMAL,
                    reason: "client disconnect".to_string(),
                })
                .await;
            return Err(BridgeError::Connect(
                "connection attempt cancelled by disconnect".to_string(),
            ));
        };

        if let Err(e) = self.write(&outgoing, &self.advertisement()).await {
            let err = BridgeError::Connect(format!(
                "channel closed before tools were advertised: {e}"
            ));
            {
                let mut state = self.state.lock();
                if state.generation == generation {
                    state.outgoing = None;
                }
            }
            self.attempt_failed(generation, &err);
            return Err(err);
        }

        // Connected must be published before the driver reads the first frame.
        if self.state.lock().generation != generation {
            return Ok(());
        }
        info!(app_id = %self.config.app_id, user_id = %identity.user_id, "Connected");
        self.events.emit_status(ConnectionStatus::Connected, None);

        let mut state = self.state.lock();
        if state.generation == generation {
            state.driver = Some(tokio::spawn(Arc::clone(self).drive(generation, incoming)));
        }
        Ok(())
    }

    async fn identity_for(&self, trigger: Trigger) -> BridgeResult<Identity> {
        if trigger == Trigger::Reconnect
            && let Some(identity) = self.state.lock().identity.clone()
        {
            return Ok(identity);
        }

        let identity = match self.credentials.load().await {
            Some(identity) => identity,
            None => {
                info!(app_id = %self.config.app_id, "No persisted identity, requesting one");
                let identity = self.credentials.issue().await?;
                self.events.emit(BridgeEvent::IdentityReady(identity.clone()));
                identity
            }
        };
        self.state.lock().identity = Some(identity.clone());
        Ok(identity)
    }

    async fn renew_identity(self: &Arc<Self>) -> BridgeResult<Identity> {
        match self.credentials.reset().await {
            Ok(identity) => {
                self.state.lock().identity = Some(identity.clone());
                self.events.emit(BridgeEvent::IdentityReady(identity.clone()));
                Ok(identity)
            }
            Err(e) => {
                error!(error = %e, "Credential reset failed");
                self.events.emit_error(&e);
                Err(e)
            }
        }
    }

    fn advertisement(&self) -> OutboundFrame {
        OutboundFrame::ToolsRegistration {
            tools: self.router.registry().list(),
        }
    }

    async fn advertise(&self) -> BridgeResult<()> {
        let outgoing = self.outgoing()?;
        self.write(&outgoing, &self.advertisement()).await
    }

    async fn send(&self, frame: OutboundFrame) -> BridgeResult<()> {
        let outgoing = self.outgoing()?;
        self.write(&outgoing, &frame).await
    }

    fn outgoing(&self) -> BridgeResult<mpsc::Sender<OutboundWire>> {
        self.state
            .lock()
            .outgoing
            .clone()
            .ok_or(BridgeError::NotConnected)
    }

    async fn write(
        &self,
        outgoing: &mpsc::Sender<OutboundWire>,
        frame: &OutboundFrame,
    ) -> BridgeResult<()> {
        let text = frame.encode()?;
        trace!(bytes = text.len(), "Sending frame");
        outgoing
            .send(OutboundWire::Text(text))
            .await
            .map_err(|_| BridgeError::NotConnected)
    }

    async fn drive(self: Arc<Self>, generation: u64, mut incoming: mpsc::Receiver<WireEvent>) {
        let sink: Arc<dyn FrameSink> = Arc::new(ConnectionManager {
            inner: Arc::clone(&self),
        });

        while let Some(event) = incoming.recv().await {
            match event {
                WireEvent::Text(text) => self.handle_frame(generation, &text, &sink),
                WireEvent::Closed { code, reason } => {
                    self.handle_close(generation, code, &reason);
                    return;
                }
            }
        }
        self.handle_close(generation, close_codes::ABNORMAL, "channel dropped");
    }

    fn handle_frame(&self, generation: u64, text: &str, sink: &Arc<dyn FrameSink>) {
        if self.state.lock().generation != generation {
            trace!("Ignoring frame from a stale channel");
            return;
        }

        match self.router.route(text, sink) {
            Ok(Routed::PeerConnected(peer)) => self.peer_attached(peer),
            Ok(Routed::PeerDisconnected(peer)) => self.peer_detached(peer),
            Ok(Routed::Message(value)) => self.events.emit(BridgeEvent::Message(value)),
            Ok(Routed::Dispatched) => {}
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                self.events.emit_error(&e);
            }
        }
    }

    fn peer_attached(&self, peer: Option<String>) {
        let bridged = {
            let mut state = self.state.lock();
            match state.status {
                ConnectionStatus::Connected => {
                    state.status = ConnectionStatus::Bridged;
                    state.peer = peer.clone();
                    true
                }
                ConnectionStatus::Bridged => {
                    state.peer = peer.clone();
                    false
                }
                _ => false,
            }
        };

        if bridged {
            info!(agent = ?peer, "Agent attached");
            self.events.emit_status(ConnectionStatus::Bridged, None);
        }
        self.events.emit(BridgeEvent::PeerConnected {
            agent_session_id: peer,
        });
    }

    fn peer_detached(&self, peer: Option<String>) {
        let unbridged = {
            let mut state = self.state.lock();
            if state.status == ConnectionStatus::Bridged && state.peer == peer {
                state.status = ConnectionStatus::Connected;
                state.peer = None;
                true
            } else {
                false
            }
        };

        if unbridged {
            info!(agent = ?peer, "Agent detached");
            self.events.emit_status(ConnectionStatus::Connected, None);
        } else {
            debug!(agent = ?peer, "Ignoring detach of an agent that is not bridged");
        }
        self.events.emit(BridgeEvent::PeerDisconnected {
            agent_session_id: peer,
        });
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: u16, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                trace!(code, "Ignoring close of a stale channel");
                return;
            }
            state.outgoing = None;
            state.driver = None;
            state.peer = None;
        }

        match CloseDisposition::from_code(code) {
            CloseDisposition::Settle => {
                info!(code, reason, "Channel closed");
                self.transition(ConnectionStatus::Disconnected, None);
            }
            CloseDisposition::Rejected => {
                let err = BridgeError::AuthenticationRejected(if reason.is_empty() {
                    "policy violation".to_string()
                } else {
                    reason.to_string()
                });
                error!(code, reason, "Server rejected identity");
                self.transition(ConnectionStatus::Disconnected, Some(err.to_string()));
                self.events.emit_error(&err);
                self.auto_reset(generation);
            }
            CloseDisposition::Retry => {
                warn!(code, reason, "Channel closed abnormally");
                self.transition(
                    ConnectionStatus::Disconnected,
                    Some(format!("connection closed with code {code}")),
                );
                self.retry(generation);
            }
        }
    }

    fn attempt_failed(self: &Arc<Self>, generation: u64, err: &BridgeError) {
        if self.state.lock().generation != generation {
            debug!(error = %err, "Connection attempt failed after disconnect");
            return;
        }

        warn!(error = %err, "Connection attempt failed");
        self.transition(ConnectionStatus::Disconnected, Some(err.to_string()));
        self.events.emit_error(err);

        if matches!(err, BridgeError::AuthenticationRejected(_)) {
            self.auto_reset(generation);
        } else if err.is_retryable() {
            self.retry(generation);
        }
    }

    fn retry(self: &Arc<Self>, generation: u64) {
        let outcome = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            self.schedule_reconnect(&mut state)
        };

        match outcome {
            RetryOutcome::Scheduled(delay) => {
                info!(delay = ?delay, "Reconnect scheduled");
            }
            RetryOutcome::Exhausted(attempts) => {
                let err = BridgeError::Connect(format!(
                    "reconnection abandoned after {attempts} attempts"
                ));
                error!(attempts, "Giving up reconnecting");
                self.events.emit_error(&err);
            }
            RetryOutcome::Disabled => debug!("Reconnection disabled"),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut State) -> RetryOutcome {
        let policy = &self.config.reconnect;
        if !policy.enabled {
            return RetryOutcome::Disabled;
        }
        if !policy.allows(state.attempt) {
            state.reconnect_timer = None;
            state.reconnect_delay = None;
            return RetryOutcome::Exhausted(state.attempt);
        }

        let delay = policy.delay_for(state.attempt);
        state.attempt += 1;
        let generation = state.generation;
        let inner = Arc::clone(self);
        // The previous handle may belong to the task running this code, so it
        // is released rather than aborted.
        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.reconnect(generation).await;
        }));
        state.reconnect_delay = Some(delay);
        RetryOutcome::Scheduled(delay)
    }

    async fn reconnect(self: Arc<Self>, generation: u64) {
        let _guard = self.connect_lock.lock().await;
        let attempt = {
            let state = self.state.lock();
            if state.generation != generation || state.status.is_open() {
                return;
            }
            state.attempt
        };

        info!(attempt, "Reconnecting");
        if let Err(e) = self.establish(Trigger::Reconnect).await {
            debug!(error = %e, attempt, "Reconnect attempt failed");
        }
    }

    fn auto_reset(self: &Arc<Self>, generation: u64) {
        if !self.config.auto_reset_on_auth_failure {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.auth_reset_attempted {
                return;
            }
            state.auth_reset_attempted = true;
        }

        info!("Resetting credentials after rejection");
        let manager = ConnectionManager {
            inner: Arc::clone(self),
        };
        tokio::spawn(async move {
            if manager.inner.renew_identity().await.is_ok()
                && let Err(e) = manager.connect().await
            {
                warn!(error = %e, "Reconnect with renewed identity failed");
            }
        });
    }

    fn transition(&self, status: ConnectionStatus, error: Option<String>) {
        let previous = {
            let mut state = self.state.lock();
            let previous = state.status;
            state.status = status;
            if !status.is_open() {
                state.peer = None;
            }
            previous
        };

        if previous != status || error.is_some() {
            debug!(from = %previous, to = %status, "Status changed");
            self.events.emit_status(status, error);
        }
    }
}
