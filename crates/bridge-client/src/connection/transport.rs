//! Wire channel abstraction and its WebSocket implementation.

use std::fmt;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use super::close_codes;
use crate::error::{BridgeError, BridgeResult};

/// Capacity of the per-channel frame queues
pub const CHANNEL_BUFFER: usize = 64;

/// Notification from an open channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// A text frame
    Text(String),
    /// The channel closed; no further events follow
    Closed {
        /// Close code, `1006` when the peer vanished without a close frame
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// Frame written to an open channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundWire {
    /// A text frame
    Text(String),
    /// Start the close handshake
    Close {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// An open channel: a writer queue and an ordered stream of events
#[derive(Debug)]
pub struct Channel {
    /// Frames to write
    pub outgoing: mpsc::Sender<OutboundWire>,
    /// Frames and the final close notification, in arrival order
    pub incoming: mpsc::Receiver<WireEvent>,
}

/// Opens channels to the bridge server.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a channel to `url`.
    ///
    /// Fails with [`BridgeError::AuthenticationRejected`] when the server
    /// refuses the credential during the handshake, and with
    /// [`BridgeError::Connect`] for any other failure.
    async fn open(&self, url: &Url) -> BridgeResult<Channel>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Connector`] over `tokio-tungstenite`
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url) -> BridgeResult<Channel> {
        debug!(host = url.host_str().unwrap_or_default(), path = url.path(), "Opening WebSocket");

        let (stream, _response) = connect_async(url.as_str()).await.map_err(|e| match e {
            tungstenite::Error::Http(response)
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                BridgeError::AuthenticationRejected(format!(
                    "handshake refused with status {}",
                    response.status()
                ))
            }
            other => BridgeError::Connect(format!("WebSocket connection failed: {other}")),
        })?;

        let (sink, stream) = stream.split();
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (control_tx, control_rx) = mpsc::channel(CHANNEL_BUFFER);

        tokio::spawn(write_pump(sink, out_rx, control_rx));
        tokio::spawn(read_pump(stream, in_tx, control_tx));

        Ok(Channel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

async fn write_pump(
    mut sink: SplitSink<WsStream, Message>,
    mut outgoing: mpsc::Receiver<OutboundWire>,
    mut control: mpsc::Receiver<Message>,
) {
    loop {
        let message = tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(OutboundWire::Text(text)) => Message::Text(text.into()),
                Some(OutboundWire::Close { code, reason }) => Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                })),
                None => break,
            },
            Some(message) = control.recv() => message,
        };

        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "WebSocket write failed");
            return;
        }
        if closing {
            trace!("Close frame sent");
            return;
        }
    }

    let _ = sink.close().await;
}

async fn read_pump(
    mut stream: SplitStream<WsStream>,
    incoming: mpsc::Sender<WireEvent>,
    control: mpsc::Sender<Message>,
) {
    let closed = loop {
        let event = match stream.next().await {
            Some(Ok(Message::Text(text))) => WireEvent::Text(text.to_string()),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => WireEvent::Text(text),
                Err(_) => {
                    warn!(len = data.len(), "Dropping non UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = control.send(Message::Pong(data)).await;
                continue;
            }
            Some(Ok(Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => WireEvent::Closed {
                        code: u16::from(frame.code),
                        reason: frame.reason.to_string(),
                    },
                    None => WireEvent::Closed {
                        code: close_codes::NO_STATUS,
                        reason: String::new(),
                    },
                };
            }
            Some(Err(e)) => {
                break WireEvent::Closed {
                    code: close_codes::ABNORMAL,
                    reason: e.to_string(),
                };
            }
            None => {
                break WireEvent::Closed {
                    code: close_codes::ABNORMAL,
                    reason: "stream ended".to_string(),
                };
            }
        };

        if incoming.send(event).await.is_err() {
            trace!("Channel receiver dropped, stopping reader");
            return;
        }
    };

    let _ = incoming.send(closed).await;
}
