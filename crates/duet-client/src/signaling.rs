//! Session registry: the relay connection that hands out our session id and
//! carries call signaling to the other party.

use anyhow::{anyhow, Result};
use duet_common::{ClientMessage, RelayMessage, SessionId, SignalPayload};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::CallError;

/// Something the registry told us.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    SessionAssigned(SessionId),
    InboundCall {
        from: SessionId,
        name: String,
        signal: SignalPayload,
    },
    CallAccepted {
        signal: SignalPayload,
        from: Option<SessionId>,
    },
    /// The relay refused one of our messages.
    Rejected(String),
    /// The relay connection is gone.
    Disconnected(String),
}

impl From<RelayMessage> for RegistryEvent {
    fn from(msg: RelayMessage) -> Self {
        match msg {
            RelayMessage::Me { id } => Self::SessionAssigned(id),
            RelayMessage::CallUser { from, name, signal } => {
                Self::InboundCall { from, name, signal }
            }
            RelayMessage::CallAccepted { signal, from } => Self::CallAccepted { signal, from },
            RelayMessage::Error { message } => Self::Rejected(message),
        }
    }
}

pub type RegistryEventSender = mpsc::UnboundedSender<RegistryEvent>;
pub type RegistryEventReceiver = mpsc::UnboundedReceiver<RegistryEvent>;

/// Outbound half of the registry. Sending never blocks; delivery is not
/// acknowledged.
pub trait SessionRegistry: Send {
    fn send(&mut self, msg: ClientMessage) -> Result<(), CallError>;

    /// Ask for a (new) session id. The answer arrives as
    /// `RegistryEvent::SessionAssigned`.
    fn register(&mut self) -> Result<(), CallError> {
        self.send(ClientMessage::Register)
    }
}

/// A single WebSocket connection to the relay.
pub struct RelayConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelayConnection {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url).await?;
        Ok(Self { ws })
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(msg)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Next message from the relay. Only transport failures are errors;
    /// frames that do not parse are logged and skipped.
    pub async fn recv(&mut self) -> Result<RelayMessage> {
        while let Some(msg) = self.ws.next().await {
            match msg? {
                Message::Text(text) => match serde_json::from_str::<RelayMessage>(&text) {
                    Ok(relay_msg) => return Ok(relay_msg),
                    Err(e) => {
                        warn!("skipping unreadable relay frame: {}", e);
                        continue;
                    }
                },
                Message::Close(_) => break,
                _ => continue,
            }
        }
        Err(anyhow!("relay connection closed"))
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// `SessionRegistry` backed by a relay connection driven on its own task.
#[derive(Clone)]
pub struct WsRegistry {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
}

impl WsRegistry {
    /// Connects to the relay and starts pumping messages. Incoming relay
    /// messages come out of the returned receiver; it yields
    /// `Disconnected` once and then closes when the connection drops.
    pub async fn connect(url: &str) -> Result<(Self, RegistryEventReceiver, JoinHandle<()>)> {
        info!("connecting to relay: {}", url);
        let conn = RelayConnection::connect(url).await?;
        info!("relay connected");
        Ok(Self::spawn(conn))
    }

    pub fn spawn(conn: RelayConnection) -> (Self, RegistryEventReceiver, JoinHandle<()>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(conn, out_rx, event_tx));
        (Self { outgoing: out_tx }, event_rx, task)
    }
}

impl SessionRegistry for WsRegistry {
    fn send(&mut self, msg: ClientMessage) -> Result<(), CallError> {
        self.outgoing
            .send(msg)
            .map_err(|_| CallError::registry("relay connection is closed"))
    }
}

async fn pump(
    mut conn: RelayConnection,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    events: RegistryEventSender,
) {
    let reason = loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(msg) = msg else {
                    debug!("registry handle dropped; closing relay connection");
                    conn.close().await;
                    return;
                };
                debug!("-> relay: {}", msg);
                if let Err(e) = conn.send(&msg).await {
                    error!("failed to send {} to relay: {}", msg, e);
                    break e.to_string();
                }
            }
            result = conn.recv() => {
                match result {
                    Ok(msg) => {
                        debug!("<- relay: {}", msg);
                        if events.send(RegistryEvent::from(msg)).is_err() {
                            conn.close().await;
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("relay connection lost: {}", e);
                        break e.to_string();
                    }
                }
            }
        }
    };
    let _ = events.send(RegistryEvent::Disconnected(reason));
}
