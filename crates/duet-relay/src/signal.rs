use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use duet_common::helpers::is_valid_session_id;
use duet_common::{
    ClientMessage, Error, RelayMessage, Result, SessionId, SignalPayload, MAX_SIGNAL_BYTES,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;

const WS_MAX_TEXT_BYTES: usize = 64 * 1024;

pub type ConnectionMap = Arc<RwLock<HashMap<SessionId, mpsc::Sender<Message>>>>;

fn to_ws_message(msg: &RelayMessage) -> Option<Message> {
    serde_json::to_string(msg).ok().map(Message::Text)
}

fn decode(text: &str) -> Result<ClientMessage> {
    Ok(serde_json::from_str(text)?)
}

/// Rejects a forward the relay will not attempt.
fn check_route(target: &str, signal: &SignalPayload) -> Result<()> {
    if !is_valid_session_id(target) {
        return Err(Error::protocol(format!("invalid target session id: {target:?}")));
    }
    let len = signal.encoded_len();
    if len > MAX_SIGNAL_BYTES {
        return Err(Error::protocol(format!(
            "signal of {len} bytes exceeds {MAX_SIGNAL_BYTES}"
        )));
    }
    Ok(())
}

async fn send_signal(tx: &mpsc::Sender<Message>, msg: &RelayMessage) -> bool {
    let Some(message) = to_ws_message(msg) else {
        return false;
    };
    tx.send(message).await.is_ok()
}

/// Releases a connection slot when the socket task ends.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let previous = state.active.fetch_add(1, Ordering::Relaxed);
    let slot = ConnectionSlot(state.active.clone());
    if previous >= state.config.max_connections {
        warn!("rejecting {}: connection limit reached", addr);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, addr, slot))
        .into_response()
}

async fn handle_socket(
    stream: WebSocket,
    state: AppState,
    addr: SocketAddr,
    _slot: ConnectionSlot,
) {
    info!("client connecting from {}", addr);
    let connections = state.connections;
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.config.outbox_capacity);

    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let mut session: Option<SessionId> = None;

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        let _ = send_signal(
                            &tx,
                            &RelayMessage::error("Binary messages are not supported"),
                        )
                        .await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if text.len() > WS_MAX_TEXT_BYTES {
                    let _ = send_signal(&tx, &RelayMessage::error("Message too large")).await;
                    break;
                }

                let msg = match decode(&text) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("invalid message from {}: {}", addr, err);
                        let _ = send_signal(&tx, &RelayMessage::error(err.to_string())).await;
                        continue;
                    }
                };
                debug!("{} -> relay: {}", addr, msg);

                match msg {
                    ClientMessage::Register => {
                        let id = Uuid::new_v4().to_string();
                        {
                            let mut guard = connections.write().await;
                            if let Some(old) = session.take() {
                                guard.remove(&old);
                                info!("session {} rebound to {}", old, id);
                            }
                            guard.insert(id.clone(), tx.clone());
                        }
                        session = Some(id.clone());
                        let _ = send_signal(&tx, &RelayMessage::Me { id: id.clone() }).await;
                        info!("registered session {} for {}", id, addr);
                    }
                    ClientMessage::CallUser {
                        target_session_id,
                        signal,
                        from,
                        display_name,
                    } => {
                        let Some(src) = &session else {
                            let _ = send_signal(
                                &tx,
                                &RelayMessage::error("Register required before signaling"),
                            )
                            .await;
                            continue;
                        };
                        if let Err(err) = check_route(&target_session_id, &signal) {
                            warn!("dropping callUser from {}: {}", src, err);
                            let _ = send_signal(&tx, &RelayMessage::error(err.to_string())).await;
                            continue;
                        }
                        if from != *src {
                            debug!("{} claimed to be {}; forwarding as {}", addr, from, src);
                        }
                        relay_message(
                            &connections,
                            &target_session_id,
                            RelayMessage::CallUser {
                                from: src.clone(),
                                name: display_name,
                                signal,
                            },
                        )
                        .await;
                    }
                    ClientMessage::AnswerCall {
                        signal,
                        target_session_id,
                    } => {
                        let Some(src) = &session else {
                            let _ = send_signal(
                                &tx,
                                &RelayMessage::error("Register required before signaling"),
                            )
                            .await;
                            continue;
                        };
                        if let Err(err) = check_route(&target_session_id, &signal) {
                            warn!("dropping answerCall from {}: {}", src, err);
                            let _ = send_signal(&tx, &RelayMessage::error(err.to_string())).await;
                            continue;
                        }
                        relay_message(
                            &connections,
                            &target_session_id,
                            RelayMessage::CallAccepted {
                                signal,
                                from: Some(src.clone()),
                            },
                        )
                        .await;
                    }
                }
            }
        }
    }

    if let Some(id) = session {
        info!("client disconnected: {} ({})", id, addr);
        connections.write().await.remove(&id);
    } else {
        info!("client disconnected: {}", addr);
    }
}

/// Queues `msg` for `target`. Unknown targets and full outboxes are only
/// logged; the sender is never told.
async fn relay_message(connections: &ConnectionMap, target: &str, msg: RelayMessage) {
    let tx = {
        let guard = connections.read().await;
        guard.get(target).cloned()
    };

    let Some(tx) = tx else {
        warn!("target session not connected: {}", target);
        return;
    };
    let Some(message) = to_ws_message(&msg) else {
        return;
    };
    if tx.try_send(message).is_err() {
        warn!("failed to queue {} for {}", msg, target);
    }
}
