//! End-to-end call flows: a real relay on a loopback port and two complete
//! client stacks talking to it over WebSocket.

use std::sync::Arc;
use std::time::Duration;

use duet_client::{
    spawn_coordinator, CallCoordinator, CallHandle, CallPhase, CallSnapshot, Collaborators,
    CoordinatorConfig, LoopbackConnector, LoopbackNetwork, SinkSlot, SyntheticMedia, WsRegistry,
};
use duet_common::{ClientMessage, RelayMessage, SignalPayload, MAX_SIGNAL_BYTES};
use duet_relay::{AppState, RelayConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> (String, AppState) {
    start_relay_with(RelayConfig::default()).await
}

async fn start_relay_with(config: RelayConfig) -> (String, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(config);
    tokio::spawn(duet_relay::serve(listener, state.clone()));
    (format!("ws://{addr}/ws"), state)
}

async fn raw_connect(url: &str) -> RawSocket {
    connect_async(url).await.unwrap().0
}

async fn send(ws: &mut RawSocket, msg: &ClientMessage) {
    let text = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

async fn next_message(ws: &mut RawSocket) -> RelayMessage {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a relay frame")
            .expect("relay closed the connection")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

async fn register(ws: &mut RawSocket) -> String {
    send(ws, &ClientMessage::Register).await;
    match next_message(ws).await {
        RelayMessage::Me { id } => id,
        other => panic!("expected me, got {other}"),
    }
}

fn call_user(target: &str, from: &str, signal: SignalPayload) -> ClientMessage {
    ClientMessage::CallUser {
        target_session_id: target.to_string(),
        signal,
        from: from.to_string(),
        display_name: "Alice".into(),
    }
}

struct Party {
    handle: CallHandle,
    remote_view: Arc<SinkSlot>,
}

impl Party {
    async fn join(url: &str, name: &str, network: &LoopbackNetwork) -> Self {
        let (registry, events, _pump) = WsRegistry::connect(url).await.unwrap();
        let remote_view = Arc::new(SinkSlot::new());
        let (coordinator, peer_events) = CallCoordinator::new(
            CoordinatorConfig {
                display_name: name.to_string(),
                dial_timeout: None,
            },
            Collaborators {
                registry: Box::new(registry),
                connector: Box::new(LoopbackConnector::new(network.clone())),
                media: Box::new(SyntheticMedia::new(name)),
                local_sink: Arc::new(SinkSlot::new()),
                remote_sink: remote_view.clone(),
            },
        );
        let (handle, _task) = spawn_coordinator(coordinator, peer_events, events);
        Self {
            handle,
            remote_view,
        }
    }

    async fn me(&self) -> String {
        timeout(WAIT, self.handle.wait_registered())
            .await
            .expect("timed out waiting for a session id")
            .unwrap()
    }

    async fn until(&self, pred: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        timeout(WAIT, self.handle.wait_for(pred))
            .await
            .expect("timed out waiting for call state")
            .unwrap()
    }
}

#[tokio::test]
async fn test_happy_path_connects_both_parties() {
    let (url, _relay) = start_relay().await;
    let network = LoopbackNetwork::new();
    let alice = Party::join(&url, "Alice", &network).await;
    let bob = Party::join(&url, "Bob", &network).await;
    let alice_id = alice.me().await;
    let bob_id = bob.me().await;
    assert_ne!(alice_id, bob_id);

    alice.handle.place_call(bob_id.clone()).await.unwrap();
    assert_eq!(alice.handle.snapshot().phase, CallPhase::Dialing);

    let ringing = bob.until(|s| s.phase == CallPhase::Ringing).await;
    let call = ringing.call.unwrap();
    assert!(call.receiving);
    assert_eq!(call.from_session_id, alice_id);
    assert_eq!(call.caller_display_name, "Alice");
    assert!(call.incoming_signal.is_some());

    bob.handle.accept_call().await.unwrap();

    let a = alice
        .until(|s| s.phase == CallPhase::Connected && s.remote_stream_attached)
        .await;
    let b = bob
        .until(|s| s.phase == CallPhase::Connected && s.remote_stream_attached)
        .await;
    assert!(a.call_accepted);
    assert!(b.call_accepted);
    assert!(!a.call_ended);

    assert_eq!(alice.remote_view.current().unwrap().label, "Bob");
    assert_eq!(bob.remote_view.current().unwrap().label, "Alice");
}

#[tokio::test]
async fn test_unanswered_call_keeps_dialing_until_ended() {
    let (url, _relay) = start_relay().await;
    let network = LoopbackNetwork::new();
    let alice = Party::join(&url, "Alice", &network).await;
    let bob = Party::join(&url, "Bob", &network).await;
    let alice_id = alice.me().await;
    let bob_id = bob.me().await;

    alice.handle.place_call(bob_id).await.unwrap();
    bob.until(|s| s.phase == CallPhase::Ringing).await;
    bob.handle.dismiss_call().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let dialing = alice.handle.snapshot();
    assert_eq!(dialing.phase, CallPhase::Dialing);
    assert!(!dialing.call_accepted);
    assert_eq!(bob.handle.snapshot().phase, CallPhase::Idle);

    assert!(alice.handle.end_call().await.unwrap());
    let after = alice
        .until(|s| s.phase == CallPhase::Idle && s.me.is_some())
        .await;
    assert_ne!(after.me.unwrap(), alice_id);
    assert!(after.call.is_none());
    assert!(!after.call_ended);
}

#[tokio::test]
async fn test_hang_up_tears_down_both_sides() {
    let (url, relay) = start_relay().await;
    let network = LoopbackNetwork::new();
    let alice = Party::join(&url, "Alice", &network).await;
    let bob = Party::join(&url, "Bob", &network).await;
    let alice_id = alice.me().await;
    let bob_id = bob.me().await;

    alice.handle.place_call(bob_id.clone()).await.unwrap();
    bob.until(|s| s.phase == CallPhase::Ringing).await;
    bob.handle.accept_call().await.unwrap();
    alice
        .until(|s| s.phase == CallPhase::Connected && s.remote_stream_attached)
        .await;
    bob.until(|s| s.remote_stream_attached).await;

    assert!(alice.handle.end_call().await.unwrap());
    assert!(alice.remote_view.current().is_none());

    let a = alice
        .until(|s| s.phase == CallPhase::Idle && s.me.is_some())
        .await;
    assert_ne!(a.me.unwrap(), alice_id);
    assert!(!a.call_accepted);
    assert!(a.call.is_none());

    let b = bob
        .until(|s| s.phase == CallPhase::Idle && s.me.is_some() && !s.remote_stream_attached)
        .await;
    assert_ne!(b.me.unwrap(), bob_id);
    assert!(bob.remote_view.current().is_none());
    assert_eq!(network.active_links(), 0);

    // Both re-registered; the old ids are gone.
    assert_eq!(relay.session_count().await, 2);
}

#[tokio::test]
async fn test_signaling_before_register_is_rejected() {
    let (url, _relay) = start_relay().await;
    let mut ws = raw_connect(&url).await;
    ws.send(Message::Text(
        r#"{"type":"answerCall","signal":{"sdp":"x"},"targetSessionId":"B1"}"#.into(),
    ))
    .await
    .unwrap();

    assert!(matches!(next_message(&mut ws).await, RelayMessage::Error { .. }));
}

#[tokio::test]
async fn test_upgrade_beyond_connection_limit_gets_503() {
    let (url, relay) = start_relay_with(RelayConfig {
        max_connections: 1,
        ..RelayConfig::default()
    })
    .await;
    let mut first = raw_connect(&url).await;
    register(&mut first).await;

    match connect_async(url.as_str()).await {
        Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status().as_u16(), 503),
        Err(e) => panic!("expected an HTTP 503, got {e}"),
        Ok(_) => panic!("second connection was accepted over the limit"),
    }

    // The held connection is unaffected.
    register(&mut first).await;
    assert_eq!(relay.session_count().await, 1);
}

#[tokio::test]
async fn test_binary_frame_gets_error_then_close() {
    let (url, _relay) = start_relay().await;
    let mut ws = raw_connect(&url).await;
    ws.send(Message::Binary(vec![0, 1, 2])).await.unwrap();

    assert!(matches!(next_message(&mut ws).await, RelayMessage::Error { .. }));
    loop {
        match timeout(WAIT, ws.next()).await.expect("connection was not closed") {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("unexpected frame after binary: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_oversized_signal_is_rejected_and_not_forwarded() {
    let (url, _relay) = start_relay().await;
    let mut alice = raw_connect(&url).await;
    let mut bob = raw_connect(&url).await;
    let alice_id = register(&mut alice).await;
    let bob_id = register(&mut bob).await;

    let big = SignalPayload::new(json!({"type": "offer", "sdp": "x".repeat(33 * 1024)}));
    assert!(big.encoded_len() > MAX_SIGNAL_BYTES);
    send(&mut alice, &call_user(&bob_id, &alice_id, big)).await;
    assert!(matches!(next_message(&mut alice).await, RelayMessage::Error { .. }));
    assert!(
        timeout(QUIET, bob.next()).await.is_err(),
        "oversized signal reached the target"
    );

    // The sender stays connected and a normal call still goes through.
    let small = SignalPayload::new(json!({"type": "offer", "sdp": "v=0"}));
    send(&mut alice, &call_user(&bob_id, &alice_id, small.clone())).await;
    assert_eq!(
        next_message(&mut bob).await,
        RelayMessage::CallUser {
            from: alice_id,
            name: "Alice".into(),
            signal: small,
        }
    );
}

#[tokio::test]
async fn test_invalid_target_is_rejected() {
    let (url, _relay) = start_relay().await;
    let mut alice = raw_connect(&url).await;
    let alice_id = register(&mut alice).await;

    let signal = SignalPayload::new(json!({"type": "offer"}));
    send(&mut alice, &call_user("bad id!", &alice_id, signal)).await;
    let RelayMessage::Error { message } = next_message(&mut alice).await else {
        panic!("expected an error reply");
    };
    assert!(message.contains("invalid target"), "{message}");

    // Still usable afterwards.
    assert_ne!(register(&mut alice).await, alice_id);
}
