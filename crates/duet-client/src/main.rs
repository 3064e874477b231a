#![forbid(unsafe_code)]

//! Duet call client.
//!
//! Registers with a relay, prints the session id it was given, and then
//! places or answers a single call at a time until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use duet_client::{
    spawn_coordinator, CallCoordinator, CallHandle, CallPhase, CallSnapshot, Collaborators,
    CoordinatorConfig, MediaSource, MediaStream, PeerConnector, SinkSlot, SyntheticMedia,
    WsRegistry,
};
use duet_common::helpers::env_bool;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "duet-client")]
#[command(about = "Two-party call client speaking the Duet relay protocol")]
struct Args {
    /// Relay WebSocket URL
    #[arg(long, env = "DUET_RELAY_URL", default_value = "ws://127.0.0.1:5000/ws")]
    relay_url: String,

    /// Name shown to the other party
    #[arg(long, env = "DUET_NAME", default_value = "")]
    name: String,

    /// Session id to call once registered
    #[arg(long)]
    call: Option<String>,

    /// Accept incoming calls without asking (also DUET_AUTO_ANSWER=1)
    #[arg(long, default_value_t = false)]
    auto_answer: bool,

    /// Give up on an unanswered outgoing call after this many seconds
    #[arg(long, env = "DUET_DIAL_TIMEOUT_SECS")]
    dial_timeout_secs: Option<u64>,

    /// Behave as if camera/microphone access was denied
    #[arg(long, default_value_t = false)]
    no_media: bool,

    /// STUN/TURN server for the WebRTC transport (repeatable)
    #[cfg(feature = "webrtc-transport")]
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[cfg(feature = "webrtc-transport")]
fn connector(args: &Args) -> Box<dyn PeerConnector> {
    use duet_client::peer::webrtc::WebRtcConnector;

    if args.ice_servers.is_empty() {
        Box::new(WebRtcConnector::default())
    } else {
        Box::new(WebRtcConnector::new(args.ice_servers.clone()))
    }
}

#[cfg(not(feature = "webrtc-transport"))]
fn connector(_args: &Args) -> Box<dyn PeerConnector> {
    Box::new(duet_client::LoopbackConnector::default())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    duet_common::init_tracing_with_default(&args.log_level);

    info!("Starting duet-client v{}", env!("CARGO_PKG_VERSION"));

    let auto_answer = args.auto_answer || env_bool("DUET_AUTO_ANSWER", false);

    let (registry, registry_events, _pump) = WsRegistry::connect(&args.relay_url).await?;

    let media: Box<dyn MediaSource> = if args.no_media {
        Box::new(SyntheticMedia::unavailable())
    } else {
        let label = if args.name.is_empty() {
            "local".to_string()
        } else {
            args.name.clone()
        };
        Box::new(SyntheticMedia::new(label))
    };
    let local_view = Arc::new(SinkSlot::new());
    let remote_view = Arc::new(SinkSlot::new());

    let config = CoordinatorConfig {
        display_name: args.name.clone(),
        dial_timeout: args.dial_timeout_secs.map(Duration::from_secs),
    };
    let (coordinator, peer_events) = CallCoordinator::new(
        config,
        Collaborators {
            registry: Box::new(registry),
            connector: connector(&args),
            media,
            local_sink: local_view.clone(),
            remote_sink: remote_view.clone(),
        },
    );
    let (handle, mut task) = spawn_coordinator(coordinator, peer_events, registry_events);

    let me = handle.wait_registered().await?;
    info!("registered as {}", me);
    println!("{me}");

    if let Some(target) = args.call.as_deref() {
        if let Err(e) = handle.place_call(target).await {
            error!("could not call {}: {}", target, e);
        }
    }

    tokio::spawn(watch_remote(remote_view.subscribe()));
    let mut states = handle.subscribe();

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = states.borrow_and_update().clone();
                on_state(&handle, &snapshot, auto_answer).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, hanging up");
                if let Err(e) = handle.end_call().await {
                    warn!("end call failed: {}", e);
                }
                break;
            }
            _ = &mut task => {
                warn!("call coordinator exited");
                return Ok(());
            }
        }
    }

    drop(handle);
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    Ok(())
}

async fn on_state(handle: &CallHandle, snapshot: &CallSnapshot, auto_answer: bool) {
    info!(
        "phase={} me={} accepted={} ended={}",
        snapshot.phase,
        snapshot.me.as_deref().unwrap_or("-"),
        snapshot.call_accepted,
        snapshot.call_ended
    );

    if snapshot.phase != CallPhase::Ringing {
        return;
    }
    let Some(call) = snapshot.call.as_ref() else {
        return;
    };
    let caller = if call.caller_display_name.is_empty() {
        call.from_session_id.as_str()
    } else {
        call.caller_display_name.as_str()
    };
    info!("{} is calling", caller);
    if auto_answer {
        if let Err(e) = handle.accept_call().await {
            error!("could not answer {}: {}", caller, e);
        }
    }
}

async fn watch_remote(mut remote: watch::Receiver<Option<MediaStream>>) {
    while remote.changed().await.is_ok() {
        match remote.borrow_and_update().as_ref() {
            Some(stream) => info!(
                "remote stream attached: {} ({} tracks)",
                stream.id,
                stream.tracks.len()
            ),
            None => info!("remote stream cleared"),
        }
    }
}
