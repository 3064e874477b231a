//! WebRTC peer transport.
//!
//! Each channel owns a task that drives an `RTCPeerConnection`. ICE
//! candidates are not trickled: the local description is emitted once
//! gathering has completed, so every signal is a complete SDP.
//!
//! The remote stream is reported when the connection reaches `Connected`,
//! described from the remote SDP. `on_track` only fires once RTP flows, so it
//! is kept as a fallback and whichever comes first wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use duet_common::SignalPayload;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{PeerChannel, PeerConnector, PeerEmitter, PeerEventKind};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::types::{ChannelId, PeerRole};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

enum Command {
    Remote(RTCSessionDescription),
    Close,
}

#[derive(Debug, Clone, Default)]
struct Transport {
    ice_servers: Vec<String>,
    include_loopback: bool,
}

pub struct WebRtcConnector {
    transport: Transport,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            transport: Transport {
                ice_servers,
                include_loopback: false,
            },
        }
    }

    /// Host candidates only, loopback included. Both ends must be on the
    /// same machine.
    pub fn local_only() -> Self {
        Self {
            transport: Transport {
                ice_servers: Vec::new(),
                include_loopback: true,
            },
        }
    }
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STUN_SERVER.to_string()])
    }
}

impl PeerConnector for WebRtcConnector {
    fn open(
        &mut self,
        role: PeerRole,
        stream: &MediaStream,
        events: PeerEmitter,
    ) -> Result<Box<dyn PeerChannel>> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        tokio::spawn(drive(
            role,
            self.transport.clone(),
            stream.clone(),
            events.clone(),
            closing.clone(),
            cmd_rx,
        ));
        Ok(Box::new(WebRtcChannel {
            emitter: events,
            commands: cmd_tx,
            closing,
            destroyed: false,
        }))
    }
}

pub struct WebRtcChannel {
    emitter: PeerEmitter,
    commands: mpsc::UnboundedSender<Command>,
    closing: Arc<AtomicBool>,
    destroyed: bool,
}

impl PeerChannel for WebRtcChannel {
    fn id(&self) -> ChannelId {
        self.emitter.channel()
    }

    fn signal(&mut self, payload: SignalPayload) -> Result<()> {
        if self.destroyed {
            return Err(anyhow!("channel {} already destroyed", self.id()));
        }
        let desc: RTCSessionDescription = serde_json::from_value(payload.into_value())
            .map_err(|e| anyhow!("malformed session description: {e}"))?;
        self.commands
            .send(Command::Remote(desc))
            .map_err(|_| anyhow!("channel {} task has exited", self.id()))
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.commands.send(Command::Close);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for WebRtcChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn drive(
    role: PeerRole,
    transport: Transport,
    local: MediaStream,
    emitter: PeerEmitter,
    closing: Arc<AtomicBool>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let channel = emitter.channel();
    let pc = match new_peer_connection(transport, &local, &emitter, closing.clone()).await {
        Ok(pc) => pc,
        Err(e) => {
            warn!("{}: failed to create peer connection: {}", channel, e);
            emitter.emit(PeerEventKind::Error(e.to_string()));
            return;
        }
    };

    if role == PeerRole::Initiator {
        if let Err(e) = send_offer(&pc, &emitter).await {
            report(&emitter, &closing, e);
        }
    }

    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Remote(desc) => {
                let result = match role {
                    PeerRole::Responder => send_answer(&pc, desc, &emitter).await,
                    PeerRole::Initiator => pc
                        .set_remote_description(desc)
                        .await
                        .map_err(anyhow::Error::from),
                };
                if let Err(e) = result {
                    report(&emitter, &closing, e);
                }
            }
            Command::Close => break,
        }
    }

    closing.store(true, Ordering::SeqCst);
    if let Err(e) = pc.close().await {
        debug!("{}: error closing peer connection: {}", channel, e);
    }
    debug!("{}: peer connection task finished", channel);
}

fn report(emitter: &PeerEmitter, closing: &AtomicBool, err: anyhow::Error) {
    if closing.load(Ordering::SeqCst) {
        return;
    }
    warn!("{}: negotiation failed: {}", emitter.channel(), err);
    emitter.emit(PeerEventKind::Error(err.to_string()));
}

async fn new_peer_connection(
    transport: Transport,
    local: &MediaStream,
    emitter: &PeerEmitter,
    closing: Arc<AtomicBool>,
) -> Result<Arc<RTCPeerConnection>> {
    let mut m = MediaEngine::default();
    m.register_default_codecs()?;
    let mut settings = SettingEngine::default();
    settings.set_include_loopback_candidate(transport.include_loopback);
    let api = APIBuilder::new()
        .with_media_engine(m)
        .with_setting_engine(settings)
        .build();

    let ice_servers = if transport.ice_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: transport.ice_servers,
            ..Default::default()
        }]
    };
    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    let pc = Arc::new(api.new_peer_connection(config).await?);

    for track in &local.tracks {
        let mime_type = match track.kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            local.id.clone(),
        ));
        pc.add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
    }

    // Set by whichever of `on_track` and the connected state fires first.
    let stream_seen = Arc::new(AtomicBool::new(false));

    let on_track_emitter = emitter.clone();
    let on_track_seen = stream_seen.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        if !on_track_seen.swap(true, Ordering::SeqCst) {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let remote = MediaStream {
                id: track.stream_id(),
                label: "remote".to_string(),
                tracks: vec![MediaTrack {
                    id: track.id(),
                    kind,
                }],
            };
            info!(
                "{}: remote track {} arrived",
                on_track_emitter.channel(),
                remote.id
            );
            on_track_emitter.emit(PeerEventKind::Stream(remote));
        }
        Box::pin(async {})
    }));

    let state_emitter = emitter.clone();
    let ended = Arc::new(AtomicBool::new(false));
    let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(&pc);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!("{}: peer connection state {}", state_emitter.channel(), state);
        let emitter = state_emitter.clone();
        let closing = closing.clone();
        let ended = ended.clone();
        let seen = stream_seen.clone();
        let pc = weak_pc.clone();
        Box::pin(async move {
            if closing.load(Ordering::SeqCst) {
                return;
            }
            let kind = match state {
                RTCPeerConnectionState::Connected => {
                    let Some(pc) = pc.upgrade() else {
                        return;
                    };
                    let remote = pc.remote_description().await;
                    let Some(remote) = remote.as_ref().and_then(remote_stream) else {
                        return;
                    };
                    if !seen.swap(true, Ordering::SeqCst) {
                        info!("{}: connected to remote stream {}", emitter.channel(), remote.id);
                        emitter.emit(PeerEventKind::Stream(remote));
                    }
                    return;
                }
                RTCPeerConnectionState::Failed => {
                    PeerEventKind::Error("peer connection failed".into())
                }
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                    PeerEventKind::Closed
                }
                _ => return,
            };
            if !ended.swap(true, Ordering::SeqCst) {
                emitter.emit(kind);
            }
        })
    }));

    Ok(pc)
}

/// The stream the remote side announced, read from the `msid` attributes of
/// its sending media sections.
fn remote_stream(desc: &RTCSessionDescription) -> Option<MediaStream> {
    let parsed = match desc.unmarshal() {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("unreadable remote description: {}", e);
            return None;
        }
    };

    let mut stream_id = None;
    let mut tracks = Vec::new();
    for media in &parsed.media_descriptions {
        let kind = match media.media_name.media.as_str() {
            "audio" => TrackKind::Audio,
            "video" => TrackKind::Video,
            _ => continue,
        };
        let msid = media.attributes.iter().find_map(|a| match &a.value {
            Some(value) if a.key == "msid" => Some(value.as_str()),
            None => a.key.strip_prefix("msid:"),
            _ => None,
        });
        let Some((stream, track)) = msid.and_then(|v| v.split_once(' ')) else {
            continue;
        };
        stream_id.get_or_insert_with(|| stream.to_string());
        tracks.push(MediaTrack {
            id: track.to_string(),
            kind,
        });
    }

    Some(MediaStream {
        id: stream_id?,
        label: "remote".to_string(),
        tracks,
    })
}

async fn send_offer(pc: &RTCPeerConnection, emitter: &PeerEmitter) -> Result<()> {
    let offer = pc.create_offer(None).await?;
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await?;
    let _ = gathered.recv().await;
    emit_local(pc, emitter).await
}

async fn send_answer(
    pc: &RTCPeerConnection,
    offer: RTCSessionDescription,
    emitter: &PeerEmitter,
) -> Result<()> {
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gathered.recv().await;
    emit_local(pc, emitter).await
}

async fn emit_local(pc: &RTCPeerConnection, emitter: &PeerEmitter) -> Result<()> {
    let desc = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("no local description after negotiation"))?;
    let payload = SignalPayload::new(serde_json::to_value(desc)?);
    emitter.emit(PeerEventKind::Signal(payload));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerEvent, PeerEventReceiver};
    use std::time::Duration;
    use tokio::time::timeout;

    const NEGOTIATION: Duration = Duration::from_secs(20);

    const TWO_TRACK_OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=msid:cam-1 cam-1-audio\r\n\
a=sendrecv\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=msid:cam-1 cam-1-video\r\n\
a=sendrecv\r\n\
a=rtpmap:96 VP8/90000\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:2\r\n";

    #[test]
    fn test_remote_stream_read_from_msid() {
        let desc = RTCSessionDescription::offer(TWO_TRACK_OFFER.to_string()).unwrap();
        let remote = remote_stream(&desc).unwrap();
        assert_eq!(remote.id, "cam-1");
        assert_eq!(
            remote.tracks,
            vec![
                MediaTrack {
                    id: "cam-1-audio".into(),
                    kind: TrackKind::Audio,
                },
                MediaTrack {
                    id: "cam-1-video".into(),
                    kind: TrackKind::Video,
                },
            ]
        );
    }

    #[test]
    fn test_remote_stream_absent_without_msid() {
        let sdp = TWO_TRACK_OFFER
            .lines()
            .filter(|l| !l.starts_with("a=msid"))
            .map(|l| format!("{l}\r\n"))
            .collect::<String>();
        let desc = RTCSessionDescription::offer(sdp).unwrap();
        assert!(remote_stream(&desc).is_none());
    }

    struct Side {
        channel: Box<dyn PeerChannel>,
        local: MediaStream,
        remote: Option<MediaStream>,
    }

    fn open(role: PeerRole, id: u64, label: &str, tx: &crate::peer::PeerEventSender) -> Side {
        let local = MediaStream::audio_video(label);
        let channel = WebRtcConnector::local_only()
            .open(role, &local, PeerEmitter::new(ChannelId(id), tx.clone()))
            .unwrap();
        Side {
            channel,
            local,
            remote: None,
        }
    }

    async fn negotiate(caller: &mut Side, callee: &mut Side, rx: &mut PeerEventReceiver) {
        while caller.remote.is_none() || callee.remote.is_none() {
            let PeerEvent { channel, kind } = rx.recv().await.unwrap();
            let (this, other) = if channel == caller.channel.id() {
                (&mut *caller, &mut *callee)
            } else {
                (&mut *callee, &mut *caller)
            };
            match kind {
                PeerEventKind::Signal(signal) => other.channel.signal(signal).unwrap(),
                PeerEventKind::Stream(stream) => {
                    assert!(this.remote.is_none(), "stream reported twice on {channel}");
                    this.remote = Some(stream);
                }
                unexpected => panic!("unexpected event on {channel}: {unexpected:?}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_in_process_channels_exchange_streams() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut caller = open(PeerRole::Initiator, 1, "caller", &tx);
        let mut callee = open(PeerRole::Responder, 2, "callee", &tx);

        timeout(NEGOTIATION, negotiate(&mut caller, &mut callee, &mut rx))
            .await
            .expect("peer connections did not come up");

        for (side, other) in [(&caller, &callee), (&callee, &caller)] {
            let remote = side.remote.as_ref().unwrap();
            assert_eq!(remote.id, other.local.id);
            assert!(remote.has_kind(TrackKind::Audio));
            assert!(remote.has_kind(TrackKind::Video));
            for track in &remote.tracks {
                assert!(other.local.tracks.iter().any(|t| t.id == track.id));
            }
        }

        caller.channel.destroy();
        caller.channel.destroy();
        assert!(caller.channel.is_destroyed());
        let late = SignalPayload::new(serde_json::json!({"type": "answer", "sdp": ""}));
        assert!(caller.channel.signal(late).is_err());
        callee.channel.destroy();
        assert!(callee.channel.is_destroyed());
    }
}
