//! In-process peer transport.
//!
//! Signals carry a link token and a description of the sender's stream, so
//! two channels that exchange them "connect" without any sockets. Channels
//! opened from the same `LoopbackNetwork` also learn when their partner is
//! destroyed; across processes that notification is simply absent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use duet_common::SignalPayload;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{PeerChannel, PeerConnector, PeerEmitter, PeerEventKind};
use crate::media::MediaStream;
use crate::types::{ChannelId, PeerRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SignalKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopbackSignal {
    #[serde(rename = "type")]
    kind: SignalKind,
    link: String,
    stream: MediaStream,
}

impl LoopbackSignal {
    fn into_payload(self) -> Result<SignalPayload> {
        Ok(SignalPayload::new(serde_json::to_value(self)?))
    }

    fn from_payload(payload: SignalPayload) -> Result<Self> {
        serde_json::from_value(payload.into_value())
            .map_err(|e| anyhow!("malformed loopback signal: {e}"))
    }
}

#[derive(Default)]
struct Link {
    initiator: Option<PeerEmitter>,
    responder: Option<PeerEmitter>,
}

impl Link {
    fn slot(&mut self, role: PeerRole) -> &mut Option<PeerEmitter> {
        match role {
            PeerRole::Initiator => &mut self.initiator,
            PeerRole::Responder => &mut self.responder,
        }
    }

    fn is_empty(&self) -> bool {
        self.initiator.is_none() && self.responder.is_none()
    }
}

/// Shared table of loopback links.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    links: Arc<Mutex<HashMap<String, Link>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Link>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn join(&self, link: &str, role: PeerRole, emitter: PeerEmitter) {
        let mut links = self.lock();
        *links.entry(link.to_string()).or_default().slot(role) = Some(emitter);
    }

    /// Removes `role` from the link and returns the partner still on it.
    fn leave(&self, link: &str, role: PeerRole) -> Option<PeerEmitter> {
        let mut links = self.lock();
        let entry = links.get_mut(link)?;
        entry.slot(role).take();
        let partner = match role {
            PeerRole::Initiator => entry.responder.clone(),
            PeerRole::Responder => entry.initiator.clone(),
        };
        if entry.is_empty() {
            links.remove(link);
        }
        partner
    }

    /// Number of links with at least one live end.
    pub fn active_links(&self) -> usize {
        self.lock().len()
    }
}

pub struct LoopbackConnector {
    network: LoopbackNetwork,
}

impl LoopbackConnector {
    pub fn new(network: LoopbackNetwork) -> Self {
        Self { network }
    }
}

impl Default for LoopbackConnector {
    fn default() -> Self {
        Self::new(LoopbackNetwork::new())
    }
}

impl PeerConnector for LoopbackConnector {
    fn open(
        &mut self,
        role: PeerRole,
        stream: &MediaStream,
        events: PeerEmitter,
    ) -> Result<Box<dyn PeerChannel>> {
        let mut channel = LoopbackChannel {
            role,
            emitter: events,
            network: self.network.clone(),
            local_stream: stream.clone(),
            link: None,
            local_sent: false,
            remote: None,
            stream_emitted: false,
            destroyed: false,
        };
        if role == PeerRole::Initiator {
            let link = Uuid::new_v4().to_string();
            channel.send_local(SignalKind::Offer, link)?;
        }
        Ok(Box::new(channel))
    }
}

pub struct LoopbackChannel {
    role: PeerRole,
    emitter: PeerEmitter,
    network: LoopbackNetwork,
    local_stream: MediaStream,
    link: Option<String>,
    local_sent: bool,
    remote: Option<MediaStream>,
    stream_emitted: bool,
    destroyed: bool,
}

impl LoopbackChannel {
    fn send_local(&mut self, kind: SignalKind, link: String) -> Result<()> {
        self.network.join(&link, self.role, self.emitter.clone());
        let payload = LoopbackSignal {
            kind,
            link: link.clone(),
            stream: self.local_stream.clone(),
        }
        .into_payload()?;
        self.link = Some(link);
        self.local_sent = true;
        self.emitter.emit(PeerEventKind::Signal(payload));
        Ok(())
    }

    fn maybe_emit_stream(&mut self) {
        if self.stream_emitted || !self.local_sent {
            return;
        }
        if let Some(remote) = self.remote.clone() {
            self.stream_emitted = true;
            self.emitter.emit(PeerEventKind::Stream(remote));
        }
    }
}

impl PeerChannel for LoopbackChannel {
    fn id(&self) -> ChannelId {
        self.emitter.channel()
    }

    fn signal(&mut self, payload: SignalPayload) -> Result<()> {
        if self.destroyed {
            bail!("channel {} already destroyed", self.id());
        }
        if self.remote.is_some() {
            bail!("channel {} already has a remote signal", self.id());
        }

        let signal = LoopbackSignal::from_payload(payload)?;
        match (self.role, signal.kind) {
            (PeerRole::Responder, SignalKind::Offer) => {
                self.remote = Some(signal.stream);
                self.send_local(SignalKind::Answer, signal.link)?;
            }
            (PeerRole::Initiator, SignalKind::Answer) => {
                if self.link.as_deref() != Some(signal.link.as_str()) {
                    bail!("answer belongs to link {}, not ours", signal.link);
                }
                self.remote = Some(signal.stream);
            }
            (role, kind) => bail!("{role} cannot apply a {kind:?} signal"),
        }

        self.maybe_emit_stream();
        Ok(())
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        debug!("destroying loopback channel {}", self.id());
        if let Some(link) = self.link.take() {
            if let Some(partner) = self.network.leave(&link, self.role) {
                partner.emit(PeerEventKind::Closed);
            }
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.destroy();
    }
}
