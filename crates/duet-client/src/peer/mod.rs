//! Peer channel: the direct media link established after signal exchange.
//!
//! A channel is opened in one role, emits its local signal exactly once,
//! accepts the remote signal in any order relative to that, and reports the
//! remote stream once both sides are known. Everything is reported through
//! a `PeerEventSender` tagged with the channel's id.

pub mod loopback;
#[cfg(feature = "webrtc-transport")]
pub mod webrtc;

use anyhow::Result;
use duet_common::SignalPayload;
use tokio::sync::mpsc;

use crate::media::MediaStream;
use crate::types::{ChannelId, PeerRole};

pub use loopback::{LoopbackConnector, LoopbackNetwork};

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// Local negotiation data to hand to the other side.
    Signal(SignalPayload),
    /// The remote party's media.
    Stream(MediaStream),
    /// Negotiation or transport failure.
    Error(String),
    /// The remote side went away.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub channel: ChannelId,
    pub kind: PeerEventKind,
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;
pub type PeerEventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

/// Emits events on behalf of one channel.
#[derive(Debug, Clone)]
pub struct PeerEmitter {
    channel: ChannelId,
    tx: PeerEventSender,
}

impl PeerEmitter {
    pub fn new(channel: ChannelId, tx: PeerEventSender) -> Self {
        Self { channel, tx }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Returns `false` once the coordinator has stopped listening.
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(PeerEvent {
                channel: self.channel,
                kind,
            })
            .is_ok()
    }
}

/// Live handle to one peer channel.
pub trait PeerChannel: Send {
    fn id(&self) -> ChannelId;

    /// Feed the remote party's signal.
    fn signal(&mut self, payload: SignalPayload) -> Result<()>;

    /// Release every resource held by the channel. Safe to call repeatedly.
    fn destroy(&mut self);

    fn is_destroyed(&self) -> bool;
}

/// Opens peer channels.
pub trait PeerConnector: Send {
    fn open(
        &mut self,
        role: PeerRole,
        stream: &MediaStream,
        events: PeerEmitter,
    ) -> Result<Box<dyn PeerChannel>>;
}
