//! Call coordinator: the call lifecycle state machine.
//!
//! The coordinator does no I/O of its own. Registry and peer events are fed
//! in through `handle_registry_event` / `handle_peer_event`; outbound
//! traffic goes through the injected `SessionRegistry`. `runtime` wraps it in
//! a task for real use.
//!
//! Phases:
//! - IDLE: registered (or registering), no call
//! - RINGING: incoming call waiting for `accept_call`
//! - DIALING: outgoing call waiting for the callee's answer
//! - CONNECTED: both signals exchanged
//! - ENDED: torn down, waiting for a fresh session id from the relay

use std::sync::Arc;
use std::time::{Duration, Instant};

use duet_common::helpers::is_valid_session_id;
use duet_common::{ClientMessage, SessionId, SignalPayload};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::media::{DisplaySink, MediaSource, MediaStream};
use crate::peer::{
    PeerChannel, PeerConnector, PeerEmitter, PeerEvent, PeerEventKind, PeerEventReceiver,
    PeerEventSender,
};
use crate::signaling::{RegistryEvent, SessionRegistry};
use crate::types::{CallPhase, CallRecord, CallSnapshot, ChannelId, CoordinatorConfig, PeerRole};

/// Everything the coordinator talks to.
pub struct Collaborators {
    pub registry: Box<dyn SessionRegistry>,
    pub connector: Box<dyn PeerConnector>,
    pub media: Box<dyn MediaSource>,
    pub local_sink: Arc<dyn DisplaySink>,
    pub remote_sink: Arc<dyn DisplaySink>,
}

/// The live peer channel and what it is for.
struct ActiveChannel {
    handle: Box<dyn PeerChannel>,
    role: PeerRole,
    /// Session on the other end of the call.
    remote: SessionId,
    /// Our session id when the channel was opened.
    local: SessionId,
    signal_sent: bool,
}

impl ActiveChannel {
    fn id(&self) -> ChannelId {
        self.handle.id()
    }
}

pub struct CallCoordinator {
    config: CoordinatorConfig,
    registry: Box<dyn SessionRegistry>,
    connector: Box<dyn PeerConnector>,
    media: Box<dyn MediaSource>,
    local_sink: Arc<dyn DisplaySink>,
    remote_sink: Arc<dyn DisplaySink>,
    peer_events: PeerEventSender,

    local_stream: Option<MediaStream>,
    me: Option<SessionId>,
    name: String,
    phase: CallPhase,
    call: Option<CallRecord>,
    channel: Option<ActiveChannel>,
    call_accepted: bool,
    call_ended: bool,
    remote_attached: bool,
    dialing_since: Option<Instant>,
    next_channel: u64,
}

impl CallCoordinator {
    /// Builds a coordinator. Peer channels it opens report through the
    /// returned receiver, which the caller must feed back into
    /// `handle_peer_event`.
    pub fn new(config: CoordinatorConfig, parts: Collaborators) -> (Self, PeerEventReceiver) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let name = config.display_name.clone();
        let coordinator = Self {
            config,
            registry: parts.registry,
            connector: parts.connector,
            media: parts.media,
            local_sink: parts.local_sink,
            remote_sink: parts.remote_sink,
            peer_events: peer_tx,
            local_stream: None,
            me: None,
            name,
            phase: CallPhase::Idle,
            call: None,
            channel: None,
            call_accepted: false,
            call_ended: false,
            remote_attached: false,
            dialing_since: None,
            next_channel: 0,
        };
        (coordinator, peer_rx)
    }

    /// Acquires local media and registers with the relay.
    ///
    /// A media failure is not an error here; calls will fail with
    /// `MediaUnavailable` instead.
    pub fn start(&mut self) -> Result<(), CallError> {
        self.acquire_media();
        self.registry.register()
    }

    fn acquire_media(&mut self) {
        match self.media.acquire() {
            Ok(stream) => {
                info!(
                    "local media ready: {} ({} tracks)",
                    stream.label,
                    stream.tracks.len()
                );
                self.local_sink.attach(stream.clone());
                self.local_stream = Some(stream);
            }
            Err(e) => {
                warn!("local media unavailable: {:#}", e);
                self.local_sink.clear();
                self.local_stream = None;
            }
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn me(&self) -> Option<&str> {
        self.me.as_deref()
    }

    pub fn call(&self) -> Option<&CallRecord> {
        self.call.as_ref()
    }

    pub fn call_accepted(&self) -> bool {
        self.call_accepted
    }

    pub fn call_ended(&self) -> bool {
        self.call_ended
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn has_live_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            phase: self.phase,
            call: self.call.clone(),
            call_accepted: self.call_accepted,
            call_ended: self.call_ended,
            me: self.me.clone(),
            name: self.name.clone(),
            media_available: self.local_stream.is_some(),
            remote_stream_attached: self.remote_attached,
        }
    }

    /// When an unanswered outgoing call should give up, if a dial timeout is
    /// configured.
    pub fn dial_deadline(&self) -> Option<Instant> {
        match (self.phase, self.config.dial_timeout, self.dialing_since) {
            (CallPhase::Dialing, Some(timeout), Some(since)) => Some(since + timeout),
            _ => None,
        }
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        self.config.dial_timeout
    }

    fn open_channel(
        &mut self,
        role: PeerRole,
        remote: SessionId,
        local: SessionId,
    ) -> Result<(), CallError> {
        let stream = self
            .local_stream
            .as_ref()
            .ok_or(CallError::MediaUnavailable)?;
        self.next_channel += 1;
        let id = ChannelId(self.next_channel);
        let emitter = PeerEmitter::new(id, self.peer_events.clone());
        let handle = self
            .connector
            .open(role, stream, emitter)
            .map_err(CallError::peer)?;
        info!("opened {} channel {} with {}", role, id, remote);
        self.channel = Some(ActiveChannel {
            handle,
            role,
            remote,
            local,
            signal_sent: false,
        });
        Ok(())
    }

    /// Ring `target`. Returns once the initiator channel exists; the offer
    /// goes out when the channel produces it.
    pub fn place_call(&mut self, target: &str) -> Result<(), CallError> {
        if self.local_stream.is_none() {
            return Err(CallError::MediaUnavailable);
        }
        if self.phase != CallPhase::Idle {
            return Err(CallError::InvalidPhase {
                op: "place a call",
                phase: self.phase,
            });
        }
        if self.channel.is_some() {
            return Err(CallError::CallInProgress);
        }
        let me = self.me.clone().ok_or(CallError::NotRegistered)?;
        if !is_valid_session_id(target) {
            return Err(CallError::InvalidTarget(target.to_string()));
        }

        self.open_channel(PeerRole::Initiator, target.to_string(), me.clone())?;
        self.call = Some(CallRecord {
            receiving: false,
            from_session_id: me,
            caller_display_name: self.name.clone(),
            incoming_signal: None,
        });
        self.call_accepted = false;
        self.call_ended = false;
        self.dialing_since = Some(Instant::now());
        self.transition(CallPhase::Dialing);
        Ok(())
    }

    /// Answer the ringing call.
    pub fn accept_call(&mut self) -> Result<(), CallError> {
        if self.local_stream.is_none() {
            return Err(CallError::MediaUnavailable);
        }
        if self.phase != CallPhase::Ringing {
            return Err(CallError::InvalidPhase {
                op: "accept a call",
                phase: self.phase,
            });
        }
        if self.channel.is_some() {
            return Err(CallError::CallInProgress);
        }
        let (caller, offer) = match &self.call {
            Some(CallRecord {
                receiving: true,
                from_session_id,
                incoming_signal: Some(signal),
                ..
            }) if !signal.is_empty() => (from_session_id.clone(), signal.clone()),
            _ => return Err(CallError::MissingSignal),
        };
        let me = self.me.clone().ok_or(CallError::NotRegistered)?;

        self.open_channel(PeerRole::Responder, caller, me)?;
        self.call_accepted = true;
        self.transition(CallPhase::Connected);

        if let Err(e) = self.feed_remote_signal(offer) {
            self.end_call();
            return Err(e);
        }
        Ok(())
    }

    /// Forget a ringing call without answering. Nothing is sent to the
    /// caller, who keeps dialing.
    pub fn dismiss_call(&mut self) -> Result<(), CallError> {
        if self.phase != CallPhase::Ringing {
            return Err(CallError::InvalidPhase {
                op: "dismiss a call",
                phase: self.phase,
            });
        }
        self.call = None;
        self.transition(CallPhase::Idle);
        Ok(())
    }

    /// Hang up and start over with a fresh session id.
    ///
    /// Returns `false` when there was nothing to end.
    pub fn end_call(&mut self) -> bool {
        let nothing_to_end = matches!(self.phase, CallPhase::Idle | CallPhase::Ended)
            && self.channel.is_none()
            && self.call.is_none();
        if nothing_to_end {
            debug!("end_call ignored while {}", self.phase);
            return false;
        }

        info!("ending call ({})", self.phase);
        self.call_ended = true;
        self.transition(CallPhase::Ended);
        self.reset();
        true
    }

    /// Drop all call state, re-acquire local media and ask the relay for a
    /// new session id. The coordinator returns to `Idle` once the new id
    /// arrives.
    pub fn reset(&mut self) {
        self.destroy_channel();
        self.call = None;
        self.call_accepted = false;
        self.remote_attached = false;
        self.dialing_since = None;
        self.remote_sink.clear();
        self.me = None;
        if self.phase != CallPhase::Ended {
            self.transition(CallPhase::Idle);
        }

        self.acquire_media();
        if let Err(e) = self.registry.register() {
            warn!("re-registration failed: {}", e);
        }
    }

    fn destroy_channel(&mut self) {
        if let Some(mut active) = self.channel.take() {
            info!("destroying channel {}", active.id());
            active.handle.destroy();
        }
    }

    fn transition(&mut self, next: CallPhase) {
        if self.phase != next {
            info!("call phase {} -> {}", self.phase, next);
            self.phase = next;
        }
    }

    fn feed_remote_signal(&mut self, signal: SignalPayload) -> Result<(), CallError> {
        let Some(active) = self.channel.as_mut() else {
            return Err(CallError::peer("no live channel"));
        };
        active.handle.signal(signal).map_err(|e| {
            warn!("channel {} rejected remote signal: {:#}", active.id(), e);
            CallError::peer(e)
        })
    }

    pub fn handle_registry_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::SessionAssigned(id) => {
                info!("relay assigned session id {}", id);
                self.me = Some(id);
                if self.phase == CallPhase::Ended {
                    self.call_ended = false;
                    self.transition(CallPhase::Idle);
                }
            }
            RegistryEvent::InboundCall { from, name, signal } => {
                self.on_inbound_call(from, name, signal);
            }
            RegistryEvent::CallAccepted { signal, from } => {
                self.on_call_accepted(signal, from);
            }
            RegistryEvent::Rejected(message) => {
                warn!("relay rejected a message: {}", message);
            }
            RegistryEvent::Disconnected(reason) => {
                warn!("relay connection lost: {}", reason);
                self.me = None;
            }
        }
    }

    fn on_inbound_call(&mut self, from: SessionId, name: String, signal: SignalPayload) {
        let record = CallRecord {
            receiving: true,
            from_session_id: from,
            caller_display_name: name,
            incoming_signal: Some(signal),
        };
        match self.phase {
            CallPhase::Idle | CallPhase::Ringing => {
                info!(
                    "incoming call from {} ({})",
                    record.from_session_id, record.caller_display_name
                );
                self.call = Some(record);
                self.transition(CallPhase::Ringing);
            }
            CallPhase::Connected => {
                warn!(
                    "incoming call from {} while connected; replacing pending record",
                    record.from_session_id
                );
                self.call = Some(record);
            }
            CallPhase::Dialing | CallPhase::Ended => {
                debug!(
                    "ignoring incoming call from {} while {}",
                    record.from_session_id, self.phase
                );
            }
        }
    }

    fn on_call_accepted(&mut self, signal: SignalPayload, from: Option<SessionId>) {
        let keyed_to_us = match &self.channel {
            Some(active) if self.phase == CallPhase::Dialing => {
                active.role == PeerRole::Initiator
                    && from.as_deref().map_or(true, |f| f == active.remote)
            }
            _ => false,
        };
        if !keyed_to_us {
            debug!(
                "ignoring call-accepted from {:?} while {}",
                from, self.phase
            );
            return;
        }

        if self.feed_remote_signal(signal).is_err() {
            self.end_call();
            return;
        }
        self.call_accepted = true;
        self.dialing_since = None;
        self.transition(CallPhase::Connected);
    }

    pub fn handle_peer_event(&mut self, event: PeerEvent) {
        let live = self.channel.as_ref().map(ActiveChannel::id);
        if live != Some(event.channel) {
            debug!("dropping event from stale channel {}", event.channel);
            return;
        }

        match event.kind {
            PeerEventKind::Signal(signal) => self.on_local_signal(signal),
            PeerEventKind::Stream(stream) => {
                info!("remote stream {} attached", stream.id);
                self.remote_sink.attach(stream);
                self.remote_attached = true;
            }
            PeerEventKind::Error(message) => {
                warn!("channel {} failed: {}", event.channel, message);
                self.end_call();
            }
            PeerEventKind::Closed => {
                info!("remote side closed channel {}", event.channel);
                self.end_call();
            }
        }
    }

    fn on_local_signal(&mut self, signal: SignalPayload) {
        let Some(active) = self.channel.as_mut() else {
            return;
        };
        if active.signal_sent {
            debug!("channel {} signalled again; already sent", active.id());
            return;
        }
        active.signal_sent = true;

        let msg = match active.role {
            PeerRole::Initiator => ClientMessage::CallUser {
                target_session_id: active.remote.clone(),
                signal,
                from: active.local.clone(),
                display_name: self.name.clone(),
            },
            PeerRole::Responder => ClientMessage::AnswerCall {
                signal,
                target_session_id: active.remote.clone(),
            },
        };
        info!("sending {} to {}", msg, active.remote);
        if let Err(e) = self.registry.send(msg) {
            warn!("failed to hand signal to relay: {}", e);
        }
    }

    /// Ends the call if the dial timeout has passed. Returns `true` if it
    /// did.
    pub fn check_dial_timeout(&mut self, now: Instant) -> bool {
        match self.dial_deadline() {
            Some(deadline) if now >= deadline => {
                info!("no answer within {:?}; giving up", self.dial_timeout());
                self.end_call()
            }
            _ => false,
        }
    }

    /// Tear down the live channel without re-registering; used when the
    /// coordinator stops. A call in progress is left `Ended`.
    pub fn shutdown(&mut self) {
        let had_call = self.channel.is_some() || self.call.is_some();
        self.destroy_channel();
        self.call = None;
        self.call_accepted = false;
        self.remote_attached = false;
        self.dialing_since = None;
        self.remote_sink.clear();
        if had_call {
            self.call_ended = true;
            self.transition(CallPhase::Ended);
        }
    }
}
