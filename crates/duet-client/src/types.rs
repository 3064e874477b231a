use std::fmt;
use std::time::Duration;

use duet_common::{SessionId, SignalPayload};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Name announced to the callee on outgoing calls.
    pub display_name: String,
    /// End an unanswered outgoing call after this long. `None` waits forever.
    pub dial_timeout: Option<Duration>,
}

/// Lifecycle phase of the (single) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallPhase {
    Idle,
    /// Incoming call waiting for `accept_call`.
    Ringing,
    /// Outgoing call waiting for the callee's answer.
    Dialing,
    Connected,
    /// Torn down, waiting for the relay to assign a fresh session id.
    Ended,
}

impl CallPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ringing => "ringing",
            Self::Dialing => "dialing",
            Self::Connected => "connected",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pending or in-progress call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// `true` for an incoming call, `false` for one we placed.
    pub receiving: bool,
    pub from_session_id: SessionId,
    pub caller_display_name: String,
    pub incoming_signal: Option<SignalPayload>,
}

/// Which side of the negotiation a peer channel plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    Initiator,
    Responder,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Responder => write!(f, "responder"),
        }
    }
}

/// Identifies one peer channel instance so events from a destroyed channel
/// can be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Read-only view of coordinator state for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub call: Option<CallRecord>,
    pub call_accepted: bool,
    pub call_ended: bool,
    pub me: Option<SessionId>,
    pub name: String,
    pub media_available: bool,
    pub remote_stream_attached: bool,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            call: None,
            call_accepted: false,
            call_ended: false,
            me: None,
            name: String::new(),
            media_available: false,
            remote_stream_attached: false,
        }
    }
}
