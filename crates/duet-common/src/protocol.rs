//! Relay wire protocol.
//!
//! Messages travel as JSON text frames, internally tagged by `"type"` with
//! camelCase field names. Each direction has its own enum so a client can
//! never be handed a message only the relay may send.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque address the relay assigns to a connected client.
pub type SessionId = String;

/// Largest signal payload (serialized) the relay forwards.
pub const MAX_SIGNAL_BYTES: usize = 32 * 1024;

/// Opaque negotiation data produced and consumed by the peer transport.
///
/// The relay and the call coordinator carry it verbatim; only the transport
/// that produced it knows how to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(serde_json::Value);

impl SignalPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    /// `null`, `""`, `{}` and `[]` count as empty.
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.is_empty(),
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::Array(items) => items.is_empty(),
            _ => false,
        }
    }

    /// Serialized size, used for relay limits.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_string(&self.0).map(|s| s.len()).unwrap_or(0)
    }
}

impl From<serde_json::Value> for SignalPayload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Ask for a session identifier. Sending it again rebinds the
    /// connection to a fresh identifier.
    Register,

    /// Ring `target_session_id` with the caller's offer.
    CallUser {
        target_session_id: SessionId,
        signal: SignalPayload,
        from: SessionId,
        display_name: String,
    },

    /// Return the callee's answer to the caller.
    AnswerCall {
        signal: SignalPayload,
        target_session_id: SessionId,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::CallUser { .. } => "callUser",
            Self::AnswerCall { .. } => "answerCall",
        }
    }
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// Session identifier assigned to this connection.
    Me { id: SessionId },

    /// Someone is calling.
    CallUser {
        from: SessionId,
        name: String,
        signal: SignalPayload,
    },

    /// The callee answered. `from` names the answering session when the
    /// relay knows it.
    CallAccepted {
        signal: SignalPayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<SessionId>,
    },

    /// The relay rejected something this client sent.
    Error { message: String },
}

impl RelayMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Me { .. } => "me",
            Self::CallUser { .. } => "callUser",
            Self::CallAccepted { .. } => "callAccepted",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

impl fmt::Display for RelayMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}
