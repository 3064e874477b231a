use thiserror::Error;

use crate::types::CallPhase;

/// Why a call operation was refused or failed.
#[derive(Debug, Error)]
pub enum CallError {
    /// No local stream; media acquisition failed at startup or reset.
    #[error("local media is unavailable")]
    MediaUnavailable,

    /// The relay has not assigned us a session id yet.
    #[error("not registered with the relay")]
    NotRegistered,

    #[error("cannot {op} while {phase}")]
    InvalidPhase { op: &'static str, phase: CallPhase },

    /// A peer channel is still alive.
    #[error("a call is already in progress")]
    CallInProgress,

    /// The pending call carries no offer to answer.
    #[error("incoming call has no signal to answer")]
    MissingSignal,

    #[error("invalid target session id: {0:?}")]
    InvalidTarget(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("peer channel error: {0}")]
    Peer(String),

    /// The coordinator task has stopped.
    #[error("call coordinator is not running")]
    CoordinatorClosed,
}

impl CallError {
    pub fn registry(msg: impl std::fmt::Display) -> Self {
        Self::Registry(msg.to_string())
    }

    pub fn peer(msg: impl std::fmt::Display) -> Self {
        Self::Peer(msg.to_string())
    }
}
