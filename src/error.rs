//! Error types for the session core.

use thiserror::Error;

/// Top-level error surfaced to callers of the session loop.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Refused: {0}")]
    Policy(#[from] PolicyError),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Session loop unavailable")]
    Unavailable,
}

/// Establishing or keeping a link to the host failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("malformed session id: {0}")]
    MalformedSessionId(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("timed out waiting for the host channel to open")]
    JoinTimedOut,

    #[error("failed to open listening identity: {0}")]
    ListenFailed(String),

    #[error("peer connection failed: {0}")]
    PeerConnection(String),
}

/// An inbound message could not be understood. Always dropped, never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("{kind} not accepted from {peer_id}")]
    UnexpectedSender { kind: &'static str, peer_id: String },

    #[error("{kind} references unknown marker {id}")]
    UnknownMarker { kind: &'static str, id: String },
}

/// The action was refused by role or silence policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("transmission blocked by radio silence")]
    BlockedBySilence,

    #[error("only the host may do this")]
    HostOnly,

    #[error("marker {0} belongs to another operator")]
    NotMarkerOwner(String),

    #[error("unknown marker {0}")]
    UnknownMarker(String),

    #[error("no active session")]
    NoSession,

    #[error("a session is already active")]
    SessionActive,
}

/// Microphone or audio focus could not be acquired.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("no audio focus")]
    NoAudioFocus,

    #[error("no input device available")]
    NoInputDevice,

    #[error("audio device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
