pub mod bootstrap;
pub mod runtime;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::SessionError;
use crate::models::{Marker, MarkerPosition, Operator, OperatorStatus, Position, Role};
use crate::voice::focus::{AudioRoute, HardwareEvent};
use crate::voice::TransmitMode;

pub use runtime::{run_session, HardwareFactory, SessionRuntime};

pub type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Commands sent into the session loop from the API and the CLI.
/// The loop is the only owner of session state; every mutation goes here.
#[derive(Debug)]
pub enum SessionCommand {
    StartHost {
        callsign: String,
        reply: Reply<String>,
    },
    /// Completes once the channel to the host is open, or fails.
    Join {
        callsign: String,
        session_id: String,
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
    SetStatus {
        status: OperatorStatus,
        reply: Reply<()>,
    },
    SetPosition {
        position: Position,
        reply: Reply<()>,
    },
    SetBattery {
        percent: u8,
        reply: Reply<()>,
    },
    CreateMarker {
        position: MarkerPosition,
        label: String,
        reply: Reply<Marker>,
    },
    MoveMarker {
        id: String,
        position: MarkerPosition,
        reply: Reply<()>,
    },
    DeleteMarker {
        id: String,
        reply: Reply<()>,
    },
    SetSilence {
        silenced: bool,
        reply: Reply<()>,
    },
    HoldTalk {
        reply: Reply<TransmitState>,
    },
    ReleaseTalk {
        reply: Reply<TransmitState>,
    },
    ToggleMode {
        reply: Reply<TransmitState>,
    },
    /// Platform audio notification. Fire and forget.
    Hardware(HardwareEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct TransmitState {
    pub mode: TransmitMode,
    pub transmitting: bool,
}

/// Read-only view of the session, republished after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct SessionSnapshot {
    pub active: bool,
    pub role: Option<Role>,
    pub session_id: Option<String>,
    /// True once the link to the host (or to at least one operator) is up.
    pub connected: bool,
    pub local: Option<Operator>,
    pub remote: Vec<Operator>,
    pub markers: Vec<Marker>,
    pub silenced: bool,
    pub transmit: TransmitState,
    pub route: Option<AudioRoute>,
    pub audio_available: bool,
}

/// How the process should enter a session at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum Bootstrap {
    Host { callsign: String },
    Join { callsign: String, session_id: String },
}
