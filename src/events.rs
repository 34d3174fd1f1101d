use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Marker, Operator, Role};
use crate::voice::focus::AudioRoute;
use crate::voice::TransmitMode;

/// Transport-agnostic events for the presentation layer.
/// Emitted by the session loop, consumed by the WebSocket API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum AppEvent {
    // Session lifecycle
    SessionStarted { session_id: Option<String>, role: Role, local_id: String },
    SessionEnded,
    ConnectionError { message: String },
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    // Group state
    RosterChanged { local: Operator, remote: Vec<Operator> },
    MarkersChanged { markers: Vec<Marker> },
    SilenceChanged { silenced: bool },
    // Voice
    TransmissionChanged { mode: TransmitMode, transmitting: bool },
    TransmissionBlocked { reason: String },
    AudioRouteChanged { route: AudioRoute },
    HardwareError { message: String },
}

pub type EventSender = broadcast::Sender<AppEvent>;
pub type EventReceiver = broadcast::Receiver<AppEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
