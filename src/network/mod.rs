pub mod behaviour;
pub mod swarm;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ConnectionError;
use crate::session::bootstrap::SessionId;

/// Gossipsub topic carrying WebRTC signaling for one session.
pub fn session_topic(host_peer_id: &str) -> String {
    format!("squadlink/session/{}/signal", host_peer_id)
}

/// Commands sent from the session loop to the swarm event loop
#[derive(Debug)]
pub enum NetworkCommand {
    /// Open the listening identity and report it as a session id.
    Host {
        reply: oneshot::Sender<Result<SessionId, ConnectionError>>,
    },
    /// Dial the host named by the session id.
    Join {
        session_id: SessionId,
    },
    SendSignal {
        to_peer_id: String,
        signal: Signal,
    },
    Leave,
}

/// Events from the swarm event loop to the session loop
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// The host is connected and listening on the session topic.
    HostReachable { host_peer_id: String },
    HostUnreachable { reason: String },
    Signal { from_peer_id: String, signal: Signal },
}

/// WebRTC negotiation payloads. SDP and candidates are JSON strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from_peer_id: String,
    pub to_peer_id: String,
    pub signal: Signal,
}
