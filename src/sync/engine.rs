use tracing::{debug, info, warn};

use crate::error::{PolicyError, ProtocolError};
use crate::events::AppEvent;
use crate::models::{Marker, MarkerPosition, Operator, OperatorStatus, Position, Roster};
use crate::voice::TransmitGate;

use super::SyncMessage;

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Every open channel.
    All,
    /// One peer's channel.
    Peer(String),
    /// Every open channel except the one the message arrived on.
    AllExcept(String),
}

/// Side effects produced by the engine. The session loop performs them in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEffect {
    Send { target: Target, message: SyncMessage },
    Emit(AppEvent),
}

/// Holds this device's view of the group and applies the sync protocol to it.
///
/// The engine does no I/O. Inbound messages and local actions return the
/// effects to perform, so roster merging and host relay can be checked
/// without a network.
pub struct SyncEngine {
    local: Operator,
    roster: Roster,
    markers: Vec<Marker>,
    silenced: bool,
    /// Peer id of the host, on operator devices.
    host_peer_id: Option<String>,
}

impl SyncEngine {
    pub fn new_host(local: Operator) -> Self {
        Self {
            local,
            roster: Roster::new(),
            markers: Vec::new(),
            silenced: false,
            host_peer_id: None,
        }
    }

    pub fn new_operator(local: Operator, host_peer_id: impl Into<String>) -> Self {
        Self {
            local,
            roster: Roster::new(),
            markers: Vec::new(),
            silenced: false,
            host_peer_id: Some(host_peer_id.into()),
        }
    }

    pub fn local(&self) -> &Operator {
        &self.local
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn silenced(&self) -> bool {
        self.silenced
    }

    pub fn is_host(&self) -> bool {
        self.local.is_host()
    }

    pub fn gate(&self) -> TransmitGate {
        TransmitGate {
            silenced: self.silenced,
            is_host: self.is_host(),
        }
    }

    /// Local operator followed by every remote roster entry.
    pub fn operators(&self) -> Vec<Operator> {
        std::iter::once(self.local.clone())
            .chain(self.roster.values().cloned())
            .collect()
    }

    // ------------------------------------------------------------
    // Channel lifecycle
    // ------------------------------------------------------------

    pub fn on_channel_open(&mut self, peer_id: &str) -> Vec<SyncEffect> {
        let mut effects = vec![SyncEffect::Emit(AppEvent::PeerConnected {
            peer_id: peer_id.to_string(),
        })];

        if self.is_host() {
            info!("Sending roster ({} operators) to {}", self.roster.len() + 1, peer_id);
            effects.push(send_to(peer_id, SyncMessage::SyncRoster { roster: self.operators() }));
            if self.silenced {
                effects.push(send_to(peer_id, SyncMessage::SilenceSet { silenced: true }));
            }
            for marker in &self.markers {
                effects.push(send_to(peer_id, SyncMessage::PingCreate { marker: marker.clone() }));
            }
        } else if self.host_peer_id.as_deref() == Some(peer_id) {
            effects.push(send_to(peer_id, SyncMessage::UpdateOperator { operator: self.local.clone() }));
        } else {
            warn!("Operator opened a channel to non-host peer {}", peer_id);
        }

        effects
    }

    pub fn on_channel_closed(&mut self, peer_id: &str) -> Vec<SyncEffect> {
        let mut effects = vec![SyncEffect::Emit(AppEvent::PeerDisconnected {
            peer_id: peer_id.to_string(),
        })];

        if self.roster.remove(peer_id).is_some() {
            effects.push(self.roster_changed());
            if self.is_host() {
                effects.push(SyncEffect::Send {
                    target: Target::All,
                    message: SyncMessage::OperatorLeft { id: peer_id.to_string() },
                });
            }
        }

        if self.host_peer_id.as_deref() == Some(peer_id) {
            warn!("Lost host {}; roster is frozen until a new session", peer_id);
        }

        effects
    }

    // ------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------

    /// Decode and apply one message from `from`. Malformed or refused
    /// messages are logged and dropped; they never close the channel.
    pub fn on_message(&mut self, from: &str, data: &[u8]) -> Vec<SyncEffect> {
        let msg = match SyncMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping message from {}: {}", from, e);
                return Vec::new();
            }
        };
        self.apply(from, msg)
    }

    pub fn apply(&mut self, from: &str, msg: SyncMessage) -> Vec<SyncEffect> {
        debug!("{} from {}", msg.kind(), from);
        match self.merge(from, &msg) {
            Ok(mut effects) => {
                effects.extend(self.relay(from, msg));
                effects
            }
            Err(e) => {
                warn!("Dropping {} from {}: {}", msg.kind(), from, e);
                Vec::new()
            }
        }
    }

    /// Apply a received message to local state.
    pub fn merge(&mut self, from: &str, msg: &SyncMessage) -> Result<Vec<SyncEffect>, ProtocolError> {
        if !self.is_host() {
            self.require_host_sender(msg.kind(), from)?;
        }

        match msg {
            SyncMessage::UpdateOperator { operator } => {
                if operator.id == self.local.id {
                    debug!("Ignoring echo of own snapshot");
                    return Ok(Vec::new());
                }
                if self.is_host() && operator.id != from {
                    return Err(unexpected(msg, from));
                }
                // There is one host per session and it never announces itself this way.
                if operator.is_host() && self.host_peer_id.as_deref() != Some(operator.id.as_str()) {
                    return Err(unexpected(msg, from));
                }
                // Last writer by arrival wins; snapshots carry no version.
                self.roster.insert(operator.id.clone(), operator.clone());
                Ok(vec![self.roster_changed()])
            }
            SyncMessage::SyncRoster { roster } => {
                if self.is_host() {
                    return Err(unexpected(msg, from));
                }
                self.roster = roster
                    .iter()
                    .filter(|op| op.id != self.local.id)
                    .map(|op| (op.id.clone(), op.clone()))
                    .collect();
                info!("Roster synced from host: {} remote operators", self.roster.len());
                Ok(vec![self.roster_changed()])
            }
            SyncMessage::PingCreate { marker } => {
                if self.is_host() {
                    if marker.owner_id != from {
                        return Err(unexpected(msg, from));
                    }
                    // An id already taken by someone else is not a create.
                    if self.markers.iter().any(|m| m.id == marker.id && m.owner_id != from) {
                        return Err(unexpected(msg, from));
                    }
                }
                match self.markers.iter_mut().find(|m| m.id == marker.id) {
                    Some(existing) => *existing = marker.clone(),
                    None => self.markers.push(marker.clone()),
                }
                Ok(vec![self.markers_changed()])
            }
            SyncMessage::PingUpdate { marker } => {
                let is_host = self.is_host();
                let existing = self
                    .markers
                    .iter_mut()
                    .find(|m| m.id == marker.id)
                    .ok_or_else(|| ProtocolError::UnknownMarker {
                        kind: msg.kind(),
                        id: marker.id.clone(),
                    })?;
                if is_host {
                    if existing.owner_id != from {
                        return Err(unexpected(msg, from));
                    }
                    // Operators may only move their markers.
                    existing.position = marker.position;
                } else {
                    *existing = marker.clone();
                }
                Ok(vec![self.markers_changed()])
            }
            SyncMessage::PingDelete { id } => {
                let index = self
                    .markers
                    .iter()
                    .position(|m| &m.id == id)
                    .ok_or_else(|| ProtocolError::UnknownMarker {
                        kind: msg.kind(),
                        id: id.clone(),
                    })?;
                if self.is_host() && self.markers[index].owner_id != from {
                    return Err(unexpected(msg, from));
                }
                self.markers.remove(index);
                Ok(vec![self.markers_changed()])
            }
            SyncMessage::SilenceSet { silenced } => {
                // Only the host sets silence, and the host never receives its own.
                if self.is_host() {
                    return Err(unexpected(msg, from));
                }
                if self.silenced == *silenced {
                    return Ok(Vec::new());
                }
                self.silenced = *silenced;
                info!("Radio silence {}", if *silenced { "on" } else { "off" });
                Ok(vec![SyncEffect::Emit(AppEvent::SilenceChanged { silenced: *silenced })])
            }
            SyncMessage::OperatorLeft { id } => {
                if self.is_host() {
                    return Err(unexpected(msg, from));
                }
                if self.roster.remove(id).is_some() {
                    Ok(vec![self.roster_changed()])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// The host's forwarding step for a message it has just merged.
    /// Operators never relay.
    pub fn relay(&self, from: &str, msg: SyncMessage) -> Option<SyncEffect> {
        if !self.is_host() || !msg.is_relayed() {
            return None;
        }
        // Forward the stored entry, not what the operator sent.
        let msg = match msg {
            SyncMessage::PingUpdate { marker } => match self.markers.iter().find(|m| m.id == marker.id) {
                Some(stored) => SyncMessage::PingUpdate { marker: stored.clone() },
                None => SyncMessage::PingUpdate { marker },
            },
            other => other,
        };
        Some(SyncEffect::Send {
            target: Target::AllExcept(from.to_string()),
            message: msg,
        })
    }

    // ------------------------------------------------------------
    // Local actions
    // ------------------------------------------------------------

    fn update_local(&mut self, change: impl FnOnce(&mut Operator)) -> Vec<SyncEffect> {
        change(&mut self.local);
        vec![
            SyncEffect::Send {
                target: Target::All,
                message: SyncMessage::UpdateOperator { operator: self.local.clone() },
            },
            self.roster_changed(),
        ]
    }

    pub fn set_status(&mut self, status: OperatorStatus) -> Vec<SyncEffect> {
        self.update_local(|op| op.status = status)
    }

    /// Publish a transmit flip. Returns nothing when the flag is unchanged.
    pub fn set_transmitting(&mut self, transmitting: bool) -> Vec<SyncEffect> {
        if self.local.is_transmitting == transmitting {
            return Vec::new();
        }
        self.update_local(|op| op.is_transmitting = transmitting)
    }

    pub fn set_position(&mut self, position: Position) -> Vec<SyncEffect> {
        self.update_local(|op| op.position = Some(position))
    }

    pub fn set_battery(&mut self, percent: u8) -> Vec<SyncEffect> {
        self.update_local(|op| op.battery = Some(percent.min(100)))
    }

    pub fn create_marker(&mut self, position: MarkerPosition, label: &str) -> (Marker, Vec<SyncEffect>) {
        let marker = Marker::new(&self.local, position, label);
        self.markers.push(marker.clone());
        let effects = vec![
            SyncEffect::Send {
                target: Target::All,
                message: SyncMessage::PingCreate { marker: marker.clone() },
            },
            self.markers_changed(),
        ];
        (marker, effects)
    }

    pub fn move_marker(&mut self, id: &str, position: MarkerPosition) -> Result<Vec<SyncEffect>, PolicyError> {
        let index = self.editable_marker(id)?;
        self.markers[index].position = position;
        let marker = self.markers[index].clone();
        Ok(vec![
            SyncEffect::Send {
                target: Target::All,
                message: SyncMessage::PingUpdate { marker },
            },
            self.markers_changed(),
        ])
    }

    pub fn delete_marker(&mut self, id: &str) -> Result<Vec<SyncEffect>, PolicyError> {
        let index = self.editable_marker(id)?;
        self.markers.remove(index);
        Ok(vec![
            SyncEffect::Send {
                target: Target::All,
                message: SyncMessage::PingDelete { id: id.to_string() },
            },
            self.markers_changed(),
        ])
    }

    pub fn set_silence(&mut self, silenced: bool) -> Result<Vec<SyncEffect>, PolicyError> {
        if !self.is_host() {
            return Err(PolicyError::HostOnly);
        }
        if self.silenced == silenced {
            return Ok(Vec::new());
        }
        self.silenced = silenced;
        info!("Radio silence {} by host", if silenced { "on" } else { "off" });
        Ok(vec![
            SyncEffect::Send {
                target: Target::All,
                message: SyncMessage::SilenceSet { silenced },
            },
            SyncEffect::Emit(AppEvent::SilenceChanged { silenced }),
        ])
    }

    // ------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------

    fn editable_marker(&self, id: &str) -> Result<usize, PolicyError> {
        let index = self
            .markers
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| PolicyError::UnknownMarker(id.to_string()))?;
        if !self.is_host() && self.markers[index].owner_id != self.local.id {
            return Err(PolicyError::NotMarkerOwner(id.to_string()));
        }
        Ok(index)
    }

    fn require_host_sender(&self, kind: &'static str, from: &str) -> Result<(), ProtocolError> {
        match self.host_peer_id.as_deref() {
            Some(host) if host == from => Ok(()),
            _ => Err(ProtocolError::UnexpectedSender {
                kind,
                peer_id: from.to_string(),
            }),
        }
    }

    pub fn roster_changed(&self) -> SyncEffect {
        SyncEffect::Emit(AppEvent::RosterChanged {
            local: self.local.clone(),
            remote: self.roster.values().cloned().collect(),
        })
    }

    pub fn markers_changed(&self) -> SyncEffect {
        SyncEffect::Emit(AppEvent::MarkersChanged {
            markers: self.markers.clone(),
        })
    }
}

fn send_to(peer_id: &str, message: SyncMessage) -> SyncEffect {
    SyncEffect::Send {
        target: Target::Peer(peer_id.to_string()),
        message,
    }
}

fn unexpected(msg: &SyncMessage, from: &str) -> ProtocolError {
    ProtocolError::UnexpectedSender {
        kind: msg.kind(),
        peer_id: from.to_string(),
    }
}
