use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ============================================================
// Operators
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Host,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatorStatus {
    #[default]
    Clear,
    Contact,
    Busy,
    Support,
    Progression,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
}

/// One device's self-description. Only the owning device mutates it; peers
/// receive whole snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub id: String,
    pub callsign: String,
    pub role: Role,
    pub status: OperatorStatus,
    pub is_transmitting: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    pub joined_at: String,
}

impl Operator {
    pub fn new(id: impl Into<String>, callsign: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            callsign: callsign.into(),
            role,
            status: OperatorStatus::Clear,
            is_transmitting: false,
            position: None,
            battery: None,
            joined_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }
}

/// Remote operators by id. Never contains the local device's own entry.
pub type Roster = BTreeMap<String, Operator>;

// ============================================================
// Map markers
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerPosition {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    pub id: String,
    pub position: MarkerPosition,
    pub label: String,
    /// Creator's callsign, for display.
    pub sender: String,
    /// Creator's operator id, for edit authority.
    pub owner_id: String,
    pub created_at: String,
}

impl Marker {
    pub fn new(owner: &Operator, position: MarkerPosition, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            position,
            label: label.into(),
            sender: owner.callsign.clone(),
            owner_id: owner.id.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
