//! Group state synchronization: wire messages and the merge/relay engine.

pub mod engine;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::models::{Marker, Operator};

pub use engine::{SyncEffect, SyncEngine, Target};

/// Messages exchanged on the `squad-sync` data channel.
///
/// There is no version field: adding or renaming a kind breaks older peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
    UpdateOperator { operator: Operator },
    /// Host to a freshly connected operator, once per connection.
    SyncRoster { roster: Vec<Operator> },
    PingCreate { marker: Marker },
    PingUpdate { marker: Marker },
    PingDelete { id: String },
    SilenceSet { silenced: bool },
    /// Host to remaining operators when one operator's channel closes.
    OperatorLeft { id: String },
}

impl SyncMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::UpdateOperator { .. } => "UPDATE_OPERATOR",
            SyncMessage::SyncRoster { .. } => "SYNC_ROSTER",
            SyncMessage::PingCreate { .. } => "PING_CREATE",
            SyncMessage::PingUpdate { .. } => "PING_UPDATE",
            SyncMessage::PingDelete { .. } => "PING_DELETE",
            SyncMessage::SilenceSet { .. } => "SILENCE_SET",
            SyncMessage::OperatorLeft { .. } => "OPERATOR_LEFT",
        }
    }

    /// Kinds the host forwards to its other operators after applying them.
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            SyncMessage::UpdateOperator { .. }
                | SyncMessage::PingCreate { .. }
                | SyncMessage::PingUpdate { .. }
                | SyncMessage::PingDelete { .. }
                | SyncMessage::SilenceSet { .. }
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
