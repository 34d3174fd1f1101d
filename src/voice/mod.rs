//! Per-device transmission control (PTT / VOX) and audio focus handling.
//!
//! The controller decides when the local microphone is hot. It knows nothing
//! about the network: the session loop publishes every flip it reports.

pub mod focus;
pub mod level;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PolicyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransmitMode {
    #[default]
    Ptt,
    Vox,
}

/// Group policy the controller checks before opening the mic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransmitGate {
    pub silenced: bool,
    pub is_host: bool,
}

impl TransmitGate {
    pub fn blocks(&self) -> bool {
        self.silenced && !self.is_host
    }
}

/// What an input did to `is_transmitting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitChange {
    Unchanged,
    Started,
    Stopped,
}

impl TransmitChange {
    pub fn is_flip(&self) -> bool {
        !matches!(self, TransmitChange::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmitSettings {
    /// RMS level (0.0-1.0) above which VOX opens the mic.
    pub vox_threshold: f32,
    /// Tail kept open after the last loud frame.
    pub vox_hold: Duration,
}

impl Default for TransmitSettings {
    fn default() -> Self {
        Self {
            vox_threshold: 0.02,
            vox_hold: Duration::from_millis(1000),
        }
    }
}

/// Two-mode transmit state machine. Starts in PTT, not transmitting.
#[derive(Debug)]
pub struct TransmissionController {
    mode: TransmitMode,
    transmitting: bool,
    settings: TransmitSettings,
    /// VOX tail deadline. Re-arming replaces the previous one.
    hold_deadline: Option<Instant>,
}

impl TransmissionController {
    pub fn new(settings: TransmitSettings) -> Self {
        Self {
            mode: TransmitMode::Ptt,
            transmitting: false,
            settings,
            hold_deadline: None,
        }
    }

    pub fn with_mode(settings: TransmitSettings, mode: TransmitMode) -> Self {
        Self {
            mode,
            ..Self::new(settings)
        }
    }

    pub fn mode(&self) -> TransmitMode {
        self.mode
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    pub fn hold_deadline(&self) -> Option<Instant> {
        self.hold_deadline
    }

    pub fn settings(&self) -> TransmitSettings {
        self.settings
    }

    /// Talk control pressed. Only meaningful in PTT.
    pub fn hold_talk(&mut self, gate: TransmitGate) -> Result<TransmitChange, PolicyError> {
        if self.mode != TransmitMode::Ptt {
            debug!("Talk hold ignored in VOX mode");
            return Ok(TransmitChange::Unchanged);
        }
        self.open(gate)
    }

    /// Talk control released. Only meaningful in PTT.
    pub fn release_talk(&mut self) -> TransmitChange {
        if self.mode != TransmitMode::Ptt {
            return TransmitChange::Unchanged;
        }
        self.close()
    }

    /// Switch PTT <-> VOX. Either way the mic ends up closed.
    pub fn toggle_mode(&mut self) -> TransmitChange {
        self.mode = match self.mode {
            TransmitMode::Ptt => TransmitMode::Vox,
            TransmitMode::Vox => TransmitMode::Ptt,
        };
        info!("Transmit mode: {:?}", self.mode);
        self.close()
    }

    /// Feed one audio level sample (RMS of a capture frame).
    pub fn on_level(&mut self, level: f32, now: Instant, gate: TransmitGate) -> Result<TransmitChange, PolicyError> {
        if self.mode != TransmitMode::Vox || level <= self.settings.vox_threshold {
            return Ok(TransmitChange::Unchanged);
        }
        let change = self.open(gate)?;
        self.hold_deadline = Some(now + self.settings.vox_hold);
        Ok(change)
    }

    /// The VOX hold timer fired at `now`. Early or stale firings are ignored.
    pub fn on_hold_expired(&mut self, now: Instant) -> TransmitChange {
        match self.hold_deadline {
            Some(deadline) if now >= deadline => self.close(),
            _ => TransmitChange::Unchanged,
        }
    }

    /// Close the mic regardless of mode (focus loss, silence, teardown).
    pub fn force_close(&mut self) -> TransmitChange {
        self.close()
    }

    fn open(&mut self, gate: TransmitGate) -> Result<TransmitChange, PolicyError> {
        if gate.blocks() {
            return Err(PolicyError::BlockedBySilence);
        }
        if self.transmitting {
            return Ok(TransmitChange::Unchanged);
        }
        self.transmitting = true;
        Ok(TransmitChange::Started)
    }

    fn close(&mut self) -> TransmitChange {
        self.hold_deadline = None;
        if !self.transmitting {
            return TransmitChange::Unchanged;
        }
        self.transmitting = false;
        TransmitChange::Stopped
    }
}
