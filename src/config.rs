//! Runtime configuration.
//!
//! Loaded from an optional JSON file, then overridden by CLI flags. Every
//! section falls back to defaults, so a partial file is valid.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::voice::{TransmitMode, TransmitSettings};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Callsign used when none is given to start/join.
    pub callsign: Option<String>,
    pub transmit: TransmitConfig,
    pub network: NetworkConfig,
    pub audio: AudioConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitConfig {
    /// Mode the controller starts in
    pub mode: TransmitMode,
    /// RMS threshold (0.0-1.0] for voice activation
    pub vox_threshold: f32,
    /// Tail kept open after the last loud frame, in milliseconds
    pub vox_hold_ms: u64,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            mode: TransmitMode::Ptt,
            vox_threshold: 0.02,
            vox_hold_ms: 1000,
        }
    }
}

impl TransmitConfig {
    pub fn settings(&self) -> TransmitSettings {
        TransmitSettings {
            vox_threshold: self.vox_threshold,
            vox_hold: Duration::from_millis(self.vox_hold_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// libp2p TCP/QUIC listen port (0 = any)
    pub listen_port: u16,
    /// Address advertised in the session id instead of the first LAN address
    pub advertise_addr: Option<String>,
    pub stun_servers: Vec<String>,
    /// How long a join may take before the channel must be open
    pub join_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            advertise_addr: None,
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            join_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Focus keep-alive / headset poll interval
    pub focus_heartbeat_secs: u64,
    /// Output device name fragments treated as a headset (case-insensitive)
    pub headset_keywords: Vec<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            focus_heartbeat_secs: 5,
            headset_keywords: vec![
                "headset".to_string(),
                "headphone".to_string(),
                "earbud".to_string(),
                "hands-free".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9847 }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let t = &self.transmit;
        if !(t.vox_threshold > 0.0 && t.vox_threshold <= 1.0) {
            return Err(format!("transmit.vox_threshold must be in (0, 1], got {}", t.vox_threshold));
        }
        if t.vox_hold_ms == 0 {
            return Err("transmit.vox_hold_ms must be positive".to_string());
        }
        if self.audio.focus_heartbeat_secs == 0 {
            return Err("audio.focus_heartbeat_secs must be positive".to_string());
        }
        if self.network.join_timeout_secs == 0 {
            return Err("network.join_timeout_secs must be positive".to_string());
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.audio.focus_heartbeat_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.network.join_timeout_secs)
    }
}
