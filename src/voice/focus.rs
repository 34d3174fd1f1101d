//! Audio focus and output routing.
//!
//! The adapter holds OS audio focus for the session, keeps output on the
//! speaker or the headset, and acts as the mic interlock: the microphone can
//! only be opened while focus is held, and any focus loss closes it.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::HardwareError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioRoute {
    Speaker,
    Headset,
}

/// Abstract hardware notifications. Produced by platform adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HardwareEvent {
    HeadsetConnected,
    HeadsetDisconnected,
    FocusLost { transient: bool },
    FocusGained,
}

/// Owned hardware context for one session. `init` and `teardown` bracket
/// the session, not the process.
pub trait AudioHardware: Send {
    fn init(&mut self) -> Result<(), HardwareError>;
    fn teardown(&mut self);
    fn request_focus(&mut self) -> Result<(), HardwareError>;
    fn abandon_focus(&mut self);
    fn apply_route(&mut self, route: AudioRoute) -> Result<(), HardwareError>;
    fn set_mic_enabled(&mut self, enabled: bool) -> Result<(), HardwareError>;
    fn headset_connected(&self) -> bool;
}

/// What the session loop has to do after a hardware event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FocusOutcome {
    /// The transmission controller must force the mic closed.
    pub close_mic: bool,
    /// Output route changed to this.
    pub route_changed: Option<AudioRoute>,
}

pub struct AudioFocusAdapter {
    hw: Box<dyn AudioHardware>,
    route: AudioRoute,
    has_focus: bool,
    mic_enabled: bool,
    active: bool,
}

impl AudioFocusAdapter {
    pub fn new(hw: Box<dyn AudioHardware>) -> Self {
        Self {
            hw,
            route: AudioRoute::Speaker,
            has_focus: false,
            mic_enabled: false,
            active: false,
        }
    }

    pub fn route(&self) -> AudioRoute {
        self.route
    }

    pub fn has_focus(&self) -> bool {
        self.has_focus
    }

    pub fn mic_enabled(&self) -> bool {
        self.mic_enabled
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Initialize the hardware context, take focus and apply routing.
    pub fn start(&mut self) -> Result<AudioRoute, HardwareError> {
        self.hw.init()?;
        self.active = true;
        self.mic_enabled = false;
        match self.hw.request_focus() {
            Ok(()) => self.has_focus = true,
            Err(e) => {
                warn!("Audio focus not granted at start: {}", e);
                self.has_focus = false;
            }
        }
        self.route = route_for(self.hw.headset_connected());
        self.hw.apply_route(self.route)?;
        info!("Audio started, route {:?}", self.route);
        Ok(self.route)
    }

    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        if self.mic_enabled {
            let _ = self.hw.set_mic_enabled(false);
            self.mic_enabled = false;
        }
        self.hw.abandon_focus();
        self.has_focus = false;
        self.hw.teardown();
        self.active = false;
        info!("Audio stopped");
    }

    /// Gate the microphone. Opening requires audio focus.
    pub fn set_mic(&mut self, enabled: bool) -> Result<(), HardwareError> {
        if enabled && !self.has_focus {
            return Err(HardwareError::NoAudioFocus);
        }
        if self.mic_enabled == enabled {
            return Ok(());
        }
        self.hw.set_mic_enabled(enabled)?;
        self.mic_enabled = enabled;
        Ok(())
    }

    pub fn handle(&mut self, event: HardwareEvent) -> FocusOutcome {
        let mut outcome = FocusOutcome::default();
        match event {
            HardwareEvent::HeadsetConnected => {
                outcome.route_changed = self.reroute(AudioRoute::Headset);
            }
            HardwareEvent::HeadsetDisconnected => {
                outcome.route_changed = self.reroute(AudioRoute::Speaker);
            }
            HardwareEvent::FocusLost { transient } => {
                warn!("Audio focus lost (transient: {}), closing mic", transient);
                self.has_focus = false;
                if self.mic_enabled {
                    if let Err(e) = self.hw.set_mic_enabled(false) {
                        warn!("Failed to disable mic on focus loss: {}", e);
                    }
                    self.mic_enabled = false;
                }
                outcome.close_mic = true;
            }
            HardwareEvent::FocusGained => {
                info!("Audio focus regained");
                self.has_focus = true;
                // Mic stays closed until the operator transmits again.
                let route = self.route;
                self.reroute(route);
            }
        }
        outcome
    }

    /// Keep-alive: reclaim focus, follow headset changes, re-assert routing.
    pub fn heartbeat(&mut self) -> FocusOutcome {
        if !self.active {
            return FocusOutcome::default();
        }
        if !self.has_focus {
            match self.hw.request_focus() {
                Ok(()) => {
                    info!("Audio focus reclaimed");
                    self.has_focus = true;
                }
                Err(e) => warn!("Audio focus still unavailable: {}", e),
            }
        }
        let route = route_for(self.hw.headset_connected());
        FocusOutcome {
            close_mic: false,
            route_changed: self.reroute(route),
        }
    }

    /// Apply `route` unconditionally; the OS may have reverted it silently.
    fn reroute(&mut self, route: AudioRoute) -> Option<AudioRoute> {
        if let Err(e) = self.hw.apply_route(route) {
            warn!("Failed to apply {:?} routing: {}", route, e);
        }
        if self.route == route {
            return None;
        }
        info!("Audio route {:?} -> {:?}", self.route, route);
        self.route = route;
        Some(route)
    }
}

impl Drop for AudioFocusAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn route_for(headset: bool) -> AudioRoute {
    if headset {
        AudioRoute::Headset
    } else {
        AudioRoute::Speaker
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub(crate) struct FakeState {
        pub headset: bool,
        pub deny_focus: bool,
        pub mic: bool,
        pub routes: Vec<AudioRoute>,
        pub torn_down: bool,
    }

    pub(crate) struct FakeHardware(pub Arc<Mutex<FakeState>>);

    impl AudioHardware for FakeHardware {
        fn init(&mut self) -> Result<(), HardwareError> {
            Ok(())
        }
        fn teardown(&mut self) {
            self.0.lock().unwrap().torn_down = true;
        }
        fn request_focus(&mut self) -> Result<(), HardwareError> {
            if self.0.lock().unwrap().deny_focus {
                Err(HardwareError::NoAudioFocus)
            } else {
                Ok(())
            }
        }
        fn abandon_focus(&mut self) {}
        fn apply_route(&mut self, route: AudioRoute) -> Result<(), HardwareError> {
            self.0.lock().unwrap().routes.push(route);
            Ok(())
        }
        fn set_mic_enabled(&mut self, enabled: bool) -> Result<(), HardwareError> {
            self.0.lock().unwrap().mic = enabled;
            Ok(())
        }
        fn headset_connected(&self) -> bool {
            self.0.lock().unwrap().headset
        }
    }

    fn adapter() -> (AudioFocusAdapter, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let mut adapter = AudioFocusAdapter::new(Box::new(FakeHardware(state.clone())));
        adapter.start().unwrap();
        (adapter, state)
    }

    #[test]
    fn test_start_routes_to_speaker_without_headset() {
        let (adapter, state) = adapter();
        assert_eq!(adapter.route(), AudioRoute::Speaker);
        assert!(adapter.has_focus());
        assert_eq!(state.lock().unwrap().routes, vec![AudioRoute::Speaker]);
    }

    #[test]
    fn test_headset_events_reassert_routing_every_time() {
        let (mut adapter, state) = adapter();
        let out = adapter.handle(HardwareEvent::HeadsetConnected);
        assert_eq!(out.route_changed, Some(AudioRoute::Headset));
        let out = adapter.handle(HardwareEvent::HeadsetConnected);
        assert_eq!(out.route_changed, None);
        adapter.handle(HardwareEvent::HeadsetDisconnected);
        assert_eq!(
            state.lock().unwrap().routes,
            vec![AudioRoute::Speaker, AudioRoute::Headset, AudioRoute::Headset, AudioRoute::Speaker]
        );
    }

    #[test]
    fn test_focus_loss_closes_mic() {
        let (mut adapter, state) = adapter();
        adapter.set_mic(true).unwrap();
        assert!(state.lock().unwrap().mic);

        let out = adapter.handle(HardwareEvent::FocusLost { transient: true });
        assert!(out.close_mic);
        assert!(!adapter.mic_enabled());
        assert!(!state.lock().unwrap().mic);
        assert_eq!(adapter.set_mic(true), Err(HardwareError::NoAudioFocus));
    }

    #[test]
    fn test_focus_regain_does_not_reopen_mic() {
        let (mut adapter, state) = adapter();
        adapter.set_mic(true).unwrap();
        adapter.handle(HardwareEvent::FocusLost { transient: false });
        let routes_before = state.lock().unwrap().routes.len();

        let out = adapter.handle(HardwareEvent::FocusGained);
        assert!(!out.close_mic);
        assert!(!adapter.mic_enabled());
        assert!(!state.lock().unwrap().mic);
        assert_eq!(state.lock().unwrap().routes.len(), routes_before + 1);
        assert!(adapter.set_mic(true).is_ok());
    }

    #[test]
    fn test_heartbeat_reclaims_focus_and_follows_headset() {
        let state = Arc::new(Mutex::new(FakeState {
            deny_focus: true,
            ..Default::default()
        }));
        let mut adapter = AudioFocusAdapter::new(Box::new(FakeHardware(state.clone())));
        adapter.start().unwrap();
        assert!(!adapter.has_focus());

        {
            let mut s = state.lock().unwrap();
            s.deny_focus = false;
            s.headset = true;
        }
        let out = adapter.heartbeat();
        assert!(adapter.has_focus());
        assert_eq!(out.route_changed, Some(AudioRoute::Headset));
    }

    #[test]
    fn test_stop_tears_down() {
        let (mut adapter, state) = adapter();
        adapter.set_mic(true).unwrap();
        adapter.stop();
        let s = state.lock().unwrap();
        assert!(!s.mic);
        assert!(s.torn_down);
        assert!(!adapter.is_active());
    }
}
