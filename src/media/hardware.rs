//! cpal-backed implementation of [`AudioHardware`].
//!
//! Desktop hosts have no focus arbitration, so focus is always granted.
//! Routing picks the first output device whose name matches a headset
//! keyword and falls back to the default output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::error::HardwareError;
use crate::media::audio::{self, CaptureHandle, PlaybackFrame, PlaybackHandle};
use crate::voice::focus::{AudioHardware, AudioRoute};

/// Mic interlock shared with the capture path. Frames are only encoded
/// and sent while it is open.
#[derive(Clone, Default)]
pub struct MicGate(Arc<AtomicBool>);

impl MicGate {
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, open: bool) {
        self.0.store(open, Ordering::Release);
    }
}

/// Where remote-track readers push decoded audio. Follows route changes.
#[derive(Clone, Default)]
pub struct PlaybackSink(Arc<Mutex<Option<mpsc::Sender<PlaybackFrame>>>>);

impl PlaybackSink {
    pub fn push(&self, source: &str, pcm: Vec<f32>) {
        let sender = match self.0.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        if let Some(tx) = sender {
            let _ = tx.try_send(PlaybackFrame {
                source: source.to_string(),
                pcm,
            });
        }
    }

    fn replace(&self, tx: Option<mpsc::Sender<PlaybackFrame>>) {
        if let Ok(mut guard) = self.0.lock() {
            *guard = tx;
        }
    }
}

/// The session loop's side of the audio context.
pub struct AudioIo {
    pub frames: mpsc::Receiver<Vec<f32>>,
    pub mic_gate: MicGate,
    pub playback: PlaybackSink,
}

/// A running output stream.
pub trait OutputStream: Send {
    fn stop(&self);
    fn device_name(&self) -> &str;
}

impl OutputStream for PlaybackHandle {
    fn stop(&self) {
        PlaybackHandle::stop(self)
    }

    fn device_name(&self) -> &str {
        PlaybackHandle::device_name(self)
    }
}

/// Opens an output on the named device, or the default one for `None`.
pub type OpenOutput =
    Box<dyn Fn(Option<&str>) -> Result<(Box<dyn OutputStream>, mpsc::Sender<PlaybackFrame>), String> + Send>;

fn cpal_output() -> OpenOutput {
    Box::new(|device| {
        let (handle, tx) = audio::start_playback(device)?;
        Ok((Box::new(handle) as Box<dyn OutputStream>, tx))
    })
}

struct ActiveOutput {
    stream: Box<dyn OutputStream>,
    /// Device that was asked for. `None` is the default output.
    requested: Option<String>,
}

pub struct DesktopAudio {
    keywords: Vec<String>,
    frames_tx: mpsc::Sender<Vec<f32>>,
    mic_gate: MicGate,
    playback_sink: PlaybackSink,
    capture: Option<CaptureHandle>,
    output: Option<ActiveOutput>,
    open_output: OpenOutput,
}

impl DesktopAudio {
    pub fn new(config: &AudioConfig) -> (Self, AudioIo) {
        Self::with_output(config, cpal_output())
    }

    pub fn with_output(config: &AudioConfig, open_output: OpenOutput) -> (Self, AudioIo) {
        let (frames_tx, frames) = mpsc::channel(64);
        let mic_gate = MicGate::default();
        let playback_sink = PlaybackSink::default();
        let io = AudioIo {
            frames,
            mic_gate: mic_gate.clone(),
            playback: playback_sink.clone(),
        };
        let hw = Self {
            keywords: config.headset_keywords.clone(),
            frames_tx,
            mic_gate,
            playback_sink,
            capture: None,
            output: None,
            open_output,
        };
        (hw, io)
    }

    fn output_for(&self, route: AudioRoute) -> Option<String> {
        match route {
            AudioRoute::Headset => audio::matching_outputs(&self.keywords).into_iter().next(),
            AudioRoute::Speaker => None,
        }
    }
}

impl AudioHardware for DesktopAudio {
    fn init(&mut self) -> Result<(), HardwareError> {
        let capture = audio::start_capture(None, self.frames_tx.clone()).map_err(|e| {
            warn!("Capture unavailable: {}", e);
            HardwareError::NoInputDevice
        })?;
        self.capture = Some(capture);
        Ok(())
    }

    fn teardown(&mut self) {
        self.mic_gate.set(false);
        self.playback_sink.replace(None);
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(output) = self.output.take() {
            output.stream.stop();
        }
    }

    fn request_focus(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    fn abandon_focus(&mut self) {}

    fn apply_route(&mut self, route: AudioRoute) -> Result<(), HardwareError> {
        let wanted = self.output_for(route);
        if wanted.is_none() && route == AudioRoute::Headset {
            warn!("No headset output found, staying on default output");
        }
        // Re-asserting the same output must not rebuild the stream.
        if let Some(current) = &self.output {
            if current.requested == wanted {
                debug!("Output already on {}", current.stream.device_name());
                return Ok(());
            }
        }

        let (stream, tx) = (self.open_output)(wanted.as_deref()).map_err(HardwareError::Device)?;
        info!("Output routed to {} ({:?})", stream.device_name(), route);
        let previous = self.output.replace(ActiveOutput {
            stream,
            requested: wanted,
        });
        if let Some(old) = previous {
            old.stream.stop();
        }
        self.playback_sink.replace(Some(tx));
        Ok(())
    }

    fn set_mic_enabled(&mut self, enabled: bool) -> Result<(), HardwareError> {
        if enabled && self.capture.is_none() {
            return Err(HardwareError::NoInputDevice);
        }
        self.mic_gate.set(enabled);
        Ok(())
    }

    fn headset_connected(&self) -> bool {
        !audio::matching_outputs(&self.keywords).is_empty()
    }
}

impl Drop for DesktopAudio {
    fn drop(&mut self) {
        self.teardown();
    }
}
