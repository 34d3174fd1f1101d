use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// 20ms at 48kHz mono.
pub const FRAME_SAMPLES: usize = 960;
/// Per-source playback backlog cap (~100ms) to avoid latency buildup.
const MAX_BACKLOG: usize = 4800;

/// Audio device info returned to the API.
#[derive(Debug, Clone, Serialize)]
pub struct AudioDevice {
    pub name: String,
    pub is_input: bool,
    pub is_default: bool,
}

/// List available input and output audio devices.
pub fn list_devices() -> Vec<AudioDevice> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let is_default = default_input_name.as_deref() == Some(&name);
                devices.push(AudioDevice {
                    name,
                    is_input: true,
                    is_default,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_deref() == Some(&name);
                devices.push(AudioDevice {
                    name,
                    is_input: false,
                    is_default,
                });
            }
        }
    }

    devices
}

/// Output device names matching any keyword, case-insensitively.
pub fn matching_outputs(keywords: &[String]) -> Vec<String> {
    list_devices()
        .into_iter()
        .filter(|d| !d.is_input && name_matches(&d.name, keywords))
        .map(|d| d.name)
        .collect()
}

pub fn name_matches(name: &str, keywords: &[String]) -> bool {
    let name = name.to_lowercase();
    keywords.iter().any(|k| !k.is_empty() && name.contains(&k.to_lowercase()))
}

fn input_device(host: &cpal::Host, name: Option<&str>) -> Option<cpal::Device> {
    match name {
        Some(name) => host
            .input_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false)),
        None => host.default_input_device(),
    }
}

fn output_device(host: &cpal::Host, name: Option<&str>) -> Option<cpal::Device> {
    match name {
        Some(name) => host
            .output_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false)),
        None => host.default_output_device(),
    }
}

/// Capture handle. The cpal::Stream (which is !Send) lives on a dedicated
/// thread; we communicate via the `running` flag.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    _thread: std::thread::JoinHandle<()>,
}

impl CaptureHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Start capturing from the named (or default) input device, pushing f32
/// PCM frames (mono, 48kHz, 960-sample chunks = 20ms) into `frames`.
/// Frames are dropped, not queued, when the consumer lags.
pub fn start_capture(device_name: Option<&str>, frames: mpsc::Sender<Vec<f32>>) -> Result<CaptureHandle, String> {
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();
    let running_callback = running.clone();
    let wanted = device_name.map(str::to_string);

    // Build the stream on a dedicated thread so the !Send cpal::Stream
    // never crosses a thread boundary.
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

    let thread = std::thread::spawn(move || {
        let host = cpal::default_host();
        let device = match input_device(&host, wanted.as_deref()) {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err("No input device available".into()));
                return;
            }
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        info!("Using input device: {}", device_name);

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(48000),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut buffer = Vec::with_capacity(FRAME_SAMPLES);

        let stream = match device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !running_callback.load(Ordering::Relaxed) {
                    return;
                }
                for &sample in data {
                    buffer.push(sample);
                    if buffer.len() == FRAME_SAMPLES {
                        let _ = frames.try_send(std::mem::replace(&mut buffer, Vec::with_capacity(FRAME_SAMPLES)));
                    }
                }
            },
            move |err| {
                error!("Audio capture error: {}", err);
            },
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("Failed to build input stream: {}", e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(format!("Failed to start capture: {}", e)));
            return;
        }

        info!("Audio capture started (48kHz mono, 20ms frames)");
        let _ = ready_tx.send(Ok(()));

        // Keep the stream alive until stopped
        while running_thread.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }

        drop(stream);
        info!("Audio capture thread exiting");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err("Audio capture thread panicked".into()),
    }

    Ok(CaptureHandle { running, _thread: thread })
}

/// One decoded frame from a remote source.
#[derive(Debug, Clone)]
pub struct PlaybackFrame {
    pub source: String,
    pub pcm: Vec<f32>,
}

/// Playback handle. The cpal::Stream lives on a dedicated thread.
pub struct PlaybackHandle {
    running: Arc<AtomicBool>,
    device_name: String,
    _thread: std::thread::JoinHandle<()>,
}

impl PlaybackHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Per-source sample queues summed at output time.
#[derive(Default)]
struct Mixer {
    sources: HashMap<String, VecDeque<f32>>,
}

impl Mixer {
    fn push(&mut self, frame: PlaybackFrame) {
        let queue = self.sources.entry(frame.source).or_default();
        queue.extend(frame.pcm);
        while queue.len() > MAX_BACKLOG {
            queue.pop_front();
        }
    }

    fn fill(&mut self, out: &mut [f32]) {
        for sample in out.iter_mut() {
            let sum: f32 = self.sources.values_mut().filter_map(|q| q.pop_front()).sum();
            *sample = sum.clamp(-1.0, 1.0);
        }
        self.sources.retain(|_, q| !q.is_empty());
    }
}

/// Start playback on the named (or default) output device.
/// Returns a sender that accepts decoded frames from any number of sources.
pub fn start_playback(device_name: Option<&str>) -> Result<(PlaybackHandle, mpsc::Sender<PlaybackFrame>), String> {
    let (tx, mut rx) = mpsc::channel::<PlaybackFrame>(64);
    let running = Arc::new(AtomicBool::new(true));
    let running_thread = running.clone();
    let running_callback = running.clone();
    let wanted = device_name.map(str::to_string);

    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<String, String>>();

    let thread = std::thread::spawn(move || {
        let host = cpal::default_host();
        let device = match output_device(&host, wanted.as_deref()) {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err("No output device available".into()));
                return;
            }
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        info!("Using output device: {}", device_name);

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(48000),
            buffer_size: cpal::BufferSize::Default,
        };

        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let mixer_reader = mixer.clone();
        let mixer_writer = mixer.clone();

        // Drain the frame channel into the mixer until every sender is gone.
        std::thread::spawn(move || {
            while let Some(frame) = rx.blocking_recv() {
                if let Ok(mut mixer) = mixer_writer.lock() {
                    mixer.push(frame);
                }
            }
        });

        let stream = match device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if !running_callback.load(Ordering::Relaxed) {
                    data.fill(0.0);
                    return;
                }
                match mixer_reader.lock() {
                    Ok(mut mixer) => mixer.fill(data),
                    Err(_) => data.fill(0.0),
                }
            },
            move |err| {
                error!("Audio playback error: {}", err);
            },
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(format!("Failed to build output stream: {}", e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(format!("Failed to start playback: {}", e)));
            return;
        }

        info!("Audio playback started (48kHz mono)");
        let _ = ready_tx.send(Ok(device_name));

        while running_thread.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(50));
        }

        drop(stream);
        info!("Audio playback thread exiting");
    });

    let device_name = match ready_rx.recv() {
        Ok(Ok(name)) => name,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err("Audio playback thread panicked".into()),
    };

    if device_name == "unknown" {
        warn!("Output device has no readable name");
    }

    Ok((
        PlaybackHandle {
            running,
            device_name,
            _thread: thread,
        },
        tx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(source: &str, pcm: Vec<f32>) -> PlaybackFrame {
        PlaybackFrame {
            source: source.to_string(),
            pcm,
        }
    }

    #[test]
    fn test_mixer_sums_sources_and_clips() {
        let mut mixer = Mixer::default();
        mixer.push(frame("a", vec![0.25, 0.75, 0.5]));
        mixer.push(frame("b", vec![0.25, 0.75]));

        let mut out = [9.0f32; 4];
        mixer.fill(&mut out);
        assert_eq!(out, [0.5, 1.0, 0.5, 0.0]);
        assert!(mixer.sources.is_empty());
    }

    #[test]
    fn test_mixer_caps_backlog_per_source() {
        let mut mixer = Mixer::default();
        for _ in 0..10 {
            mixer.push(frame("a", vec![0.1; FRAME_SAMPLES]));
        }
        assert_eq!(mixer.sources["a"].len(), MAX_BACKLOG);
    }

    #[test]
    fn test_name_matches_keywords() {
        let keywords = vec!["Headset".to_string(), "".to_string()];
        assert!(name_matches("USB Audio HEADSET", &keywords));
        assert!(!name_matches("Built-in Speakers", &keywords));
    }
}
