//! Capture-frame level metering.

/// RMS of a PCM frame, 0.0 for an empty frame.
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
}

/// Exponentially smoothed level for meters. VOX decisions use raw `rms`.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    level: f32,
    smoothing: f32,
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new(0.3)
    }
}

impl LevelMeter {
    pub fn new(smoothing: f32) -> Self {
        Self {
            level: 0.0,
            smoothing: smoothing.clamp(0.0, 1.0),
        }
    }

    /// Meter a frame; returns the raw RMS.
    pub fn process(&mut self, frame: &[f32]) -> f32 {
        let value = rms(frame);
        self.level = self.level * (1.0 - self.smoothing) + value * self.smoothing;
        value
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_meter_smooths_but_returns_raw() {
        let mut meter = LevelMeter::new(0.5);
        let raw = meter.process(&[1.0; 960]);
        assert!((raw - 1.0).abs() < 1e-6);
        assert!((meter.level() - 0.5).abs() < 1e-6);
        meter.reset();
        assert_eq!(meter.level(), 0.0);
    }
}
