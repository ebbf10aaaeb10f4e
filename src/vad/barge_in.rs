use super::frame_rms;
use crate::config::VadConfig;

/// Detects the caller talking over synthesized playback.
///
/// Inert while nothing is playing. During playback a frame counts only if
/// its RMS exceeds the playback threshold, which sits well above normal
/// speech level so the assistant's own echo does not qualify. Barge-in is
/// declared when `consecutive_frames` loud frames arrive in a row; any quiet
/// frame resets the run. After a trigger the detector stays latched until
/// the run is broken, so one sustained burst reports exactly once.
#[derive(Debug, Clone)]
pub struct BargeInDetector {
    enabled: bool,
    threshold: f32,
    required: u32,
    count: u32,
    latched: bool,
}

impl BargeInDetector {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            enabled: config.barge_in_enabled,
            threshold: config.playback_threshold(),
            required: config.consecutive_frames.max(1),
            count: 0,
            latched: false,
        }
    }

    /// Feed one inbound frame. Returns `true` on the frame that completes a
    /// qualifying run.
    pub fn check(&mut self, frame: &[i16], playing: bool) -> bool {
        if !self.enabled || !playing {
            self.reset();
            return false;
        }
        if frame_rms(frame) <= self.threshold {
            self.reset();
            return false;
        }
        if self.latched {
            return false;
        }
        self.count += 1;
        if self.count >= self.required {
            self.count = 0;
            self.latched = true;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.latched = false;
    }

    /// Loud frames counted in the current run.
    pub fn running_count(&self) -> u32 {
        self.count
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}
