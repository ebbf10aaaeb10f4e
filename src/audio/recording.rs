//! Per-call recording buffer.
//!
//! Caller and assistant audio are kept on separate narrowband tracks. Both
//! tracks advance in real time, so an assistant burst is placed at the
//! caller track's current length, which keeps the two roughly aligned
//! without timestamps. On flush the tracks are mixed, upsampled to
//! wideband and written as WAV.

use super::{NARROWBAND_RATE, WIDEBAND_RATE, resample_linear, wav};
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RecordingBuffer {
    enabled: bool,
    caller: Vec<i16>,
    assistant: Vec<i16>,
    flushed: bool,
}

impl RecordingBuffer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append decoded caller audio.
    pub fn push_caller(&mut self, samples: &[i16]) {
        if self.enabled && !self.flushed {
            self.caller.extend_from_slice(samples);
        }
    }

    /// Append synthesized audio that was sent to the caller.
    pub fn push_assistant(&mut self, samples: &[i16]) {
        if !self.enabled || self.flushed {
            return;
        }
        if self.assistant.len() < self.caller.len() {
            self.assistant.resize(self.caller.len(), 0);
        }
        self.assistant.extend_from_slice(samples);
    }

    /// Length of the longer track.
    pub fn duration(&self) -> Duration {
        let samples = self.caller.len().max(self.assistant.len());
        Duration::from_millis(samples as u64 * 1000 / u64::from(NARROWBAND_RATE))
    }

    pub fn is_empty(&self) -> bool {
        self.caller.is_empty() && self.assistant.is_empty()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Mix both tracks and release them. Returns `None` after the first call,
    /// or when recording is disabled or nothing was captured.
    pub fn take_mixed(&mut self) -> Option<Vec<i16>> {
        if self.flushed || !self.enabled {
            return None;
        }
        self.flushed = true;
        let caller = std::mem::take(&mut self.caller);
        let assistant = std::mem::take(&mut self.assistant);
        if caller.is_empty() && assistant.is_empty() {
            return None;
        }
        Some(mix(&caller, &assistant))
    }
}

fn mix(a: &[i16], b: &[i16]) -> Vec<i16> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            let sa = i32::from(a.get(i).copied().unwrap_or(0));
            let sb = i32::from(b.get(i).copied().unwrap_or(0));
            (sa + sb).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
        })
        .collect()
}

/// Write a mixed narrowband recording to `dir/<call_id>.wav` at wideband rate.
///
/// Blocking; run on `spawn_blocking` from async code.
///
/// # Errors
///
/// Returns an I/O or codec error.
pub fn write_recording(dir: &Path, call_id: &str, mixed: &[i16]) -> Result<PathBuf> {
    let wide = resample_linear(mixed, NARROWBAND_RATE, WIDEBAND_RATE)?;
    let path = dir.join(format!("{}.wav", sanitize_file_stem(call_id)));
    wav::write_wav_file(&path, &wide, WIDEBAND_RATE)?;
    Ok(path)
}

/// Call-IDs may contain `@`, `/` and other characters unfit for file names.
fn sanitize_file_stem(call_id: &str) -> String {
    call_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
