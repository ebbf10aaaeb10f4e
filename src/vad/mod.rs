//! Voice activity detection using RMS energy on 16-bit PCM.
//!
//! [`BargeInDetector`] watches caller audio while the assistant is speaking.
//! [`UtteranceDetector`] groups caller audio into utterances for
//! transcribers that work on whole clips.

mod barge_in;
mod endpoint;

pub use barge_in::BargeInDetector;
pub use endpoint::{EndpointEvent, UtteranceDetector};

/// Root-mean-square amplitude of a frame on the 16-bit scale.
pub fn frame_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let a = f64::from(s).abs();
            a * a
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}
