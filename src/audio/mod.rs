//! Narrowband telephony audio: G.711 µ-law, resampling, WAV and call recordings.
//!
//! All PCM in the bridge is mono signed 16-bit. The wire runs at 8 kHz in
//! 20 ms frames of 160 samples.

pub mod g711;
pub mod recording;
pub mod resample;
pub mod wav;

pub use g711::{decode_ulaw, encode_ulaw};
pub use recording::{RecordingBuffer, write_recording};
pub use resample::resample_linear;

/// Sample rate on the wire.
pub const NARROWBAND_RATE: u32 = 8_000;

/// Sample rate of stored recordings.
pub const WIDEBAND_RATE: u32 = 16_000;

/// Duration of one media frame.
pub const FRAME_MS: u32 = 20;

/// Samples in one 20 ms narrowband frame.
pub const FRAME_SAMPLES: usize = (NARROWBAND_RATE * FRAME_MS / 1000) as usize;

/// Number of narrowband samples in `ms` milliseconds.
pub fn ms_to_samples(ms: u32) -> usize {
    (NARROWBAND_RATE as usize * ms as usize) / 1000
}

/// Split PCM into 20 ms frames, zero-padding the tail frame.
pub fn split_frames(samples: &[i16]) -> Vec<Vec<i16>> {
    samples
        .chunks(FRAME_SAMPLES)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(FRAME_SAMPLES, 0);
            frame
        })
        .collect()
}
