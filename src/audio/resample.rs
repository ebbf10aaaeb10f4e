//! Linear-interpolation resampling for mono 16-bit PCM.

use crate::error::{BridgeError, Result};

/// Resample `samples` from `in_rate` to `out_rate`.
///
/// Output length is `round(len * out_rate / in_rate)`. Equal rates return a copy.
///
/// # Errors
///
/// Returns a codec error when either rate is zero.
pub fn resample_linear(samples: &[i16], in_rate: u32, out_rate: u32) -> Result<Vec<i16>> {
    if in_rate == 0 || out_rate == 0 {
        return Err(BridgeError::Codec(format!(
            "invalid sample rate {in_rate} -> {out_rate}"
        )));
    }
    if in_rate == out_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = f64::from(out_rate) / f64::from(in_rate);
    let out_len = ((samples.len() as f64) * ratio).round() as usize;
    let last = samples.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = (i as f64) / ratio;
        let idx0 = (src.floor() as usize).min(last);
        let idx1 = (idx0 + 1).min(last);
        let frac = src - src.floor();
        let s0 = f64::from(samples[idx0]);
        let s1 = f64::from(samples[idx1]);
        let v = s0 + (s1 - s0) * frac;
        out.push(v.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn zero_rate_is_error() {
        assert!(resample_linear(&[1, 2, 3], 0, 8_000).is_err());
        assert!(resample_linear(&[1, 2, 3], 8_000, 0).is_err());
    }

    #[test]
    fn same_rate_is_identity() {
        let pcm = vec![1i16, -2, 3];
        assert_eq!(resample_linear(&pcm, 8_000, 8_000).unwrap(), pcm);
    }

    #[test]
    fn upsample_doubles_length_and_interpolates() {
        let out = resample_linear(&[0, 100, 200], 8_000, 16_000).unwrap();
        assert_eq!(out.len(), 6);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 50);
        assert_eq!(out[2], 100);
        assert_eq!(out[3], 150);
    }

    #[test]
    fn downsample_24k_to_8k() {
        let pcm: Vec<i16> = (0..480).map(|i| i as i16).collect();
        let out = resample_linear(&pcm, 24_000, 8_000).unwrap();
        assert_eq!(out.len(), 160);
        assert_eq!(out[1], 3);
    }

    #[test]
    fn tail_does_not_overrun() {
        let out = resample_linear(&[i16::MAX], 8_000, 48_000).unwrap();
        assert_eq!(out, vec![i16::MAX; 6]);
    }
}
