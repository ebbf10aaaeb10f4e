//! WAV encode/decode via `hound`.

use crate::error::{BridgeError, Result};
use std::io::Cursor;
use std::path::Path;

fn spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn codec_err(e: hound::Error) -> BridgeError {
    BridgeError::Codec(format!("wav: {e}"))
}

/// Encode mono PCM to an in-memory WAV file.
///
/// # Errors
///
/// Returns a codec error if the writer fails.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec(sample_rate)).map_err(codec_err)?;
        for &s in samples {
            writer.write_sample(s).map_err(codec_err)?;
        }
        writer.finalize().map_err(codec_err)?;
    }
    Ok(cursor.into_inner())
}

/// Write mono PCM to a WAV file, creating parent directories.
///
/// # Errors
///
/// Returns an I/O or codec error.
pub fn write_wav_file(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = hound::WavWriter::create(path, spec(sample_rate)).map_err(codec_err)?;
    for &s in samples {
        writer.write_sample(s).map_err(codec_err)?;
    }
    writer.finalize().map_err(codec_err)
}

/// Decode a WAV file to mono 16-bit PCM and its sample rate.
///
/// Multi-channel input is downmixed by averaging. Float and 8/24/32-bit
/// integer formats are converted.
///
/// # Errors
///
/// Returns a codec error for malformed input.
pub fn decode_wav(bytes: &[u8]) -> Result<(Vec<i16>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).map_err(codec_err)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<i32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(i32::from))
            .collect::<std::result::Result<_, _>>()
            .map_err(codec_err)?,
        (hound::SampleFormat::Int, bits) => {
            let shift = i32::from(bits) - 16;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| if shift >= 0 { v >> shift } else { v << -shift }))
                .collect::<std::result::Result<_, _>>()
                .map_err(codec_err)?
        }
        (hound::SampleFormat::Float, _) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i32))
            .collect::<std::result::Result<_, _>>()
            .map_err(codec_err)?,
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().sum();
            (sum / frame.len() as i32).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
        })
        .collect();
    Ok((mono, spec.sample_rate))
}
