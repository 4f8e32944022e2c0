//! WAV parsing, validity checks and 16-bit PCM encoding.

use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::SynthesisError;

/// Smallest possible RIFF/WAVE file: header alone, no samples.
pub const MIN_WAV_BYTES: usize = 44;

/// Cheap validity check used before handing a waveform to the viseme
/// extractor: minimum byte length and a parseable header.
pub fn is_valid_wav(bytes: &[u8]) -> bool {
    bytes.len() >= MIN_WAV_BYTES && WavReader::new(Cursor::new(bytes)).is_ok()
}

pub fn read_spec(bytes: &[u8]) -> Result<WavSpec, SynthesisError> {
    let reader = WavReader::new(Cursor::new(bytes))?;
    Ok(reader.spec())
}

/// Decode any supported WAV into interleaved 16-bit samples, converting
/// bit depth as needed (shift for integer formats, clamp-scale for float).
pub fn decode_samples(bytes: &[u8]) -> Result<(WavSpec, Vec<i16>), SynthesisError> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        SampleFormat::Int => {
            let shift = spec.bits_per_sample as i32 - 16;
            reader
                .samples::<i32>()
                .map(|s| {
                    s.map(|v| {
                        if shift >= 0 {
                            (v >> shift) as i16
                        } else {
                            (v << -shift) as i16
                        }
                    })
                })
                .collect::<Result<Vec<i16>, _>>()?
        }
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(f32_to_i16))
            .collect::<Result<Vec<i16>, _>>()?,
    };
    Ok((spec, samples))
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Encode mono 16-bit PCM samples as WAV bytes.
pub fn encode_pcm16_mono(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, SynthesisError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Standard base64 of raw bytes, used for the wire payload.
pub fn to_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}
