//! Waveform normalization for the viseme extractor: mono, 16-bit PCM, fixed
//! sample rate.

use hound::SampleFormat;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

use crate::wav;
use crate::SynthesisError;

pub const TARGET_SAMPLE_RATE: u32 = 22_050;

/// Convert arbitrary WAV bytes to mono 16-bit PCM at `target_rate`.
///
/// Input that is already in the target encoding is returned unchanged, so
/// normalizing twice is byte-identical to normalizing once.
pub fn normalize(wav_bytes: &[u8], target_rate: u32) -> Result<Vec<u8>, SynthesisError> {
    let spec = wav::read_spec(wav_bytes)?;
    if spec.channels == 1
        && spec.bits_per_sample == 16
        && spec.sample_format == SampleFormat::Int
        && spec.sample_rate == target_rate
    {
        return Ok(wav_bytes.to_vec());
    }

    let (spec, samples) = wav::decode_samples(wav_bytes)?;
    let mono = downmix(&samples, spec.channels as usize);
    let mono = if spec.sample_rate != target_rate {
        debug!(
            from = spec.sample_rate,
            to = target_rate,
            frames = mono.len(),
            "resampling waveform"
        );
        resample_mono(&mono, spec.sample_rate, target_rate)?
    } else {
        mono
    };
    wav::encode_pcm16_mono(&mono, target_rate)
}

/// Collapse interleaved frames to mono by averaging the channels.
fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// One-shot mono resample. Feeds fixed-size zero-padded chunks through a
/// sinc resampler and trims the padded tail proportionally.
fn resample_mono(input: &[i16], from: u32, to: u32) -> Result<Vec<i16>, SynthesisError> {
    if input.is_empty() || from == to {
        return Ok(input.to_vec());
    }

    let ratio = to as f64 / from as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let chunk_size = 1024;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| SynthesisError::Resample(e.to_string()))?;

    let scale = 1.0 / i16::MAX as f32;
    let mut output: Vec<i16> = Vec::with_capacity((input.len() as f64 * ratio) as usize + chunk_size);
    let mut offset = 0;
    while offset < input.len() {
        let take = (input.len() - offset).min(chunk_size);
        let mut frame = vec![0.0f32; chunk_size];
        for (dst, &src) in frame.iter_mut().zip(&input[offset..offset + take]) {
            *dst = src as f32 * scale;
        }
        let planar = resampler
            .process(&[frame], None)
            .map_err(|e| SynthesisError::Resample(e.to_string()))?;
        let produced = planar[0].len();
        // Last chunk is zero-padded; keep only the part matching real input.
        let keep = if take < chunk_size {
            ((take as f64) * ratio).ceil() as usize
        } else {
            produced
        };
        output.extend(planar[0][..keep.min(produced)].iter().map(|&s| wav::f32_to_i16(s)));
        offset += take;
    }
    Ok(output)
}
