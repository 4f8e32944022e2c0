pub mod normalize;
pub mod wav;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub use normalize::{normalize, TARGET_SAMPLE_RATE};

/// Errors from the speech engine or waveform handling. A failed chunk is
/// dropped by the caller, never retried.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("speech engine unavailable: {0}")]
    EngineMissing(String),

    #[error("speech engine failed: {0}")]
    EngineFailed(String),

    #[error("malformed wav: {0}")]
    Wav(#[from] hound::Error),

    #[error("resample failed: {0}")]
    Resample(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A black-box text-to-speech engine: text in, raw WAV bytes out.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Produce raw WAV bytes for `text` using a voice chosen from the
    /// speaker hint. Empty or whitespace-only input returns empty bytes
    /// without invoking the engine.
    async fn synthesize(&self, text: &str, speaker: &str) -> Result<Vec<u8>, SynthesisError>;
}

/// Speaker hints that select the female voice variant.
const FEMALE_SPEAKERS: &[&str] = &["female", "tessa", "alice"];

/// Synthesizer backed by the system `espeak-ng` command.
///
/// Requires espeak-ng to be installed:
/// - macOS: `brew install espeak-ng`
/// - Linux: `apt-get install espeak-ng`
pub struct EspeakSynthesizer {
    voice: String,
    rate_wpm: u32,
}

impl EspeakSynthesizer {
    /// `voice` is the espeak base voice (e.g. "en", "en-us"); `rate_wpm` is
    /// the speaking rate in words per minute.
    pub fn new(voice: &str, rate_wpm: u32) -> Self {
        Self {
            voice: voice.to_string(),
            rate_wpm,
        }
    }

    /// Check that the engine is runnable. Called once at startup so a
    /// missing backend fails the process fast instead of degrading to a
    /// silent transcript.
    pub async fn probe(&self) -> Result<(), SynthesisError> {
        let output = Command::new("espeak-ng")
            .arg("--version")
            .output()
            .await
            .map_err(|e| {
                SynthesisError::EngineMissing(format!(
                    "failed to run espeak-ng: {e}. Install with: brew install espeak-ng (macOS) \
                     or apt-get install espeak-ng (Linux)"
                ))
            })?;
        if !output.status.success() {
            return Err(SynthesisError::EngineMissing(format!(
                "espeak-ng --version exited with {}",
                output.status
            )));
        }
        debug!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "espeak-ng probe ok"
        );
        Ok(())
    }

    /// Map a speaker hint onto an espeak voice variant. Hints in the female
    /// set get the `+f3` variant, everything else `+m3`.
    fn voice_for(&self, speaker: &str) -> String {
        let hint = speaker.trim().to_lowercase();
        if FEMALE_SPEAKERS.contains(&hint.as_str()) {
            format!("{}+f3", self.voice)
        } else {
            format!("{}+m3", self.voice)
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for EspeakSynthesizer {
    async fn synthesize(&self, text: &str, speaker: &str) -> Result<Vec<u8>, SynthesisError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let voice = self.voice_for(speaker);
        let output = Command::new("espeak-ng")
            .args(["--stdout", "-v", &voice, "-s", &self.rate_wpm.to_string(), "--", text])
            .output()
            .await
            .map_err(|e| SynthesisError::EngineMissing(format!("failed to run espeak-ng: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SynthesisError::EngineFailed(format!(
                "espeak-ng exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        debug!(bytes = output.stdout.len(), %voice, "synthesized chunk");
        Ok(output.stdout)
    }
}
