//! Viseme timing extraction from normalized waveforms.
//!
//! The production extractor shells out to the Rhubarb Lip Sync CLI and
//! parses its JSON report. The mouth cue shapes are the Preston Blair set
//! (A through H, X for silence), each cue spanning a start/end time in
//! seconds.

use std::env;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};
use uuid::Uuid;

/// Minimum byte length of a parseable WAV file (header alone).
const MIN_WAV_BYTES: usize = 44;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extractor executable not found: {0}")]
    ToolMissing(String),

    #[error("extractor failed: {0}")]
    Tool(String),

    #[error("malformed audio: {0}")]
    MalformedAudio(String),

    #[error("malformed extractor output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One timed mouth shape. `value` is a single-letter shape label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouthCue {
    pub start: f32,
    pub end: f32,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LipsyncMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_file: Option<String>,
    #[serde(default)]
    pub duration: f32,
}

/// A full viseme timeline as produced by the extractor, passed through to
/// the client untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lipsync {
    #[serde(default)]
    pub metadata: LipsyncMetadata,
    #[serde(rename = "mouthCues", default)]
    pub mouth_cues: Vec<MouthCue>,
}

/// A black-box lipsync engine: normalized waveform in, timed cues out.
#[async_trait]
pub trait VisemeExtractor: Send + Sync {
    /// Derive mouth cues from a mono 16-bit PCM WAV. Fails with a declared
    /// error on malformed audio; never retried by callers.
    async fn extract(&self, wav: &[u8]) -> Result<Lipsync, ExtractError>;
}

/// Extractor invoking the Rhubarb Lip Sync CLI over temp files.
pub struct RhubarbExtractor {
    exe: PathBuf,
}

impl RhubarbExtractor {
    /// Resolve the executable from `bin_dir` first, then PATH. A missing
    /// binary is an error here so startup can fail fast.
    pub fn discover(bin_dir: &Path) -> Result<Self, ExtractError> {
        let name = if cfg!(windows) { "rhubarb.exe" } else { "rhubarb" };
        let local = bin_dir.join(name);
        if local.is_file() {
            debug!(exe = %local.display(), "using bundled rhubarb");
            return Ok(Self { exe: local });
        }
        if let Some(paths) = env::var_os("PATH") {
            for dir in env::split_paths(&paths) {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    debug!(exe = %candidate.display(), "using rhubarb from PATH");
                    return Ok(Self { exe: candidate });
                }
            }
        }
        Err(ExtractError::ToolMissing(format!(
            "put {name} in {} or install it on PATH",
            bin_dir.display()
        )))
    }

    pub fn with_exe(exe: PathBuf) -> Self {
        Self { exe }
    }
}

#[async_trait]
impl VisemeExtractor for RhubarbExtractor {
    async fn extract(&self, wav: &[u8]) -> Result<Lipsync, ExtractError> {
        if wav.len() < MIN_WAV_BYTES {
            return Err(ExtractError::MalformedAudio(format!(
                "waveform too short ({} bytes)",
                wav.len()
            )));
        }

        let id = Uuid::new_v4();
        let wav_path = env::temp_dir().join(format!("lipsync-{id}.wav"));
        let json_path = env::temp_dir().join(format!("lipsync-{id}.json"));
        tokio::fs::write(&wav_path, wav).await?;

        let result = run_rhubarb(&self.exe, &wav_path, &json_path).await;

        let _ = tokio::fs::remove_file(&wav_path).await;
        let _ = tokio::fs::remove_file(&json_path).await;
        result
    }
}

async fn run_rhubarb(
    exe: &Path,
    wav_path: &Path,
    json_path: &Path,
) -> Result<Lipsync, ExtractError> {
    let output = Command::new(exe)
        .arg("-f")
        .arg("json")
        .arg("-o")
        .arg(json_path)
        .arg(wav_path)
        .arg("-r")
        .arg("phonetic")
        .output()
        .await
        .map_err(|e| ExtractError::ToolMissing(format!("failed to run {}: {e}", exe.display())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(status = %output.status, "rhubarb failed: {}", stderr.trim());
        return Err(ExtractError::Tool(format!(
            "rhubarb exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let text = tokio::fs::read_to_string(json_path).await?;
    if text.trim().is_empty() {
        return Err(ExtractError::Tool("rhubarb produced no JSON output".into()));
    }
    let lipsync: Lipsync = serde_json::from_str(&text)?;
    debug!(cues = lipsync.mouth_cues.len(), "extracted mouth cues");
    Ok(lipsync)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REPORT: &str = r#"{
        "metadata": { "soundFile": "chunk.wav", "duration": 1.25 },
        "mouthCues": [
            { "start": 0.00, "end": 0.35, "value": "X" },
            { "start": 0.35, "end": 0.60, "value": "B" },
            { "start": 0.60, "end": 1.25, "value": "A" }
        ]
    }"#;

    #[test]
    fn parses_extractor_report() {
        let lipsync: Lipsync = serde_json::from_str(SAMPLE_REPORT).unwrap();
        assert_eq!(lipsync.metadata.sound_file.as_deref(), Some("chunk.wav"));
        assert_eq!(lipsync.mouth_cues.len(), 3);
        assert_eq!(lipsync.mouth_cues[1].value, "B");
        // Cue order from the report is preserved.
        assert!(lipsync.mouth_cues.windows(2).all(|w| w[0].start <= w[1].start));
    }

    #[test]
    fn serializes_with_camel_case_cues() {
        let lipsync: Lipsync = serde_json::from_str(SAMPLE_REPORT).unwrap();
        let json = serde_json::to_value(&lipsync).unwrap();
        assert!(json.get("mouthCues").is_some());
        assert!(json["metadata"].get("soundFile").is_some());
    }

    #[tokio::test]
    async fn short_waveform_is_rejected_before_running_the_tool() {
        let extractor = RhubarbExtractor::with_exe(PathBuf::from("/nonexistent/rhubarb"));
        let err = extractor.extract(&[0u8; 10]).await.unwrap_err();
        assert!(matches!(err, ExtractError::MalformedAudio(_)));
    }

    #[test]
    fn discover_fails_without_binary() {
        let dir = env::temp_dir().join(format!("no-bin-{}", Uuid::new_v4()));
        let prev = env::var_os("PATH");
        env::set_var("PATH", &dir);
        let result = RhubarbExtractor::discover(&dir);
        match prev {
            Some(p) => env::set_var("PATH", p),
            None => env::remove_var("PATH"),
        }
        assert!(matches!(result, Err(ExtractError::ToolMissing(_))));
    }
}
