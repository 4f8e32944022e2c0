// Configuration constants for the streaming speech server

use std::path::PathBuf;
use std::time::Duration;

use llm_core::GenerationParams;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly voice assistant. \
Only small talk. Keep replies short and conversational. \
If asked complex things, say you only chat casually.";

#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,

    pub llm_provider: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,
    pub llm_top_p: f32,
    pub system_prompt: String,

    pub chunk_max_tokens: usize,
    pub chunk_latency_ms: u64,
    pub chunk_min_chars: usize,

    pub history_window_pairs: usize,
    pub synth_max_inflight: usize,
    pub turn_timeout_secs: u64,
    pub max_message_length: usize,

    pub target_sample_rate: u32,
    pub tts_voice: String,
    pub tts_rate_wpm: u32,
    pub default_speaker: String,
    pub rhubarb_bin_dir: PathBuf,

    pub commit_partial_on_cancel: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            request_timeout_secs: 30,
            cors_allowed_origins: None,

            llm_provider: "ollama".into(),
            llm_base_url: "http://localhost:11434".into(),
            llm_model: "tinyllama".into(),
            llm_api_key: None,
            llm_max_tokens: 192,
            llm_temperature: 0.7,
            llm_top_p: 0.9,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),

            chunk_max_tokens: 12,
            chunk_latency_ms: 500,
            chunk_min_chars: 6,

            history_window_pairs: 2,
            synth_max_inflight: 1,
            turn_timeout_secs: 120,
            max_message_length: 2000,

            target_sample_rate: tts_core::TARGET_SAMPLE_RATE,
            tts_voice: "en".into(),
            tts_rate_wpm: 135,
            default_speaker: "female".into(),
            rhubarb_bin_dir: PathBuf::from("bin"),

            commit_partial_on_cancel: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS").ok().and_then(|origins| {
            if origins.trim() == "*" || origins.trim().is_empty() {
                None
            } else {
                Some(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
        });

        let llm_api_key = std::env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty());

        let commit_partial_on_cancel = std::env::var("COMMIT_PARTIAL_ON_CANCEL")
            .ok()
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(defaults.commit_partial_on_cancel);

        Self {
            port: env_parse("PORT", defaults.port),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            cors_allowed_origins,

            llm_provider: env_string("LLM_PROVIDER", &defaults.llm_provider),
            llm_base_url: env_string("LLM_BASE_URL", &defaults.llm_base_url),
            llm_model: env_string("LLM_MODEL", &defaults.llm_model),
            llm_api_key,
            llm_max_tokens: env_parse("LLM_MAX_TOKENS", defaults.llm_max_tokens),
            llm_temperature: env_parse("LLM_TEMPERATURE", defaults.llm_temperature),
            llm_top_p: env_parse("LLM_TOP_P", defaults.llm_top_p),
            system_prompt: env_string("SYSTEM_PROMPT", &defaults.system_prompt),

            chunk_max_tokens: env_parse("CHUNK_MAX_TOKENS", defaults.chunk_max_tokens),
            chunk_latency_ms: env_parse("CHUNK_LATENCY_MS", defaults.chunk_latency_ms),
            chunk_min_chars: env_parse("CHUNK_MIN_CHARS", defaults.chunk_min_chars),

            history_window_pairs: env_parse("HISTORY_WINDOW_PAIRS", defaults.history_window_pairs),
            synth_max_inflight: env_parse("SYNTH_MAX_INFLIGHT", defaults.synth_max_inflight).max(1),
            turn_timeout_secs: env_parse("TURN_TIMEOUT_SECS", defaults.turn_timeout_secs),
            max_message_length: env_parse("MAX_MESSAGE_LENGTH", defaults.max_message_length),

            target_sample_rate: env_parse("TARGET_SAMPLE_RATE", defaults.target_sample_rate),
            tts_voice: env_string("TTS_VOICE", &defaults.tts_voice),
            tts_rate_wpm: env_parse("TTS_RATE_WPM", defaults.tts_rate_wpm),
            default_speaker: env_string("TTS_SPEAKER", &defaults.default_speaker),
            rhubarb_bin_dir: PathBuf::from(env_string(
                "RHUBARB_BIN_DIR",
                &defaults.rhubarb_bin_dir.to_string_lossy(),
            )),

            commit_partial_on_cancel,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn chunk_latency(&self) -> Duration {
        Duration::from_millis(self.chunk_latency_ms)
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.llm_max_tokens,
            temperature: self.llm_temperature,
            top_p: self.llm_top_p,
            ..GenerationParams::default()
        }
    }
}
