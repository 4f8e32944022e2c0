use lipsync_core::Lipsync;
use serde::{Deserialize, Serialize};

/// Messages the client may send. Unknown `type` tags fail deserialization
/// and are answered with a `bad_message` error.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        #[serde(default)]
        session_id: Option<String>,
    },
    Cancel,
    UserText {
        message: String,
        #[serde(default)]
        name: Option<String>,
    },
}

/// Messages the server emits. `TtsChunk` frames carry the synthesized audio
/// inline so the client never needs a second fetch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HelloAck { session_id: String },
    CancelAck,
    Started,
    Token { text: String },
    TtsChunk {
        text: String,
        audio_b64: String,
        lipsync: Lipsync,
    },
    Done { text: String },
    Error { error: String },
}

impl ServerMessage {
    pub fn error(code: &str) -> Self {
        ServerMessage::Error {
            error: code.to_string(),
        }
    }
}
