//! Conversation turns and the instruction-style prompt template.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation entry. Immutable once appended to a session history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Render the prompt for one turn: system preamble, the recent history
/// window as `### Instruction:` / `### Response:` lines, then the new user
/// message with a trailing response cue for the engine to complete.
///
/// The caller passes only the turns that should influence generation; this
/// function applies no windowing of its own.
pub fn build_prompt(system: &str, window: &[Turn], user_text: &str) -> String {
    let mut lines = Vec::with_capacity(window.len() + 2);
    let system = system.trim();
    if !system.is_empty() {
        lines.push(system.to_string());
    }
    for turn in window {
        match turn.role {
            Role::User => lines.push(format!("### Instruction: {}", turn.content)),
            Role::Assistant => lines.push(format!("### Response: {}", turn.content)),
        }
    }
    lines.push(format!("### Instruction: {user_text}\n### Response:"));
    lines.join("\n")
}
