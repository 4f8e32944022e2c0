use thiserror::Error;

/// Protocol-level failures on the WebSocket boundary. Each maps to a stable
/// reason code carried in the outbound `error` message; the turn (or just
/// the offending message) is affected, never the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message text is empty")]
    EmptyText,

    #[error("message text exceeds the configured maximum length")]
    MessageTooLong,

    #[error("a turn is already in flight for this session")]
    Busy,

    #[error("no session attached to this connection")]
    NoSession,

    #[error("malformed or unknown message")]
    BadMessage,

    #[error("token generation failed")]
    GenerationFailed,
}

impl ProtocolError {
    /// Stable reason code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::EmptyText => "empty_text",
            ProtocolError::MessageTooLong => "message_too_long",
            ProtocolError::Busy => "busy",
            ProtocolError::NoSession => "no_session",
            ProtocolError::BadMessage => "bad_message",
            ProtocolError::GenerationFailed => "generation_failed",
        }
    }
}
