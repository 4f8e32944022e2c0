use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::pipeline::run_turn;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::Session;
use crate::validation::{normalize_session_id, validate_user_text};
use crate::AppState;

/// Outbound frames buffered per connection.
const OUTBOUND_CAPACITY: usize = 64;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (out, mut outbound) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    // One writer task owns the sink, so frames are never interleaved even
    // while a turn task and this reader both produce messages.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let payload = match serde_json::to_string(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "dropping unserializable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection::new(state, out);
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                if !connection.handle_text(&text).await {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    connection.disconnect();
    drop(connection);
    writer.abort();
}

/// Per-connection dispatch state. Kept separate from the socket so the
/// protocol handling is testable over plain channels.
struct Connection {
    state: AppState,
    out: mpsc::Sender<ServerMessage>,
    session: Option<Arc<Session>>,
}

impl Connection {
    fn new(state: AppState, out: mpsc::Sender<ServerMessage>) -> Self {
        Connection {
            state,
            out,
            session: None,
        }
    }

    /// Returns false once the connection should be torn down.
    async fn handle_text(&mut self, text: &str) -> bool {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "unparseable client frame");
                return self
                    .send(ServerMessage::error(ProtocolError::BadMessage.code()))
                    .await;
            }
        };
        self.handle(message).await
    }

    async fn handle(&mut self, message: ClientMessage) -> bool {
        match message {
            ClientMessage::Hello { session_id } => {
                let id = normalize_session_id(session_id.as_deref());
                let session = self.state.sessions.attach(&id);
                info!(session_id = %id, "session attached");
                self.session = Some(session);
                self.send(ServerMessage::HelloAck { session_id: id }).await
            }
            ClientMessage::Cancel => match &self.session {
                Some(session) => {
                    session.cancel.cancel();
                    info!(session_id = %session.id, "cancel requested");
                    self.send(ServerMessage::CancelAck).await
                }
                // nothing to stop yet
                None => true,
            },
            ClientMessage::UserText { message, name } => self.user_text(message, name).await,
        }
    }

    async fn user_text(&mut self, message: String, name: Option<String>) -> bool {
        // Clients may skip hello; they share the default session.
        let session = match &self.session {
            Some(session) => session.clone(),
            None => {
                let session = self.state.sessions.attach(&normalize_session_id(None));
                self.session = Some(session.clone());
                session
            }
        };

        let text = message.trim().to_string();
        if let Err(e) = validate_user_text(&text, self.state.config.max_message_length) {
            debug!(session_id = %session.id, code = e.code(), "rejected user text");
            return self.send(ServerMessage::error(e.code())).await;
        }

        if !session.try_claim_turn() {
            return self
                .send(ServerMessage::error(ProtocolError::Busy.code()))
                .await;
        }
        session.cancel.clear();

        let speaker = match name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => self.state.config.default_speaker.clone(),
        };

        let engines = self.state.engines.clone();
        let config = self.state.config.clone();
        let out = self.out.clone();
        let turn_session = session.clone();
        tokio::spawn(async move {
            run_turn(engines, config, turn_session.clone(), text, speaker, out).await;
            turn_session.release_turn();
        });
        true
    }

    async fn send(&self, message: ServerMessage) -> bool {
        self.out.send(message).await.is_ok()
    }

    /// A dropped connection cancels whatever its session was doing.
    fn disconnect(&self) {
        if let Some(session) = &self.session {
            debug!(session_id = %session.id, "connection closed, cancelling session work");
            session.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::pipeline::Engines;
    use crate::session::SessionRegistry;
    use async_trait::async_trait;
    use lipsync_core::{ExtractError, Lipsync, VisemeExtractor};
    use llm_core::{GenerationError, GenerationParams, TokenGenerator, TokenStream};
    use tokio::sync::Semaphore;
    use tokio::time::{timeout, Duration};
    use tts_core::{SpeechSynthesizer, SynthesisError};

    struct SilentGenerator;

    #[async_trait]
    impl TokenGenerator for SilentGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<TokenStream, GenerationError> {
            Ok(Box::pin(futures_util::stream::empty()))
        }
    }

    struct SilentSynth;

    #[async_trait]
    impl SpeechSynthesizer for SilentSynth {
        async fn synthesize(&self, _text: &str, _speaker: &str) -> Result<Vec<u8>, SynthesisError> {
            Ok(Vec::new())
        }
    }

    struct SilentExtractor;

    #[async_trait]
    impl VisemeExtractor for SilentExtractor {
        async fn extract(&self, _wav: &[u8]) -> Result<Lipsync, ExtractError> {
            Ok(Lipsync::default())
        }
    }

    fn test_state() -> AppState {
        AppState {
            config: Arc::new(ServerConfig::default()),
            engines: Arc::new(Engines {
                generator: Arc::new(SilentGenerator),
                synthesizer: Arc::new(SilentSynth),
                extractor: Arc::new(SilentExtractor),
                synth_gate: Arc::new(Semaphore::new(1)),
            }),
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    fn connection(state: AppState) -> (Connection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (Connection::new(state, tx), rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn hello_attaches_and_acks() {
        let (mut connection, mut rx) = connection(test_state());

        assert!(
            connection
                .handle(ClientMessage::Hello {
                    session_id: Some("abc".into())
                })
                .await
        );

        match next_frame(&mut rx).await {
            ServerMessage::HelloAck { session_id } => assert_eq!(session_id, "abc"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(connection.session.as_ref().unwrap().id, "abc");
    }

    #[tokio::test]
    async fn malformed_json_gets_bad_message_but_keeps_connection() {
        let (mut connection, mut rx) = connection(test_state());

        assert!(connection.handle_text("{not json").await);

        match next_frame(&mut rx).await {
            ServerMessage::Error { error } => assert_eq!(error, "bad_message"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_is_ignored_before_hello_and_acked_after() {
        let (mut connection, mut rx) = connection(test_state());

        assert!(connection.handle(ClientMessage::Cancel).await);
        assert!(rx.try_recv().is_err());

        connection
            .handle(ClientMessage::Hello { session_id: None })
            .await;
        next_frame(&mut rx).await; // hello_ack

        assert!(connection.handle(ClientMessage::Cancel).await);
        assert!(matches!(next_frame(&mut rx).await, ServerMessage::CancelAck));
        assert!(connection.session.as_ref().unwrap().cancel.is_cancelled());
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let (mut connection, mut rx) = connection(test_state());

        connection
            .handle(ClientMessage::UserText {
                message: "   ".into(),
                name: None,
            })
            .await;

        match next_frame(&mut rx).await {
            ServerMessage::Error { error } => assert_eq!(error, "empty_text"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_text_is_rejected() {
        let state = test_state();
        let max = state.config.max_message_length;
        let (mut connection, mut rx) = connection(state);

        connection
            .handle(ClientMessage::UserText {
                message: "x".repeat(max + 1),
                name: None,
            })
            .await;

        match next_frame(&mut rx).await {
            ServerMessage::Error { error } => assert_eq!(error, "message_too_long"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_turn_while_busy_is_rejected() {
        let state = test_state();
        let (mut connection, mut rx) = connection(state.clone());

        connection
            .handle(ClientMessage::Hello {
                session_id: Some("abc".into()),
            })
            .await;
        next_frame(&mut rx).await; // hello_ack

        // another connection's turn holds the slot
        assert!(state.sessions.attach("abc").try_claim_turn());

        connection
            .handle(ClientMessage::UserText {
                message: "hi".into(),
                name: None,
            })
            .await;

        match next_frame(&mut rx).await {
            ServerMessage::Error { error } => assert_eq!(error, "busy"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_text_without_hello_runs_on_the_default_session() {
        let state = test_state();
        let (mut connection, mut rx) = connection(state.clone());

        connection
            .handle(ClientMessage::UserText {
                message: "hi".into(),
                name: None,
            })
            .await;

        assert!(matches!(next_frame(&mut rx).await, ServerMessage::Started));
        match next_frame(&mut rx).await {
            ServerMessage::Done { text } => assert!(text.is_empty()),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(connection.session.as_ref().unwrap().id, "default");
    }
}
