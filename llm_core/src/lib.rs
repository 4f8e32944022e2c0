pub mod prompt;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use prompt::{build_prompt, Role, Turn};

/// Errors surfaced by a token generator. Terminal for the turn, never retried.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("engine returned an error: {0}")]
    Engine(String),

    #[error("malformed engine response: {0}")]
    Decode(String),
}

/// Sampling parameters passed through to the generation engine.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 192,
            temperature: 0.7,
            top_p: 0.9,
            stop: vec!["### Instruction:".to_string()],
        }
    }
}

/// Shared cancellation flag for one session. Cloning shares the flag.
///
/// The token pump checks this between fragment emissions, so cancellation
/// takes effect within one fragment of being requested.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// A black-box source of text fragments for a prompt.
///
/// The stream is lazy, finite and non-restartable; the end of the stream is
/// the terminal sentinel. Engine failures end the stream early with an `Err`
/// item.
#[async_trait]
pub trait TokenGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, GenerationError>;
}

/// Spawn a dedicated task that owns the generator stream and forwards
/// fragments into a bounded channel read by the turn coordination flow.
///
/// The task stops without emitting further fragments once `cancel` is
/// observed. Closing the channel (receiver side) also stops it.
pub fn spawn_token_pump(
    generator: Arc<dyn TokenGenerator>,
    prompt: String,
    params: GenerationParams,
    cancel: CancelToken,
    buffer: usize,
) -> mpsc::Receiver<Result<String, GenerationError>> {
    let (tx, rx) = mpsc::channel(buffer);
    tokio::spawn(async move {
        let mut stream = match generator.generate(&prompt, &params).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                debug!("token pump stopping: cancel observed");
                break;
            }
            let failed = item.is_err();
            if tx.send(item).await.is_err() {
                debug!("token pump stopping: receiver dropped");
                break;
            }
            if failed {
                break;
            }
        }
    });
    rx
}

/// Which generation backend the client speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    /// Ollama `/api/generate` with NDJSON streaming.
    Ollama,
    /// OpenAI-compatible `/v1/completions` with SSE streaming.
    OpenAi,
}

/// Streaming completion request for the OpenAI-compatible provider.
#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stop: &'a [String],
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionChunk {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    text: String,
}

/// Streaming generate request for the Ollama provider.
#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions<'a>,
}

#[derive(Serialize)]
struct OllamaOptions<'a> {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    stop: &'a [String],
}

#[derive(Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for a streaming completion engine.
pub struct LlmClient {
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(provider: LlmProvider, base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn open_ollama(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<reqwest::Response, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaRequest {
            model: &self.model,
            prompt,
            stream: true,
            options: OllamaOptions {
                num_predict: params.max_tokens,
                temperature: params.temperature,
                top_p: params.top_p,
                stop: &params.stop,
            },
        };
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp)
    }

    async fn open_completions(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<reqwest::Response, GenerationError> {
        let url = format!("{}/v1/completions", self.base_url);
        let body = CompletionRequest {
            model: &self.model,
            prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: &params.stop,
            stream: true,
        };
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?.error_for_status()?;
        Ok(resp)
    }
}

/// Parse one NDJSON line from the Ollama stream into a fragment.
/// `Ok(None)` means the stream is finished.
fn parse_ollama_line(line: &str) -> Result<Option<String>, GenerationError> {
    let chunk: OllamaChunk =
        serde_json::from_str(line).map_err(|e| GenerationError::Decode(e.to_string()))?;
    if let Some(err) = chunk.error {
        return Err(GenerationError::Engine(err));
    }
    if chunk.done && chunk.response.is_empty() {
        return Ok(None);
    }
    Ok(Some(chunk.response))
}

/// Parse one SSE data line from an OpenAI-compatible stream.
/// `Ok(None)` means the `[DONE]` marker was seen.
fn parse_sse_line(line: &str) -> Result<Option<String>, GenerationError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(Some(String::new()));
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    let chunk: CompletionChunk =
        serde_json::from_str(data).map_err(|e| GenerationError::Decode(e.to_string()))?;
    let text = chunk
        .choices
        .first()
        .map(|c| c.text.clone())
        .unwrap_or_default();
    Ok(Some(text))
}

#[async_trait]
impl TokenGenerator for LlmClient {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<TokenStream, GenerationError> {
        let provider = self.provider;
        let resp = match provider {
            LlmProvider::Ollama => self.open_ollama(prompt, params).await?,
            LlmProvider::OpenAi => self.open_completions(prompt, params).await?,
        };
        debug!(?provider, model = %self.model, "generation stream opened");

        let stream = try_stream! {
            let mut bytes = resp.bytes_stream();
            let mut pending = String::new();
            'outer: while let Some(piece) = bytes.next().await {
                let piece = piece?;
                pending.push_str(&String::from_utf8_lossy(&piece));
                while let Some(nl) = pending.find('\n') {
                    let line: String = pending.drain(..=nl).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let parsed = match provider {
                        LlmProvider::Ollama => parse_ollama_line(line)?,
                        LlmProvider::OpenAi => parse_sse_line(line)?,
                    };
                    match parsed {
                        Some(text) => {
                            if !text.is_empty() {
                                yield text;
                            }
                        }
                        None => break 'outer,
                    }
                }
            }
            if !pending.trim().is_empty() {
                warn!("generation stream ended with unparsed trailing data");
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_line_yields_fragment() {
        let out = parse_ollama_line(r#"{"response":"Hi","done":false}"#).unwrap();
        assert_eq!(out.as_deref(), Some("Hi"));
    }

    #[test]
    fn ollama_done_ends_stream() {
        let out = parse_ollama_line(r#"{"response":"","done":true}"#).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn ollama_error_is_terminal() {
        let err = parse_ollama_line(r#"{"error":"model not found"}"#).unwrap_err();
        assert!(matches!(err, GenerationError::Engine(_)));
    }

    #[test]
    fn sse_line_yields_fragment() {
        let out = parse_sse_line(r#"data: {"choices":[{"text":" there"}]}"#).unwrap();
        assert_eq!(out.as_deref(), Some(" there"));
    }

    #[test]
    fn sse_done_marker_ends_stream() {
        assert!(parse_sse_line("data: [DONE]").unwrap().is_none());
    }

    #[test]
    fn garbage_line_is_decode_error() {
        let err = parse_ollama_line("not json").unwrap_err();
        assert!(matches!(err, GenerationError::Decode(_)));
    }

    #[tokio::test]
    async fn pump_forwards_fragments_then_closes() {
        struct Scripted;

        #[async_trait]
        impl TokenGenerator for Scripted {
            async fn generate(
                &self,
                _prompt: &str,
                _params: &GenerationParams,
            ) -> Result<TokenStream, GenerationError> {
                let frags = vec!["Hi".to_string(), " there".to_string(), ".".to_string()];
                Ok(Box::pin(tokio_stream::iter(frags.into_iter().map(Ok))))
            }
        }

        let mut rx = spawn_token_pump(
            Arc::new(Scripted),
            "p".into(),
            GenerationParams::default(),
            CancelToken::new(),
            8,
        );
        let mut got = Vec::new();
        while let Some(item) = rx.recv().await {
            got.push(item.unwrap());
        }
        assert_eq!(got, vec!["Hi", " there", "."]);
    }

    #[tokio::test]
    async fn pump_stops_after_cancel() {
        struct Endless;

        #[async_trait]
        impl TokenGenerator for Endless {
            async fn generate(
                &self,
                _prompt: &str,
                _params: &GenerationParams,
            ) -> Result<TokenStream, GenerationError> {
                let stream = try_stream! {
                    loop {
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        yield "tok ".to_string();
                    }
                };
                Ok(Box::pin(stream))
            }
        }

        let cancel = CancelToken::new();
        let mut rx = spawn_token_pump(
            Arc::new(Endless),
            "p".into(),
            GenerationParams::default(),
            cancel.clone(),
            1,
        );
        let first = rx.recv().await;
        assert!(first.is_some());
        cancel.cancel();
        // One buffered fragment plus one blocked send may still drain,
        // then the channel closes because the pump stopped.
        let mut after = 0;
        while rx.recv().await.is_some() {
            after += 1;
        }
        assert!(after <= 2, "pump kept emitting after cancel: {after}");
    }

    #[tokio::test]
    async fn pump_surfaces_terminal_error() {
        struct Failing;

        #[async_trait]
        impl TokenGenerator for Failing {
            async fn generate(
                &self,
                _prompt: &str,
                _params: &GenerationParams,
            ) -> Result<TokenStream, GenerationError> {
                let stream = try_stream! {
                    yield "partial".to_string();
                    Err::<(), _>(GenerationError::Engine("boom".into()))?;
                };
                Ok(Box::pin(stream))
            }
        }

        let mut rx = spawn_token_pump(
            Arc::new(Failing),
            "p".into(),
            GenerationParams::default(),
            CancelToken::new(),
            8,
        );
        assert_eq!(rx.recv().await.unwrap().unwrap(), "partial");
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
    }
}
