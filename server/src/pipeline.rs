use std::sync::Arc;
use std::time::Instant;

use lipsync_core::VisemeExtractor;
use llm_core::{build_prompt, spawn_token_pump, TokenGenerator};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Duration;
use tracing::{debug, info, warn};
use tts_core::{normalize, wav, SpeechSynthesizer};

use crate::chunker::{Chunk, Chunker, ChunkerConfig};
use crate::config::ServerConfig;
use crate::error::ProtocolError;
use crate::protocol::ServerMessage;
use crate::sequencer::{ChunkOutcome, DeliverySequencer, SynthesisResult};
use crate::session::Session;

/// Fragments buffered between the generator pump and the turn loop.
const TOKEN_CHANNEL_CAPACITY: usize = 32;
/// Synthesis completions buffered ahead of the turn loop.
const RESULT_CHANNEL_CAPACITY: usize = 32;
/// How long the wind-down phase waits for in-flight synthesis.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Shared engine handles, constructed once at startup.
pub struct Engines {
    pub generator: Arc<dyn TokenGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub extractor: Arc<dyn VisemeExtractor>,
    /// Bounds concurrent synthesis calls; the speech engine may be a
    /// single shared instance.
    pub synth_gate: Arc<Semaphore>,
}

/// Drive one user turn end to end: prompt the generator, stream tokens out
/// as they arrive, cut the stream into chunks, synthesize chunks
/// concurrently and deliver synthesized audio in sequence order.
///
/// Every outcome (completion, cancellation, timeout, engine failure) ends
/// with a terminal `done` or `error` frame on `out`. The caller owns the
/// session's busy flag.
pub async fn run_turn(
    engines: Arc<Engines>,
    config: Arc<ServerConfig>,
    session: Arc<Session>,
    user_text: String,
    speaker: String,
    out: mpsc::Sender<ServerMessage>,
) {
    let window = session.history_window(config.history_window_pairs);
    let prompt = build_prompt(&config.system_prompt, &window, &user_text);

    if out.send(ServerMessage::Started).await.is_err() {
        return;
    }
    info!(
        session_id = %session.id,
        chars = user_text.chars().count(),
        "turn started"
    );

    let mut tokens = spawn_token_pump(
        engines.generator.clone(),
        prompt,
        config.generation_params(),
        session.cancel.clone(),
        TOKEN_CHANNEL_CAPACITY,
    );
    let (result_tx, mut results) = mpsc::channel(RESULT_CHANNEL_CAPACITY);

    let mut chunker = Chunker::new(
        ChunkerConfig {
            max_tokens: config.chunk_max_tokens,
            latency: config.chunk_latency(),
            min_chars: config.chunk_min_chars,
        },
        Instant::now(),
    );
    let mut sequencer = DeliverySequencer::new();
    let deadline = tokio::time::Instant::now() + config.turn_timeout();

    let mut full_text = String::new();
    let mut inflight: usize = 0;
    let mut dispatched: u64 = 0;
    let mut cancelled = false;
    let mut generation_failed = false;

    loop {
        tokio::select! {
            item = tokens.recv() => match item {
                Some(Ok(fragment)) => {
                    if session.cancel.is_cancelled() {
                        cancelled = true;
                        break;
                    }
                    full_text.push_str(&fragment);
                    if out
                        .send(ServerMessage::Token { text: fragment.clone() })
                        .await
                        .is_err()
                    {
                        session.cancel.cancel();
                        cancelled = true;
                        break;
                    }
                    if let Some(chunk) = chunker.push(&fragment, Instant::now()) {
                        dispatch_chunk(&engines, chunk, &speaker, &config, &result_tx);
                        inflight += 1;
                        dispatched += 1;
                    }
                }
                Some(Err(e)) => {
                    warn!(session_id = %session.id, error = %e, "generation failed");
                    generation_failed = true;
                    break;
                }
                None => break,
            },
            Some((sequence, outcome)) = results.recv(), if inflight > 0 => {
                inflight -= 1;
                deliver(&mut sequencer, sequence, outcome, &out).await;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(session_id = %session.id, "turn deadline exceeded, cancelling");
                session.cancel.cancel();
                cancelled = true;
                break;
            }
        }
    }
    drop(tokens);

    // Whatever made it into the buffer still gets spoken.
    if let Some(chunk) = chunker.finish(Instant::now()) {
        dispatch_chunk(&engines, chunk, &speaker, &config, &result_tx);
        inflight += 1;
        dispatched += 1;
    }
    drop(result_tx);

    while inflight > 0 {
        match tokio::time::timeout(DRAIN_GRACE, results.recv()).await {
            Ok(Some((sequence, outcome))) => {
                inflight -= 1;
                deliver(&mut sequencer, sequence, outcome, &out).await;
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    session_id = %session.id,
                    abandoned = inflight,
                    "synthesis drain timed out"
                );
                break;
            }
        }
    }
    if !sequencer.is_drained() {
        debug!(session_id = %session.id, "sequencer still holds undeliverable results");
    }

    let cancelled = cancelled || session.cancel.is_cancelled();
    let final_text = full_text.trim().to_string();

    if generation_failed {
        session.commit_turn(&user_text, &final_text, config.history_window_pairs);
        let _ = out
            .send(ServerMessage::error(ProtocolError::GenerationFailed.code()))
            .await;
    } else {
        if !cancelled || config.commit_partial_on_cancel {
            session.commit_turn(&user_text, &final_text, config.history_window_pairs);
        }
        let _ = out
            .send(ServerMessage::Done {
                text: final_text.clone(),
            })
            .await;
    }

    info!(
        session_id = %session.id,
        chunks = dispatched,
        chars = final_text.chars().count(),
        cancelled,
        failed = generation_failed,
        "turn finished"
    );
}

/// Hand one chunk to a synthesis worker. Chunks whose speakable text is
/// empty are acknowledged as skipped so their sequence number is not
/// waited on. Exactly one outcome is sent per dispatched chunk.
fn dispatch_chunk(
    engines: &Engines,
    chunk: Chunk,
    speaker: &str,
    config: &Arc<ServerConfig>,
    results: &mpsc::Sender<(u64, ChunkOutcome)>,
) {
    let sequence = chunk.sequence;
    let results = results.clone();
    let speech_text = clean_text_for_speech(&chunk.text);
    if speech_text.is_empty() {
        debug!(sequence, "chunk has no speakable text, skipping");
        tokio::spawn(async move {
            let _ = results.send((sequence, ChunkOutcome::Skipped)).await;
        });
        return;
    }

    debug!(sequence, chars = chunk.text.len(), "dispatching chunk");
    let synthesizer = engines.synthesizer.clone();
    let extractor = engines.extractor.clone();
    let gate = engines.synth_gate.clone();
    let speaker = speaker.to_string();
    let target_rate = config.target_sample_rate;
    tokio::spawn(async move {
        let outcome = synthesize_chunk(
            synthesizer,
            extractor,
            gate,
            chunk,
            speech_text,
            speaker,
            target_rate,
        )
        .await;
        let _ = results.send((sequence, outcome)).await;
    });
}

/// Synthesize one chunk and derive its mouth cues. Any failure drops the
/// chunk (no retry) and reports a skip so delivery keeps moving.
async fn synthesize_chunk(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    extractor: Arc<dyn VisemeExtractor>,
    gate: Arc<Semaphore>,
    chunk: Chunk,
    speech_text: String,
    speaker: String,
    target_rate: u32,
) -> ChunkOutcome {
    let wav_bytes = {
        // Permit covers only the engine call; extraction for earlier
        // chunks may overlap the next synthesis.
        let _permit = match gate.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return ChunkOutcome::Skipped,
        };
        match synthesizer.synthesize(&speech_text, &speaker).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(sequence = chunk.sequence, error = %e, "synthesis failed, dropping chunk");
                return ChunkOutcome::Skipped;
            }
        }
    };

    if !wav::is_valid_wav(&wav_bytes) {
        warn!(
            sequence = chunk.sequence,
            bytes = wav_bytes.len(),
            "synthesizer returned an invalid waveform, dropping chunk"
        );
        return ChunkOutcome::Skipped;
    }

    let audio = match normalize(&wav_bytes, target_rate) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(sequence = chunk.sequence, error = %e, "normalization failed, dropping chunk");
            return ChunkOutcome::Skipped;
        }
    };

    let lipsync = match extractor.extract(&audio).await {
        Ok(report) => report,
        Err(e) => {
            warn!(sequence = chunk.sequence, error = %e, "viseme extraction failed, dropping chunk");
            return ChunkOutcome::Skipped;
        }
    };

    ChunkOutcome::Completed(SynthesisResult {
        sequence: chunk.sequence,
        text: chunk.text,
        audio,
        lipsync,
    })
}

/// Feed one completion into the sequencer and emit everything now ready.
async fn deliver(
    sequencer: &mut DeliverySequencer,
    sequence: u64,
    outcome: ChunkOutcome,
    out: &mpsc::Sender<ServerMessage>,
) {
    for result in sequencer.accept(sequence, outcome) {
        let message = ServerMessage::TtsChunk {
            text: result.text,
            audio_b64: wav::to_base64(&result.audio),
            lipsync: result.lipsync,
        };
        if out.send(message).await.is_err() {
            debug!(sequence = result.sequence, "client gone, dropping synthesized chunk");
        }
    }
}

/// Strip formatting the generator tends to produce that a speech engine
/// would read aloud. The chunk text sent over the wire is untouched; only
/// the engine input is cleaned.
fn clean_text_for_speech(text: &str) -> String {
    let mut cleaned = text.to_string();

    while let Some(start) = cleaned.find("```") {
        if let Some(end) = cleaned[start + 3..].find("```") {
            cleaned.replace_range(start..start + end + 6, "");
        } else {
            break;
        }
    }

    for marker in ["**", "__", "~~", "`", "*", "_", "#"] {
        cleaned = cleaned.replace(marker, "");
    }

    let mut result = String::with_capacity(cleaned.len());
    let mut last_was_whitespace = false;
    for ch in cleaned.chars() {
        if ch.is_whitespace() {
            if !last_was_whitespace {
                result.push(' ');
                last_was_whitespace = true;
            }
        } else {
            result.push(ch);
            last_was_whitespace = false;
        }
    }
    result.trim().to_string()
}
