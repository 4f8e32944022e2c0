use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Fragment count at which a buffer flushes regardless of content.
    pub max_tokens: usize,
    /// Elapsed time after which a buffer flushes once it has enough text.
    pub latency: Duration,
    /// Minimum buffered characters for a latency flush.
    pub min_chars: usize,
}

/// A span of generated text grouped for one synthesis call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence: u64,
    pub text: String,
    pub is_final: bool,
}

/// Accumulates token fragments and cuts them into chunks at sentence
/// boundaries, falling back to a fragment-count bound and a latency bound.
/// Chunk text is exactly the buffered fragments in arrival order.
pub struct Chunker {
    config: ChunkerConfig,
    buffer: String,
    fragments: usize,
    last_flush: Instant,
    next_sequence: u64,
}

impl Chunker {
    pub fn new(config: ChunkerConfig, now: Instant) -> Self {
        Chunker {
            config,
            buffer: String::new(),
            fragments: 0,
            last_flush: now,
            next_sequence: 0,
        }
    }

    /// Append one fragment, flushing the buffer if a cut point is reached.
    pub fn push(&mut self, fragment: &str, now: Instant) -> Option<Chunk> {
        if fragment.is_empty() {
            return None;
        }
        self.buffer.push_str(fragment);
        self.fragments += 1;

        if self.should_flush(now) {
            return Some(self.flush(now, false));
        }
        None
    }

    /// Emit whatever is still buffered as the final chunk of the turn.
    pub fn finish(&mut self, now: Instant) -> Option<Chunk> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.flush(now, true))
    }

    fn should_flush(&self, now: Instant) -> bool {
        if self.fragments >= self.config.max_tokens {
            return true;
        }
        if ends_sentence(&self.buffer) {
            return true;
        }
        now.duration_since(self.last_flush) > self.config.latency
            && self.buffer.chars().count() > self.config.min_chars
    }

    fn flush(&mut self, now: Instant, is_final: bool) -> Chunk {
        let text = std::mem::take(&mut self.buffer);
        self.fragments = 0;
        self.last_flush = now;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Chunk {
            sequence,
            text,
            is_final,
        }
    }
}

/// True when the buffer ends in `.`, `!` or `?` trailed only by whitespace.
/// A period mid-word (decimals, abbreviations) does not count.
fn ends_sentence(buffer: &str) -> bool {
    matches!(buffer.trim_end().chars().last(), Some('.' | '!' | '?'))
}
