use std::collections::BTreeMap;

use lipsync_core::Lipsync;
use tracing::debug;

/// Synthesized audio for one chunk, ready for delivery.
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub sequence: u64,
    pub text: String,
    /// Normalized mono 16-bit WAV bytes.
    pub audio: Vec<u8>,
    pub lipsync: Lipsync,
}

/// What became of a dispatched chunk. Skips reserve their sequence number
/// so delivery never stalls waiting for audio that will not arrive.
#[derive(Debug)]
pub enum ChunkOutcome {
    Completed(SynthesisResult),
    Skipped,
}

/// Re-orders worker completions into strict sequence order. Results are
/// buffered until every earlier sequence number has either been emitted
/// or explicitly skipped.
pub struct DeliverySequencer {
    cursor: u64,
    pending: BTreeMap<u64, ChunkOutcome>,
}

impl DeliverySequencer {
    pub fn new() -> Self {
        DeliverySequencer {
            cursor: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Record one completion and return every result that is now
    /// deliverable, in sequence order.
    pub fn accept(&mut self, sequence: u64, outcome: ChunkOutcome) -> Vec<SynthesisResult> {
        if sequence < self.cursor {
            debug!(sequence, cursor = self.cursor, "dropping stale completion");
            return Vec::new();
        }
        self.pending.insert(sequence, outcome);

        let mut ready = Vec::new();
        while let Some(outcome) = self.pending.remove(&self.cursor) {
            if let ChunkOutcome::Completed(result) = outcome {
                ready.push(result);
            }
            self.cursor += 1;
        }
        ready
    }

    /// True once every accepted completion has been drained.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for DeliverySequencer {
    fn default() -> Self {
        DeliverySequencer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lipsync_core::LipsyncMetadata;

    fn result(sequence: u64) -> SynthesisResult {
        SynthesisResult {
            sequence,
            text: format!("chunk {sequence}"),
            audio: vec![0; 4],
            lipsync: Lipsync {
                metadata: LipsyncMetadata {
                    sound_file: None,
                    duration: 0.0,
                },
                mouth_cues: Vec::new(),
            },
        }
    }

    fn sequences(results: &[SynthesisResult]) -> Vec<u64> {
        results.iter().map(|r| r.sequence).collect()
    }

    #[test]
    fn early_completion_waits_for_its_predecessor() {
        let mut sequencer = DeliverySequencer::new();

        let ready = sequencer.accept(1, ChunkOutcome::Completed(result(1)));
        assert!(ready.is_empty());

        let ready = sequencer.accept(0, ChunkOutcome::Completed(result(0)));
        assert_eq!(sequences(&ready), [0, 1]);
        assert!(sequencer.is_drained());
    }

    #[test]
    fn skipped_sequence_passes_through() {
        let mut sequencer = DeliverySequencer::new();

        let ready = sequencer.accept(0, ChunkOutcome::Completed(result(0)));
        assert_eq!(sequences(&ready), [0]);

        let ready = sequencer.accept(2, ChunkOutcome::Completed(result(2)));
        assert!(ready.is_empty());

        let ready = sequencer.accept(1, ChunkOutcome::Skipped);
        assert_eq!(sequences(&ready), [2]);
    }

    #[test]
    fn skip_arriving_first_does_not_block_delivery() {
        let mut sequencer = DeliverySequencer::new();

        assert!(sequencer.accept(1, ChunkOutcome::Skipped).is_empty());
        let ready = sequencer.accept(0, ChunkOutcome::Completed(result(0)));
        assert_eq!(sequences(&ready), [0]);

        let ready = sequencer.accept(2, ChunkOutcome::Completed(result(2)));
        assert_eq!(sequences(&ready), [2]);
    }

    #[test]
    fn stale_completions_are_ignored() {
        let mut sequencer = DeliverySequencer::new();
        sequencer.accept(0, ChunkOutcome::Completed(result(0)));

        let ready = sequencer.accept(0, ChunkOutcome::Completed(result(0)));
        assert!(ready.is_empty());
        assert!(sequencer.is_drained());
    }
}
