//! Batch planning
//!
//! Packs an ordered token run into fixed-capacity batches for submission
//! to the model. Positions are assigned contiguously from a start cursor;
//! only the final entry of the final batch may request logits.

/// Token id as the backend reports it.
pub type Token = i32;

/// One slot in a submission batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: Token,
    pub pos: u32,
    /// Sequence id; this controller drives a single sequence.
    pub seq: i32,
    /// Whether the model should produce an output distribution for this
    /// entry. Requested only once, at the end of a prompt or for the
    /// single token of a decode step.
    pub wants_output: bool,
}

/// An ordered run of entries, at most `batch_limit` long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Plans bounded batches for a single-sequence session.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    batch_limit: usize,
}

impl BatchBuilder {
    pub fn new(batch_limit: usize) -> Self {
        debug_assert!(batch_limit > 0);
        Self { batch_limit }
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Builds one batch from a chunk that already fits the limit.
    /// `wants_output` marks the final entry only.
    pub fn single(&self, chunk: &[Token], start: u32, wants_output: bool) -> Batch {
        debug_assert!(chunk.len() <= self.batch_limit);
        let entries = chunk
            .iter()
            .enumerate()
            .map(|(i, &token)| BatchEntry {
                token,
                pos: start + i as u32,
                seq: 0,
                wants_output: wants_output && i == chunk.len() - 1,
            })
            .collect();
        Batch { entries }
    }

    /// Partitions `tokens` into `ceil(n / batch_limit)` batches with
    /// positions `start + index`. When `last_wants_output` is set, only
    /// the final entry of the final batch requests logits.
    pub fn plan(&self, tokens: &[Token], start: u32, last_wants_output: bool) -> Vec<Batch> {
        let n = tokens.len();
        tokens
            .chunks(self.batch_limit)
            .scan(0usize, |offset, chunk| {
                let chunk_start = start + *offset as u32;
                *offset += chunk.len();
                let is_last = *offset == n;
                Some(self.single(chunk, chunk_start, last_wants_output && is_last))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_batch_count_and_positions() {
        let builder = BatchBuilder::new(4);
        let tokens: Vec<Token> = (100..110).collect(); // 10 tokens
        let batches = builder.plan(&tokens, 0, true);

        // ceil(10 / 4) = 3 batches of 4, 4, 2
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 4);
        assert_eq!(batches[1].len(), 4);
        assert_eq!(batches[2].len(), 2);

        let flat: Vec<&BatchEntry> = batches.iter().flat_map(|b| b.entries()).collect();
        for (i, entry) in flat.iter().enumerate() {
            assert_eq!(entry.token, tokens[i]);
            assert_eq!(entry.pos, i as u32);
            assert_eq!(entry.seq, 0);
        }

        // Only the very last entry requests output
        let outputs: Vec<bool> = flat.iter().map(|e| e.wants_output).collect();
        assert_eq!(outputs.iter().filter(|&&w| w).count(), 1);
        assert!(outputs[9]);
    }

    #[test]
    fn test_plan_without_output_request() {
        let builder = BatchBuilder::new(3);
        let tokens: Vec<Token> = (0..7).collect();
        let batches = builder.plan(&tokens, 5, false);
        assert_eq!(batches.len(), 3);
        assert!(batches
            .iter()
            .flat_map(|b| b.entries())
            .all(|e| !e.wants_output));
        assert_eq!(batches[0].entries()[0].pos, 5);
        assert_eq!(batches[2].entries()[0].pos, 11);
    }

    #[test]
    fn test_plan_exact_multiple() {
        let builder = BatchBuilder::new(4);
        let tokens: Vec<Token> = (0..8).collect();
        let batches = builder.plan(&tokens, 0, true);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].len(), 4);
        assert!(batches[1].entries()[3].wants_output);
        assert!(!batches[1].entries()[2].wants_output);
    }

    #[test]
    fn test_plan_empty() {
        let builder = BatchBuilder::new(4);
        assert!(builder.plan(&[], 0, true).is_empty());
    }

    #[test]
    fn test_single_marks_only_final_entry() {
        let builder = BatchBuilder::new(8);
        let batch = builder.single(&[1, 2, 3], 10, true);
        assert_eq!(batch.len(), 3);
        assert!(!batch.entries()[0].wants_output);
        assert!(!batch.entries()[1].wants_output);
        assert!(batch.entries()[2].wants_output);
        assert_eq!(batch.entries()[2].pos, 12);
    }
}
