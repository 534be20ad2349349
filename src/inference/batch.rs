//! Prompt batches
//!
//! A [`PromptBatch`] is the set of tokens the engine must evaluate next.
//! Every token carries its absolute position in the context window and the
//! sequence it belongs to; sessions only ever use sequence 0.

/// Token id as understood by the engine's vocabulary.
pub type TokenId = i32;

/// Sequence id used for every token of a session.
pub const SEQUENCE_ID: i32 = 0;

/// One token queued for evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchToken {
    pub token: TokenId,
    /// Absolute position in the context window
    pub position: i32,
    pub sequence: i32,
    /// Whether the sampler reads logits from this slot
    pub logits: bool,
}

/// Tokens pending evaluation, owned by the completion state.
///
/// A new batch replaces the previous one by assignment; there is never more
/// than one live batch per session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptBatch {
    tokens: Vec<BatchToken>,
}

impl PromptBatch {
    /// An empty batch. Stepping over it samples from the logits the engine
    /// already holds.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the batch for freshly tokenized prompt content.
    ///
    /// Positions start at `start_position`; only the last token requests
    /// logits.
    pub fn from_prompt(tokens: &[TokenId], start_position: i32) -> Self {
        let last = tokens.len().saturating_sub(1);
        let tokens = tokens
            .iter()
            .enumerate()
            .map(|(i, &token)| BatchToken {
                token,
                position: start_position + i as i32,
                sequence: SEQUENCE_ID,
                logits: i == last,
            })
            .collect();
        Self { tokens }
    }

    /// A batch holding the single token sampled on the previous step.
    pub fn single(token: TokenId, position: i32) -> Self {
        Self {
            tokens: vec![BatchToken {
                token,
                position,
                sequence: SEQUENCE_ID,
                logits: true,
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[BatchToken] {
        &self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_batch_marks_only_last_token() {
        let batch = PromptBatch::from_prompt(&[11, 12, 13], 5);
        assert_eq!(batch.len(), 3);
        let positions: Vec<i32> = batch.tokens().iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![5, 6, 7]);
        let logits: Vec<bool> = batch.tokens().iter().map(|t| t.logits).collect();
        assert_eq!(logits, vec![false, false, true]);
        assert!(batch.tokens().iter().all(|t| t.sequence == SEQUENCE_ID));
    }

    #[test]
    fn test_single_token_batch() {
        let batch = PromptBatch::single(42, 9);
        assert_eq!(
            batch.tokens(),
            &[BatchToken {
                token: 42,
                position: 9,
                sequence: 0,
                logits: true
            }]
        );
    }

    #[test]
    fn test_empty_prompt_yields_empty_batch() {
        assert!(PromptBatch::from_prompt(&[], 0).is_empty());
        assert!(PromptBatch::empty().is_empty());
    }
}
