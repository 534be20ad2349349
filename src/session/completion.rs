//! Streaming completion
//!
//! Per-turn decode state shared by text and multimodal sessions. Each call
//! to [`Completion::step`] evaluates the pending batch, samples one token
//! and turns it into text, an empty pending result, or the end of the turn.
//!
//! ```text
//! Idle --prompt--> PromptBuilt --step--> Decoding --step--> ... --EOG--> Idle
//! ```

use std::time::Instant;

use crate::inference::{InferenceBackend, PromptBatch, StepOutput, SEQUENCE_ID};
use crate::session::conversation::Conversation;
use crate::session::metrics::GenerationMetrics;
use crate::session::utf8::Utf8Reassembler;
use crate::session::SessionError;
use crate::types::Role;

/// Where the current turn stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionPhase {
    /// No turn in progress; stepping yields the end marker
    #[default]
    Idle,
    /// A prompt is queued and has not been evaluated yet
    PromptBuilt,
    /// Tokens are being generated
    Decoding,
}

/// Mutable state of the active turn.
#[derive(Debug, Default)]
pub struct Completion {
    phase: CompletionPhase,
    batch: PromptBatch,
    reassembler: Utf8Reassembler,
    response: String,
    metrics: GenerationMetrics,
    context_used: u32,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> CompletionPhase {
        self.phase
    }

    pub fn metrics(&self) -> &GenerationMetrics {
        &self.metrics
    }

    /// Positions occupied in the context window as of the last step.
    pub fn context_used(&self) -> u32 {
        self.context_used
    }

    /// Tokens waiting for the next decode.
    pub fn pending_tokens(&self) -> usize {
        self.batch.len()
    }

    /// Clears everything a previous turn left behind.
    pub fn begin_turn(&mut self) {
        self.metrics.reset();
        self.response.clear();
        self.reassembler.clear();
        self.batch = PromptBatch::empty();
        self.phase = CompletionPhase::Idle;
    }

    /// Tokenizes `text` and queues it as the next batch, positioned right
    /// after the content already held in the engine memory.
    pub fn queue_prompt<B: InferenceBackend>(
        &mut self,
        backend: &B,
        text: &str,
    ) -> Result<usize, SessionError> {
        let tokens = backend
            .tokenize(text, true, true)
            .map_err(|e| SessionError::Tokenization(e.to_string()))?;
        if tokens.is_empty() {
            return Err(SessionError::Tokenization(
                "prompt produced no tokens".to_string(),
            ));
        }

        self.context_used = occupied_positions(backend);
        self.batch = PromptBatch::from_prompt(&tokens, self.context_used as i32);
        self.phase = CompletionPhase::PromptBuilt;

        tracing::debug!(
            "Prompt batch built: {} tokens starting at position {}",
            tokens.len(),
            self.context_used
        );
        Ok(tokens.len())
    }

    /// Continues from a prompt the engine has already evaluated; the first
    /// step samples straight from the existing logits.
    pub fn resume_evaluated(&mut self, next_position: i32) {
        self.batch = PromptBatch::empty();
        self.context_used = next_position.max(0) as u32;
        self.phase = CompletionPhase::PromptBuilt;
    }

    /// Runs one decode + sample cycle.
    ///
    /// The context window is checked before the engine is touched: decoding
    /// past the window would leave the engine memory in an unusable state.
    pub fn step<B: InferenceBackend>(
        &mut self,
        backend: &mut B,
        conversation: &mut Conversation,
    ) -> Result<StepOutput, SessionError> {
        if self.phase == CompletionPhase::Idle {
            return Ok(StepOutput::End);
        }

        let capacity = backend.context_size();
        self.context_used = occupied_positions(backend);
        let pending = self.batch.len() as u32;
        if self.context_used + pending > capacity {
            tracing::warn!(
                "Context window exhausted: {} used, {} pending, {} capacity",
                self.context_used,
                pending,
                capacity
            );
            return Err(SessionError::ContextWindowExceeded {
                used: self.context_used,
                pending,
                capacity,
            });
        }

        let start = Instant::now();
        if !self.batch.is_empty() {
            backend
                .decode(&self.batch)
                .map_err(|e| SessionError::Decode(e.to_string()))?;
            self.context_used = occupied_positions(backend);
        }
        self.phase = CompletionPhase::Decoding;

        let token = backend.sample();
        if backend.is_end_of_generation(token) {
            self.finish_turn(conversation);
            return Ok(StepOutput::End);
        }

        let piece = backend
            .token_to_piece(token)
            .map_err(|e| SessionError::Tokenization(e.to_string()))?;
        self.metrics.record_token(start.elapsed());

        self.batch = PromptBatch::single(token, self.context_used as i32);

        match self.reassembler.feed(&piece) {
            Some(text) => {
                self.response.push_str(&text);
                Ok(StepOutput::Text(text))
            }
            None => Ok(StepOutput::Pending),
        }
    }

    /// Ends the turn early, handing back whatever response text was
    /// released so far.
    pub fn interrupt(&mut self) -> String {
        self.reassembler.clear();
        self.batch = PromptBatch::empty();
        self.phase = CompletionPhase::Idle;
        std::mem::take(&mut self.response)
    }

    fn finish_turn(&mut self, conversation: &mut Conversation) {
        if self.reassembler.has_pending() {
            tracing::debug!("Dropping incomplete UTF-8 bytes at end of generation");
        }
        tracing::info!(
            "Generation finished: {} tokens, {:.2} tokens/s, {} positions used",
            self.metrics.tokens_generated(),
            self.metrics.tokens_per_second(),
            self.context_used
        );
        let response = self.interrupt();
        conversation.append(Role::Assistant, response);
    }
}

/// Occupied positions of the session's sequence (highest position + 1).
fn occupied_positions<B: InferenceBackend>(backend: &B) -> u32 {
    (backend.max_position(SEQUENCE_ID) + 1).max(0) as u32
}
