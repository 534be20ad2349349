//! Inference engine seam
//!
//! Sessions never talk to llama.cpp directly. They drive an
//! [`InferenceBackend`] (text generation) or a [`MultimodalBackend`]
//! (text generation plus image chunks), which keeps the decode loop
//! independent of the model runtime and lets tests script the engine.

use thiserror::Error;

use crate::inference::batch::{PromptBatch, TokenId};
use crate::types::{ChatMessage, ImageFrame};

/// Errors reported by an inference backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Chat template error: {0}")]
    Template(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Token conversion failed: {0}")]
    Detokenization(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Multimodal error: {0}")]
    Multimodal(String),
}

/// Text generation operations consumed by a session.
///
/// Implementations are single-threaded: every method is called from the
/// thread that owns the session.
pub trait InferenceBackend {
    /// Number of positions in the context window.
    fn context_size(&self) -> u32;

    /// Maximum number of tokens evaluated per decode call.
    fn batch_capacity(&self) -> u32;

    /// Renders `messages` through the chat template into `buf`.
    ///
    /// Returns the number of bytes the full rendering needs. When that is
    /// larger than `buf`, nothing useful was written and the caller must
    /// retry with a larger buffer. Passing an empty buffer queries the
    /// length only.
    fn render_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<usize, BackendError>;

    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>, BackendError>;

    /// Raw bytes of a token. A multi-byte character may be split across
    /// consecutive tokens.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Evaluates `batch` against the context.
    fn decode(&mut self, batch: &PromptBatch) -> Result<(), BackendError>;

    /// Samples the next token from the logits of the last evaluated slot.
    fn sample(&mut self) -> TokenId;

    /// Highest occupied position of `sequence` in the engine memory, or -1
    /// when the sequence is empty.
    fn max_position(&self, sequence: i32) -> i32;

    /// Drops every cached position from the engine memory.
    fn clear_memory(&mut self);
}

/// Image-aware operations layered on top of [`InferenceBackend`].
pub trait MultimodalBackend: InferenceBackend {
    /// Engine-native image handle. Dropping it releases the image.
    type Bitmap;
    /// Tokenized mix of text and image chunks.
    type Chunks;

    /// Placeholder that marks where each image goes in the prompt text.
    fn media_marker(&self) -> &str;

    fn create_bitmap(&self, frame: &ImageFrame) -> Result<Self::Bitmap, BackendError>;

    fn tokenize_multimodal(
        &self,
        text: &str,
        bitmaps: &[Self::Bitmap],
    ) -> Result<Self::Chunks, BackendError>;

    /// Evaluates every chunk starting at `start_position` and returns the
    /// position following the last evaluated token.
    fn evaluate_chunks(
        &mut self,
        chunks: &Self::Chunks,
        start_position: i32,
        batch_capacity: u32,
    ) -> Result<i32, BackendError>;
}
