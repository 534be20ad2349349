//! Generation sessions
//!
//! A session owns one loaded engine plus the conversation state around it.
//! Text and multimodal sessions share the streaming step machinery but
//! differ in how a prompt reaches the engine.

pub mod completion;
pub mod conversation;
pub mod error;
pub mod frames;
pub mod metrics;
pub mod multimodal;
pub mod text;
pub mod utf8;

#[cfg(test)]
pub(crate) mod testing;

pub use completion::{Completion, CompletionPhase};
pub use conversation::Conversation;
pub use error::SessionError;
pub use frames::FrameBuffer;
pub use metrics::GenerationMetrics;
pub use multimodal::MultimodalSession;
pub use text::TextSession;
pub use utf8::Utf8Reassembler;

use crate::inference::StepOutput;
use crate::types::{ChatMessage, Role};

/// Operations common to every session variant.
pub trait ChatSession {
    /// Appends a message to the history without generating anything.
    fn add_chat_message(&mut self, role: Role, content: &str);

    /// Advances generation by one token.
    fn step(&mut self) -> Result<StepOutput, SessionError>;

    /// Ends the current turn, early or not.
    fn stop(&mut self) -> Result<(), SessionError>;

    fn history(&self) -> &[ChatMessage];

    fn metrics(&self) -> &GenerationMetrics;

    /// Positions occupied in the context window.
    fn context_used(&self) -> u32;

    fn context_size(&self) -> u32;

    fn tokens_per_second(&self) -> f32 {
        self.metrics().tokens_per_second()
    }
}
