//! LLM inference engine
//!
//! The engine seam sessions drive, its llama.cpp implementation, GGUF file
//! inspection and the threaded streaming worker.

pub mod backend;
pub mod batch;
pub mod engine;
pub mod llama;
pub mod model;
pub mod streaming;

// Re-export main types for convenience
pub use backend::{BackendError, InferenceBackend, MultimodalBackend};
pub use batch::{BatchToken, PromptBatch, TokenId, SEQUENCE_ID};
pub use engine::{SessionStats, SessionWorker, StreamingSession};
pub use llama::LlamaCppBackend;
pub use model::{
    read_gguf_metadata, validate_gguf, GgufHeader, GgufMetadata, ModelError, GGUF_MAGIC,
};
pub use streaming::{StepOutput, StreamToken, END_OF_GENERATION_MARKER};
