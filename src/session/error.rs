//! Session errors

use thiserror::Error;

use crate::inference::BackendError;
use crate::types::FrameError;

/// Errors surfaced by a generation session
///
/// `ModelLoad`, `TemplateRender`, `ContextWindowExceeded` and `Decode` end
/// the current turn; after `Decode` the engine state is unreliable and the
/// session should be discarded. Frame and multimodal build errors leave the
/// session usable, as does sending frames to a text-only session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to render chat template: {0}")]
    TemplateRender(String),

    #[error("Context window exceeded: {used} positions used + {pending} pending > {capacity}")]
    ContextWindowExceeded {
        used: u32,
        pending: u32,
        capacity: u32,
    },

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Invalid frame: {0}")]
    InvalidFrameDimensions(#[from] FrameError),

    #[error("Multimodal build failed: {0}")]
    MultimodalBuild(String),

    #[error("Session does not accept image frames")]
    FramesUnsupported,

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl SessionError {
    /// Whether the session can keep serving turns after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidFrameDimensions(_)
                | SessionError::MultimodalBuild(_)
                | SessionError::FramesUnsupported
        )
    }
}

impl From<BackendError> for SessionError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::ModelLoad(msg) | BackendError::ContextCreate(msg) => {
                SessionError::ModelLoad(msg)
            }
            BackendError::Template(msg) => SessionError::TemplateRender(msg),
            BackendError::Tokenization(msg) | BackendError::Detokenization(msg) => {
                SessionError::Tokenization(msg)
            }
            BackendError::Decode(msg) => SessionError::Decode(msg),
            BackendError::Multimodal(msg) => SessionError::MultimodalBuild(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_map_to_taxonomy() {
        assert_eq!(
            SessionError::from(BackendError::ContextCreate("oom".into())),
            SessionError::ModelLoad("oom".into())
        );
        assert_eq!(
            SessionError::from(BackendError::Decode("-1".into())),
            SessionError::Decode("-1".into())
        );
        assert_eq!(
            SessionError::from(BackendError::Template("bad".into())),
            SessionError::TemplateRender("bad".into())
        );
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(SessionError::MultimodalBuild("x".into()).is_recoverable());
        assert!(SessionError::from(FrameError::UnsupportedChannels(4)).is_recoverable());
        assert!(!SessionError::ContextWindowExceeded {
            used: 10,
            pending: 2,
            capacity: 11
        }
        .is_recoverable());
    }

    #[test]
    fn test_context_error_message() {
        let err = SessionError::ContextWindowExceeded {
            used: 100,
            pending: 30,
            capacity: 128,
        };
        assert_eq!(
            err.to_string(),
            "Context window exceeded: 100 positions used + 30 pending > 128"
        );
    }
}
