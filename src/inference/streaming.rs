//! Streaming inference support
//!
//! Handles token-by-token streaming output from the model.

/// Marker the host binding layer receives once generation has ended.
pub const END_OF_GENERATION_MARKER: &str = "[EOG]";

/// Result of a single `step()` call on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    /// Complete, valid text produced by this step
    Text(String),
    /// A token was generated but its bytes do not form complete text yet;
    /// call `step()` again
    Pending,
    /// The model emitted an end-of-generation token
    End,
}

impl StepOutput {
    pub fn is_end(&self) -> bool {
        matches!(self, StepOutput::End)
    }

    /// Text carried by this step, if any
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StepOutput::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the step the way the host binding hands it out: the text,
    /// an empty string while bytes are buffered, or the end marker.
    pub fn into_host_string(self) -> String {
        match self {
            StepOutput::Text(s) => s,
            StepOutput::Pending => String::new(),
            StepOutput::End => END_OF_GENERATION_MARKER.to_string(),
        }
    }
}

/// Represents a token emitted during streaming inference.
#[derive(Debug, Clone)]
pub enum StreamToken {
    /// A generated token string
    Token(String),
    /// Generation completed successfully
    Done,
    /// An error occurred during generation
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_output_host_strings() {
        assert_eq!(StepOutput::Text("hé".into()).into_host_string(), "hé");
        assert_eq!(StepOutput::Pending.into_host_string(), "");
        assert_eq!(StepOutput::End.into_host_string(), "[EOG]");
        assert!(StepOutput::End.is_end());
        assert_eq!(StepOutput::Text("a".into()).as_text(), Some("a"));
        assert_eq!(StepOutput::Pending.as_text(), None);
    }
}
