//! Conversation store
//!
//! Keeps the message history and the chat-template rendering of it. The
//! `prev_len` offset marks how much of the rendering has already been
//! turned into prompt tokens, so each turn only tokenizes what is new.

use crate::inference::InferenceBackend;
use crate::session::SessionError;
use crate::types::{ChatMessage, Role};

/// Ordered chat history plus its cached template rendering.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    /// Render buffer; only the first `rendered_len` bytes are meaningful
    rendered: Vec<u8>,
    rendered_len: usize,
    /// Bytes of the rendering already consumed as prompt tokens
    prev_len: usize,
}

impl Conversation {
    /// Creates an empty conversation whose render buffer starts at
    /// `initial_capacity` bytes.
    pub fn with_capacity(initial_capacity: usize) -> Self {
        Self {
            messages: Vec::new(),
            rendered: vec![0; initial_capacity],
            rendered_len: 0,
            prev_len: 0,
        }
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Offset into the rendering up to which content is already tokenized.
    pub fn prev_len(&self) -> usize {
        self.prev_len
    }

    /// The most recent rendering of the history.
    pub fn rendered(&self) -> &[u8] {
        &self.rendered[..self.rendered_len]
    }

    /// Drops the history and forgets consumed content.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.rendered_len = 0;
        self.prev_len = 0;
    }

    /// Truncates the history to `len` messages and moves the consumed
    /// offset back to `consumed`.
    pub fn rewind(&mut self, len: usize, consumed: usize) {
        self.messages.truncate(len);
        self.prev_len = consumed.min(self.prev_len);
    }

    /// Renders the history with a trailing generation prompt and returns the
    /// part not yet consumed, marking it consumed.
    ///
    /// A second call with no new messages returns an empty string.
    pub fn render_and_diff<B: InferenceBackend>(
        &mut self,
        backend: &B,
    ) -> Result<String, SessionError> {
        let new_len = self.render(backend, true)?;
        if self.prev_len > new_len {
            tracing::warn!(
                "Chat template rendering shrank from {} to {} bytes; history was re-rendered differently",
                self.prev_len,
                new_len
            );
            self.prev_len = new_len;
        }
        let slice = String::from_utf8_lossy(&self.rendered[self.prev_len..new_len]).into_owned();
        self.prev_len = new_len;
        Ok(slice)
    }

    /// Renders the whole history with a trailing generation prompt.
    pub fn render_full<B: InferenceBackend>(&mut self, backend: &B) -> Result<String, SessionError> {
        let len = self.render(backend, true)?;
        Ok(String::from_utf8_lossy(&self.rendered[..len]).into_owned())
    }

    /// Finalizes a turn.
    ///
    /// When persisting, the history is re-rendered without a generation
    /// prompt and `prev_len` moves to its end, so the next turn starts
    /// right after the last assistant message. Otherwise the history is
    /// cleared.
    pub fn commit_turn<B: InferenceBackend>(
        &mut self,
        backend: &B,
        persist: bool,
    ) -> Result<(), SessionError> {
        if !persist {
            self.clear();
            return Ok(());
        }
        self.prev_len = self.render(backend, false)?;
        tracing::debug!(
            "Committed turn: {} messages, {} bytes consumed",
            self.messages.len(),
            self.prev_len
        );
        Ok(())
    }

    /// Renders into the buffer, growing it once when the template needs
    /// more room.
    fn render<B: InferenceBackend>(
        &mut self,
        backend: &B,
        add_generation_prompt: bool,
    ) -> Result<usize, SessionError> {
        let mut len = backend
            .render_template(&self.messages, add_generation_prompt, &mut self.rendered)
            .map_err(|e| SessionError::TemplateRender(e.to_string()))?;
        if len > self.rendered.len() {
            self.rendered.resize(len, 0);
            len = backend
                .render_template(&self.messages, add_generation_prompt, &mut self.rendered)
                .map_err(|e| SessionError::TemplateRender(e.to_string()))?;
            if len > self.rendered.len() {
                return Err(SessionError::TemplateRender(format!(
                    "template needs {len} bytes after growing the buffer to {}",
                    self.rendered.len()
                )));
            }
        }
        self.rendered_len = len;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedBackend;

    #[test]
    fn test_first_turn_slice_is_full_prompt() {
        let backend = ScriptedBackend::new(256);
        let mut conversation = Conversation::with_capacity(256);
        conversation.append(Role::User, "Hi");

        let slice = conversation.render_and_diff(&backend).unwrap();
        assert_eq!(slice, "<|user|>Hi\n<|assistant|>");
        assert_eq!(conversation.prev_len(), slice.len());
    }

    #[test]
    fn test_second_render_without_append_is_empty() {
        let backend = ScriptedBackend::new(256);
        let mut conversation = Conversation::with_capacity(256);
        conversation.append(Role::User, "Hi");

        conversation.render_and_diff(&backend).unwrap();
        assert_eq!(conversation.render_and_diff(&backend).unwrap(), "");
    }

    #[test]
    fn test_commit_then_next_turn_yields_only_new_content() {
        let backend = ScriptedBackend::new(256);
        let mut conversation = Conversation::with_capacity(256);
        conversation.append(Role::User, "Hi");
        conversation.render_and_diff(&backend).unwrap();
        conversation.append(Role::Assistant, "Hello!");
        conversation.commit_turn(&backend, true).unwrap();

        assert_eq!(
            conversation.prev_len(),
            "<|user|>Hi\n<|assistant|>Hello!\n".len()
        );
        assert_eq!(conversation.rendered().len(), conversation.prev_len());

        conversation.append(Role::User, "How are you?");
        let slice = conversation.render_and_diff(&backend).unwrap();
        assert_eq!(slice, "<|user|>How are you?\n<|assistant|>");
    }

    #[test]
    fn test_commit_without_persist_clears_history() {
        let backend = ScriptedBackend::new(256);
        let mut conversation = Conversation::with_capacity(256);
        conversation.append(Role::User, "Hi");
        conversation.render_and_diff(&backend).unwrap();

        conversation.commit_turn(&backend, false).unwrap();
        assert!(conversation.is_empty());
        assert_eq!(conversation.prev_len(), 0);
    }

    #[test]
    fn test_buffer_grows_when_template_needs_more_room() {
        let backend = ScriptedBackend::new(256);
        let mut conversation = Conversation::with_capacity(4);
        let long = "x".repeat(100);
        conversation.append(Role::User, long.clone());

        let slice = conversation.render_and_diff(&backend).unwrap();
        assert_eq!(slice, format!("<|user|>{long}\n<|assistant|>"));
        assert_eq!(backend.render_calls(), 2);
    }

    #[test]
    fn test_template_still_too_large_after_growing() {
        let backend = ScriptedBackend::new(256).inflating_template();
        let mut conversation = Conversation::with_capacity(8);
        conversation.append(Role::User, "Hi");

        let err = conversation.render_and_diff(&backend).unwrap_err();
        assert!(matches!(err, SessionError::TemplateRender(_)));
        assert_eq!(backend.render_calls(), 2);
        assert_eq!(conversation.prev_len(), 0);
    }

    #[test]
    fn test_rewind_restores_history_and_offset() {
        let backend = ScriptedBackend::new(256);
        let mut conversation = Conversation::with_capacity(256);
        conversation.append(Role::User, "Hi");
        conversation.render_and_diff(&backend).unwrap();
        conversation.append(Role::Assistant, "Hello!");
        conversation.commit_turn(&backend, true).unwrap();
        let consumed = conversation.prev_len();

        conversation.append(Role::User, "Again");
        conversation.render_and_diff(&backend).unwrap();
        conversation.rewind(2, consumed);

        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.prev_len(), consumed);
    }

    #[test]
    fn test_template_failure_is_reported() {
        let backend = ScriptedBackend::new(256).failing_template();
        let mut conversation = Conversation::with_capacity(64);
        conversation.append(Role::User, "Hi");

        let err = conversation.render_and_diff(&backend).unwrap_err();
        assert!(matches!(err, SessionError::TemplateRender(_)));
    }

    #[test]
    fn test_prev_len_never_exceeds_rendering() {
        let backend = ScriptedBackend::new(256);
        let mut conversation = Conversation::with_capacity(256);
        conversation.append(Role::User, "a long opening message");
        conversation.render_and_diff(&backend).unwrap();

        conversation.clear();
        conversation.append(Role::User, "b");
        assert_eq!(conversation.prev_len(), 0);
        let slice = conversation.render_and_diff(&backend).unwrap();
        assert_eq!(slice, "<|user|>b\n<|assistant|>");
        assert!(conversation.prev_len() <= conversation.rendered().len());
    }
}
