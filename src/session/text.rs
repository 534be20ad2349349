//! Text chat session
//!
//! Incremental chat over a persistent context: each turn tokenizes only the
//! part of the rendered conversation the engine has not seen yet.

use crate::inference::{InferenceBackend, StepOutput};
use crate::session::completion::{Completion, CompletionPhase};
use crate::session::conversation::Conversation;
use crate::session::metrics::GenerationMetrics;
use crate::session::{ChatSession, SessionError};
use crate::types::{ChatMessage, Role};

/// A text-only generation session.
pub struct TextSession<B: InferenceBackend> {
    backend: B,
    conversation: Conversation,
    completion: Completion,
    store_chats: bool,
    /// History length before the user message of a turn that has not been
    /// committed yet
    turn_start: Option<usize>,
}

impl<B: InferenceBackend> TextSession<B> {
    /// Wraps a loaded backend. With `store_chats` unset the history is
    /// cleared after every turn and each turn starts from an empty context.
    pub fn new(backend: B, store_chats: bool) -> Self {
        let conversation = Conversation::with_capacity(backend.context_size() as usize);
        Self {
            backend,
            conversation,
            completion: Completion::new(),
            store_chats,
            turn_start: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn stores_chats(&self) -> bool {
        self.store_chats
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn phase(&self) -> CompletionPhase {
        self.completion.phase()
    }

    /// Starts a turn for `query`.
    ///
    /// Appends the query as a user message, renders the history and queues
    /// the tokens of everything after the already consumed prefix. On
    /// failure the query is taken back out of the history.
    pub fn start_completion(&mut self, query: &str) -> Result<(), SessionError> {
        if !self.store_chats {
            // Messages added before the turn stay; an uncommitted turn goes
            let keep = self.turn_start.take().unwrap_or(self.conversation.len());
            self.conversation.rewind(keep, 0);
            self.backend.clear_memory();
        }
        self.completion.begin_turn();

        let history_len = self.conversation.len();
        let consumed = self.conversation.prev_len();
        self.conversation.append(Role::User, query);

        let (prompt_len, n_tokens) = match self.queue_turn() {
            Ok(queued) => queued,
            Err(e) => {
                self.conversation.rewind(history_len, consumed);
                return Err(e);
            }
        };
        if !self.store_chats {
            self.turn_start = Some(history_len);
        }
        tracing::info!(
            "Completion started: {} new prompt bytes, {} tokens, {} messages in history",
            prompt_len,
            n_tokens,
            self.conversation.len()
        );
        Ok(())
    }

    fn queue_turn(&mut self) -> Result<(usize, usize), SessionError> {
        let prompt = self.conversation.render_and_diff(&self.backend)?;
        let n_tokens = self.completion.queue_prompt(&self.backend, &prompt)?;
        Ok((prompt.len(), n_tokens))
    }

    /// Runs a whole turn and returns the response.
    pub fn respond(&mut self, query: &str) -> Result<String, SessionError> {
        self.start_completion(query)?;
        let mut response = String::new();
        loop {
            match self.step()? {
                StepOutput::Text(text) => response.push_str(&text),
                StepOutput::Pending => {}
                StepOutput::End => break,
            }
        }
        self.stop()?;
        Ok(response)
    }
}

impl<B: InferenceBackend> ChatSession for TextSession<B> {
    fn add_chat_message(&mut self, role: Role, content: &str) {
        self.conversation.append(role, content);
    }

    fn step(&mut self) -> Result<StepOutput, SessionError> {
        self.completion.step(&mut self.backend, &mut self.conversation)
    }

    /// Ends the turn. A response cut short is kept in the history when
    /// chats are stored, and the consumed prefix moves past it.
    fn stop(&mut self) -> Result<(), SessionError> {
        let partial = self.completion.interrupt();
        if self.store_chats && !partial.is_empty() {
            self.conversation.append(Role::Assistant, partial);
        }
        self.turn_start = None;
        self.conversation
            .commit_turn(&self.backend, self.store_chats)
    }

    fn history(&self) -> &[ChatMessage] {
        self.conversation.messages()
    }

    fn metrics(&self) -> &GenerationMetrics {
        self.completion.metrics()
    }

    fn context_used(&self) -> u32 {
        self.completion.context_used()
    }

    fn context_size(&self) -> u32 {
        self.backend.context_size()
    }
}
