//! Image + text session
//!
//! Frames are collected first, then a single build step evaluates the
//! markers, images and prompt in one pass. Every build starts from an empty
//! engine memory, so nothing of the history is tracked between builds.

use crate::inference::{MultimodalBackend, StepOutput};
use crate::session::completion::{Completion, CompletionPhase};
use crate::session::conversation::Conversation;
use crate::session::frames::FrameBuffer;
use crate::session::metrics::GenerationMetrics;
use crate::session::{ChatSession, SessionError};
use crate::types::{ChatMessage, FrameError, Role};

pub struct MultimodalSession<B: MultimodalBackend> {
    backend: B,
    conversation: Conversation,
    completion: Completion,
    frames: FrameBuffer,
}

impl<B: MultimodalBackend> MultimodalSession<B> {
    pub fn new(backend: B) -> Self {
        let conversation = Conversation::with_capacity(backend.context_size() as usize);
        Self {
            backend,
            conversation,
            completion: Completion::new(),
            frames: FrameBuffer::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn phase(&self) -> CompletionPhase {
        self.completion.phase()
    }

    /// Queues an RGB frame for the next build.
    pub fn add_frame(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<(), FrameError> {
        self.frames.add(pixels, width, height, channels)?;
        tracing::debug!(
            "Frame {} queued ({}x{})",
            self.frames.len(),
            width,
            height
        );
        Ok(())
    }

    pub fn clear_frames(&mut self) {
        self.frames.clear();
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Evaluates all queued frames plus `prompt` and primes the session
    /// for stepping.
    ///
    /// The engine memory and the history are reset first. The user message
    /// holds one media marker per frame followed by the prompt. Queued
    /// frames stay queued afterwards.
    pub fn try_build_chat(&mut self, prompt: &str) -> Result<(), SessionError> {
        if self.frames.is_empty() {
            return Err(SessionError::MultimodalBuild(
                "no frames queued".to_string(),
            ));
        }

        self.completion.begin_turn();
        self.backend.clear_memory();
        self.conversation.clear();

        let markers = self.backend.media_marker().repeat(self.frames.len());
        self.conversation
            .append(Role::User, format!("{markers}\n{prompt}"));
        let text = self.conversation.render_full(&self.backend)?;

        let next_position = {
            let bitmaps = self
                .frames
                .frames()
                .iter()
                .map(|frame| self.backend.create_bitmap(frame))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| SessionError::MultimodalBuild(e.to_string()))?;
            let chunks = self
                .backend
                .tokenize_multimodal(&text, &bitmaps)
                .map_err(|e| SessionError::MultimodalBuild(e.to_string()))?;
            drop(bitmaps);

            let batch_capacity = self.backend.batch_capacity();
            self.backend
                .evaluate_chunks(&chunks, 0, batch_capacity)
                .map_err(|e| SessionError::MultimodalBuild(e.to_string()))?
        };

        self.completion.resume_evaluated(next_position);
        tracing::info!(
            "Multimodal prompt evaluated: {} frames, {} positions used",
            self.frames.len(),
            next_position
        );
        Ok(())
    }

    /// Like [`Self::try_build_chat`], reporting failure as `false`.
    pub fn build_chat(&mut self, prompt: &str) -> bool {
        match self.try_build_chat(prompt) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Multimodal build failed: {}", e);
                false
            }
        }
    }
}

impl<B: MultimodalBackend> ChatSession for MultimodalSession<B> {
    fn add_chat_message(&mut self, role: Role, content: &str) {
        self.conversation.append(role, content);
    }

    fn step(&mut self) -> Result<StepOutput, SessionError> {
        self.completion.step(&mut self.backend, &mut self.conversation)
    }

    fn stop(&mut self) -> Result<(), SessionError> {
        self.completion.interrupt();
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{ScriptedBackend, MARKER, TOKENS_PER_IMAGE};

    fn rgb(width: u32, height: u32) -> Vec<u8> {
        vec![127; (width * height * 3) as usize]
    }

    fn session_with_frames(backend: ScriptedBackend, n: usize) -> MultimodalSession<ScriptedBackend> {
        let mut session = MultimodalSession::new(backend);
        for _ in 0..n {
            session.add_frame(&rgb(4, 4), 4, 4, 3).unwrap();
        }
        session
    }

    #[test]
    fn test_build_with_three_frames_then_generate() {
        let backend = ScriptedBackend::new(4096).reply(&[b"A cat", b" on a mat"]);
        let mut session = session_with_frames(backend, 3);

        assert!(session.build_chat("What is happening?"));
        assert_eq!(session.frame_count(), 3);
        assert_eq!(session.backend().evaluated_from, vec![0]);

        let content = &session.history()[0].content;
        assert_eq!(content, &format!("{}\nWhat is happening?", MARKER.repeat(3)));

        let mut text = String::new();
        loop {
            match session.step().unwrap() {
                StepOutput::Text(t) => text.push_str(&t),
                StepOutput::Pending => {}
                StepOutput::End => break,
            }
        }
        assert_eq!(text, "A cat on a mat");
        assert_eq!(session.backend().multimodal_tokenize_calls(), 1);
    }

    #[test]
    fn test_first_step_samples_from_evaluated_prompt() {
        let backend = ScriptedBackend::new(4096).reply(&[b"x"]);
        let mut session = session_with_frames(backend, 2);
        session.try_build_chat("hi").unwrap();

        let used = session.context_used() as i32;
        assert!(used > 2 * TOKENS_PER_IMAGE);
        session.step().unwrap();
        assert!(session.backend().decoded.is_empty());

        session.step().unwrap();
        assert_eq!(session.backend().decoded[0].tokens()[0].position, used);
    }

    #[test]
    fn test_bitmaps_released_after_build() {
        let backend = ScriptedBackend::new(4096).reply(&[b"x"]);
        let mut session = session_with_frames(backend, 3);
        session.try_build_chat("describe").unwrap();
        assert_eq!(session.backend().live_bitmaps(), 0);
    }

    #[test]
    fn test_bitmaps_released_when_tokenization_fails() {
        let backend = ScriptedBackend::new(4096).failing_multimodal_tokenize();
        let mut session = session_with_frames(backend, 2);

        assert!(!session.build_chat("describe"));
        assert_eq!(session.backend().live_bitmaps(), 0);
        assert_eq!(session.phase(), CompletionPhase::Idle);
    }

    #[test]
    fn test_build_without_frames_fails() {
        let backend = ScriptedBackend::new(4096);
        let mut session = MultimodalSession::new(backend);

        assert!(!session.build_chat("anything"));
        let err = session.try_build_chat("anything").unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(session.backend().multimodal_tokenize_calls(), 0);
    }

    #[test]
    fn test_non_rgb_frame_rejected() {
        let mut session = MultimodalSession::new(ScriptedBackend::new(4096));
        let err = session.add_frame(&[0; 64], 4, 4, 4).unwrap_err();
        assert_eq!(err, FrameError::UnsupportedChannels(4));
        assert_eq!(session.frame_count(), 0);
    }

    #[test]
    fn test_short_pixel_buffer_rejected() {
        let mut session = MultimodalSession::new(ScriptedBackend::new(4096));
        assert!(session.add_frame(&rgb(4, 3), 4, 4, 3).is_err());
        assert_eq!(session.frame_count(), 0);
    }

    #[test]
    fn test_rebuild_starts_from_empty_context() {
        let mut backend = ScriptedBackend::new(4096).reply(&[b"one"]);
        backend.queue_reply(&[b"two"]);
        let mut session = session_with_frames(backend, 1);

        assert!(session.build_chat("first"));
        while !session.step().unwrap().is_end() {}
        assert!(session.build_chat("second"));

        assert_eq!(session.backend().evaluated_from, vec![0, 0]);
        assert_eq!(session.backend().memory_clears, 2);
        assert_eq!(session.history().len(), 1);
    }

    #[test]
    fn test_clear_frames() {
        let backend = ScriptedBackend::new(4096);
        let mut session = session_with_frames(backend, 2);
        session.clear_frames();
        assert_eq!(session.frame_count(), 0);
        assert!(!session.build_chat("describe"));
    }

    #[test]
    fn test_prompt_too_large_for_context() {
        let backend = ScriptedBackend::new(32);
        let mut session = session_with_frames(backend, 3);
        let err = session.try_build_chat("describe").unwrap_err();
        assert!(matches!(err, SessionError::MultimodalBuild(_)));
    }
}
