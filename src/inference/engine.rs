//! Session worker
//!
//! Runs a session on a dedicated thread and streams its output over
//! channels.
//!
//! # Architecture
//!
//! llama-cpp-2 types contain raw pointers and are not `Send`, so the session
//! is constructed *inside* the worker thread by a caller-supplied factory and
//! never leaves it. The owning thread talks to it through [`WorkerCommand`]s.
//! Generation pulls `step()` until the end of the turn, the receiver going
//! away, or the stop flag being raised, and then always calls `stop()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::inference::backend::{InferenceBackend, MultimodalBackend};
use crate::inference::streaming::{StepOutput, StreamToken};
use crate::session::{ChatSession, MultimodalSession, SessionError, TextSession};
use crate::types::{ChatMessage, Role};

/// A session the worker can drive.
pub trait StreamingSession: ChatSession {
    /// Prepares the engine to generate a reply to `prompt`.
    fn begin(&mut self, prompt: &str) -> Result<(), SessionError>;

    fn add_frame(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
        _channels: u32,
    ) -> Result<(), SessionError> {
        Err(SessionError::FramesUnsupported)
    }

    fn clear_frames(&mut self) {}

    fn frame_count(&self) -> usize {
        0
    }
}

impl<B: InferenceBackend> StreamingSession for TextSession<B> {
    fn begin(&mut self, prompt: &str) -> Result<(), SessionError> {
        self.start_completion(prompt)
    }
}

impl<B: MultimodalBackend> StreamingSession for MultimodalSession<B> {
    fn begin(&mut self, prompt: &str) -> Result<(), SessionError> {
        self.try_build_chat(prompt)
    }

    fn add_frame(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<(), SessionError> {
        MultimodalSession::add_frame(self, pixels, width, height, channels)?;
        Ok(())
    }

    fn clear_frames(&mut self) {
        MultimodalSession::clear_frames(self)
    }

    fn frame_count(&self) -> usize {
        MultimodalSession::frame_count(self)
    }
}

/// Snapshot of a session's counters
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub tokens_per_second: f32,
    pub tokens_generated: u64,
    pub context_used: u32,
    pub context_size: u32,
    pub frame_count: usize,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Generate {
        prompt: String,
        token_tx: Sender<StreamToken>,
        stop_signal: Arc<AtomicBool>,
    },
    AddMessage {
        role: Role,
        content: String,
    },
    AddFrame {
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        channels: u32,
        response_tx: Sender<Result<(), SessionError>>,
    },
    ClearFrames,
    History {
        response_tx: Sender<Vec<ChatMessage>>,
    },
    Stats {
        response_tx: Sender<SessionStats>,
    },
    Shutdown,
}

/// Handle to a session running on its own thread.
pub struct SessionWorker {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl SessionWorker {
    /// Starts the worker thread and builds the session on it.
    ///
    /// Blocks until `factory` has run, so load failures surface here.
    pub fn spawn<S, F>(factory: F) -> Result<Self, SessionError>
    where
        S: StreamingSession + 'static,
        F: FnOnce() -> Result<S, SessionError> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), SessionError>>();

        let handle = thread::Builder::new()
            .name("smolchat-worker".to_string())
            .spawn(move || match factory() {
                Ok(session) => {
                    let _ = ready_tx.send(Ok(()));
                    worker_thread_main(session, command_rx);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| SessionError::Worker(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|e| SessionError::Worker(e.to_string()));
        if let Err(e) = ready.and_then(|r| r) {
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!("Session worker thread started");
        Ok(Self {
            command_tx: Some(command_tx),
            worker_handle: Some(handle),
        })
    }

    fn send(&self, command: WorkerCommand) -> Result<(), SessionError> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| SessionError::Worker("worker has shut down".to_string()))?
            .send(command)
            .map_err(|e| SessionError::Worker(e.to_string()))
    }

    fn request<T>(
        &self,
        command: impl FnOnce(Sender<T>) -> WorkerCommand,
    ) -> Result<T, SessionError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.send(command(response_tx))?;
        response_rx
            .recv()
            .map_err(|e| SessionError::Worker(e.to_string()))
    }

    /// Starts generating a reply to `prompt`.
    ///
    /// # Returns
    /// * `Ok((Receiver<StreamToken>, Arc<AtomicBool>))` - Receiver for streaming tokens and stop signal
    /// * `Err(SessionError)` - If the worker is gone
    pub fn generate(
        &self,
        prompt: &str,
    ) -> Result<(Receiver<StreamToken>, Arc<AtomicBool>), SessionError> {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let token_rx = self.generate_with_stop(prompt, Arc::clone(&stop_signal))?;
        Ok((token_rx, stop_signal))
    }

    /// Like [`Self::generate`], watching a caller-owned stop flag.
    pub fn generate_with_stop(
        &self,
        prompt: &str,
        stop_signal: Arc<AtomicBool>,
    ) -> Result<Receiver<StreamToken>, SessionError> {
        let (token_tx, token_rx) = mpsc::channel();
        self.send(WorkerCommand::Generate {
            prompt: prompt.to_string(),
            token_tx,
            stop_signal,
        })?;
        Ok(token_rx)
    }

    pub fn add_message(&self, role: Role, content: &str) -> Result<(), SessionError> {
        self.send(WorkerCommand::AddMessage {
            role,
            content: content.to_string(),
        })
    }

    pub fn add_frame(
        &self,
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        channels: u32,
    ) -> Result<(), SessionError> {
        self.request(|response_tx| WorkerCommand::AddFrame {
            pixels,
            width,
            height,
            channels,
            response_tx,
        })?
    }

    pub fn clear_frames(&self) -> Result<(), SessionError> {
        self.send(WorkerCommand::ClearFrames)
    }

    pub fn history(&self) -> Result<Vec<ChatMessage>, SessionError> {
        self.request(|response_tx| WorkerCommand::History { response_tx })
    }

    pub fn stats(&self) -> Result<SessionStats, SessionError> {
        self.request(|response_tx| WorkerCommand::Stats { response_tx })
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
fn worker_thread_main<S: StreamingSession>(mut session: S, command_rx: Receiver<WorkerCommand>) {
    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Generate {
                prompt,
                token_tx,
                stop_signal,
            }) => run_generation(&mut session, &prompt, &token_tx, &stop_signal),
            Ok(WorkerCommand::AddMessage { role, content }) => {
                session.add_chat_message(role, &content);
            }
            Ok(WorkerCommand::AddFrame {
                pixels,
                width,
                height,
                channels,
                response_tx,
            }) => {
                let _ = response_tx.send(session.add_frame(&pixels, width, height, channels));
            }
            Ok(WorkerCommand::ClearFrames) => session.clear_frames(),
            Ok(WorkerCommand::History { response_tx }) => {
                let _ = response_tx.send(session.history().to_vec());
            }
            Ok(WorkerCommand::Stats { response_tx }) => {
                let _ = response_tx.send(SessionStats {
                    tokens_per_second: session.tokens_per_second(),
                    tokens_generated: session.metrics().tokens_generated(),
                    context_used: session.context_used(),
                    context_size: session.context_size(),
                    frame_count: session.frame_count(),
                });
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Runs one turn, streaming every released fragment.
fn run_generation<S: StreamingSession>(
    session: &mut S,
    prompt: &str,
    tx: &Sender<StreamToken>,
    stop_signal: &AtomicBool,
) {
    if let Err(e) = session.begin(prompt) {
        tracing::warn!("Could not start generation: {}", e);
        let _ = tx.send(StreamToken::Error(e.to_string()));
        return;
    }

    let mut failure = None;
    loop {
        if stop_signal.load(Ordering::Relaxed) {
            tracing::debug!("Generation stopped by caller");
            break;
        }
        match session.step() {
            Ok(StepOutput::Text(text)) => {
                if tx.send(StreamToken::Token(text)).is_err() {
                    tracing::debug!("Receiver dropped, stopping generation");
                    break;
                }
            }
            Ok(StepOutput::Pending) => {}
            Ok(StepOutput::End) => break,
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    if let Err(e) = session.stop() {
        failure.get_or_insert(e);
    }

    let _ = match failure {
        Some(e) => {
            tracing::error!("Generation failed: {}", e);
            tx.send(StreamToken::Error(e.to_string()))
        }
        None => tx.send(StreamToken::Done),
    };
}
