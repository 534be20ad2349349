//! Scripted in-memory engine for session tests.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::inference::{BackendError, InferenceBackend, MultimodalBackend, PromptBatch, TokenId};
use crate::types::{ChatMessage, ImageFrame};

pub const BOS: TokenId = 1_000;
pub const EOS: TokenId = 1_001;
const FIRST_REPLY_TOKEN: TokenId = 2_000;
pub const MARKER: &str = "<__media__>";
pub const TOKENS_PER_IMAGE: i32 = 16;

/// Deterministic engine: templates render as `<|role|>content\n`, text
/// tokenizes to one token per byte, and sampling replays a queued reply.
pub struct ScriptedBackend {
    context_size: u32,
    pieces: HashMap<TokenId, Vec<u8>>,
    replies: VecDeque<TokenId>,
    max_position: i32,
    fail_template: bool,
    inflate_template: bool,
    rejected_text: Option<String>,
    fail_decode: bool,
    fail_multimodal_tokenize: bool,
    pub decoded: Vec<PromptBatch>,
    render_calls: Cell<usize>,
    multimodal_tokenize_calls: Cell<usize>,
    live_bitmaps: Rc<Cell<usize>>,
    pub memory_clears: usize,
    pub evaluated_from: Vec<i32>,
}

impl ScriptedBackend {
    pub fn new(context_size: u32) -> Self {
        Self {
            context_size,
            pieces: HashMap::new(),
            replies: VecDeque::new(),
            max_position: -1,
            fail_template: false,
            inflate_template: false,
            rejected_text: None,
            fail_decode: false,
            fail_multimodal_tokenize: false,
            decoded: Vec::new(),
            render_calls: Cell::new(0),
            multimodal_tokenize_calls: Cell::new(0),
            live_bitmaps: Rc::new(Cell::new(0)),
            memory_clears: 0,
            evaluated_from: Vec::new(),
        }
    }

    /// Queues a reply made of the given raw token pieces, followed by EOS.
    pub fn reply(mut self, pieces: &[&[u8]]) -> Self {
        self.queue_reply(pieces);
        self
    }

    pub fn queue_reply(&mut self, pieces: &[&[u8]]) {
        for piece in pieces {
            let token = FIRST_REPLY_TOKEN + self.pieces.len() as TokenId;
            self.pieces.insert(token, piece.to_vec());
            self.replies.push_back(token);
        }
        self.replies.push_back(EOS);
    }

    pub fn failing_template(mut self) -> Self {
        self.fail_template = true;
        self
    }

    /// Reports a required length one byte past any buffer it is given.
    pub fn inflating_template(mut self) -> Self {
        self.inflate_template = true;
        self
    }

    /// Fails tokenization of any text containing `needle`.
    pub fn rejecting_text(mut self, needle: &str) -> Self {
        self.rejected_text = Some(needle.to_string());
        self
    }

    pub fn failing_decode(mut self) -> Self {
        self.fail_decode = true;
        self
    }

    pub fn failing_multimodal_tokenize(mut self) -> Self {
        self.fail_multimodal_tokenize = true;
        self
    }

    /// Pretends `n` positions of the sequence are already occupied.
    pub fn occupy(&mut self, n: i32) {
        self.max_position = n - 1;
    }

    pub fn render_calls(&self) -> usize {
        self.render_calls.get()
    }

    pub fn multimodal_tokenize_calls(&self) -> usize {
        self.multimodal_tokenize_calls.get()
    }

    pub fn live_bitmaps(&self) -> usize {
        self.live_bitmaps.get()
    }

    pub fn render(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        for message in messages {
            out.push_str(&format!("<|{}|>{}\n", message.role, message.content));
        }
        if add_generation_prompt {
            out.push_str("<|assistant|>");
        }
        out
    }
}

impl InferenceBackend for ScriptedBackend {
    fn context_size(&self) -> u32 {
        self.context_size
    }

    fn batch_capacity(&self) -> u32 {
        512
    }

    fn render_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<usize, BackendError> {
        self.render_calls.set(self.render_calls.get() + 1);
        if self.fail_template {
            return Err(BackendError::Template("unsupported template".into()));
        }
        if self.inflate_template {
            return Ok(buf.len() + 1);
        }
        let text = Self::render(messages, add_generation_prompt);
        if text.len() <= buf.len() {
            buf[..text.len()].copy_from_slice(text.as_bytes());
        }
        Ok(text.len())
    }

    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        _parse_special: bool,
    ) -> Result<Vec<TokenId>, BackendError> {
        if let Some(needle) = &self.rejected_text {
            if text.contains(needle.as_str()) {
                return Err(BackendError::Tokenization(format!("cannot tokenize {needle:?}")));
            }
        }
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(TokenId::from));
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        self.pieces
            .get(&token)
            .cloned()
            .ok_or_else(|| BackendError::Detokenization(format!("unknown token {token}")))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn decode(&mut self, batch: &PromptBatch) -> Result<(), BackendError> {
        if self.fail_decode {
            return Err(BackendError::Decode("llama_decode returned -1".into()));
        }
        for token in batch.tokens() {
            self.max_position = self.max_position.max(token.position);
        }
        self.decoded.push(batch.clone());
        Ok(())
    }

    fn sample(&mut self) -> TokenId {
        self.replies.pop_front().unwrap_or(EOS)
    }

    fn max_position(&self, _sequence: i32) -> i32 {
        self.max_position
    }

    fn clear_memory(&mut self) {
        self.max_position = -1;
        self.memory_clears += 1;
    }
}

/// Counts itself in `live` until dropped.
pub struct ScriptedBitmap {
    live: Rc<Cell<usize>>,
}

impl Drop for ScriptedBitmap {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

pub struct ScriptedChunks {
    pub n_tokens: i32,
}

impl MultimodalBackend for ScriptedBackend {
    type Bitmap = ScriptedBitmap;
    type Chunks = ScriptedChunks;

    fn media_marker(&self) -> &str {
        MARKER
    }

    fn create_bitmap(&self, _frame: &ImageFrame) -> Result<ScriptedBitmap, BackendError> {
        self.live_bitmaps.set(self.live_bitmaps.get() + 1);
        Ok(ScriptedBitmap {
            live: Rc::clone(&self.live_bitmaps),
        })
    }

    fn tokenize_multimodal(
        &self,
        text: &str,
        bitmaps: &[ScriptedBitmap],
    ) -> Result<ScriptedChunks, BackendError> {
        self.multimodal_tokenize_calls
            .set(self.multimodal_tokenize_calls.get() + 1);
        if self.fail_multimodal_tokenize {
            return Err(BackendError::Multimodal("marker count mismatch".into()));
        }
        let text_tokens = text.replace(MARKER, "").len() as i32 + 1;
        Ok(ScriptedChunks {
            n_tokens: text_tokens + TOKENS_PER_IMAGE * bitmaps.len() as i32,
        })
    }

    fn evaluate_chunks(
        &mut self,
        chunks: &ScriptedChunks,
        start_position: i32,
        _batch_capacity: u32,
    ) -> Result<i32, BackendError> {
        self.evaluated_from.push(start_position);
        let next = start_position + chunks.n_tokens;
        if next > self.context_size as i32 {
            return Err(BackendError::Multimodal("chunks exceed context".into()));
        }
        self.max_position = next - 1;
        Ok(next)
    }
}
