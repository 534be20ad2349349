//! llama.cpp engine
//!
//! [`LlamaCppBackend`] owns a model, one context on it, the sampler chain
//! and, for vision models, the multimodal projector. llama-cpp-2 types hold
//! raw pointers and are not `Send`: a backend lives and dies on the thread
//! that created it.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special};
use llama_cpp_2::mtmd::{
    mtmd_default_marker, MtmdBitmap, MtmdContext, MtmdContextParams, MtmdInputChunks,
    MtmdInputText,
};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};
use once_cell::sync::OnceCell;

use crate::config::{InferenceParams, MultimodalParams};
use crate::inference::backend::{BackendError, InferenceBackend, MultimodalBackend};
use crate::inference::batch::{PromptBatch, TokenId};
use crate::inference::model::{read_gguf_metadata, GgufMetadata};
use crate::types::{ChatMessage, ImageFrame};

/// Candidates kept before min-p filtering.
const TOP_K: i32 = 40;

static BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

/// Initializes llama.cpp once per process.
fn llama_backend(verbose: bool) -> Result<&'static LlamaBackend, BackendError> {
    BACKEND.get_or_try_init(|| {
        if verbose {
            send_logs_to_tracing(LogOptions::default());
        }
        let backend =
            LlamaBackend::init().map_err(|e| BackendError::ModelLoad(e.to_string()))?;
        tracing::info!("llama.cpp backend initialized");
        Ok(backend)
    })
}

/// Sampling settings shared by both load paths.
struct SamplerConfig {
    min_p: f32,
    temperature: f32,
    seed: u32,
}

impl SamplerConfig {
    /// top-k, then min-p, then temperature, then a seeded draw.
    fn build(&self) -> LlamaSampler {
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(TOP_K),
            LlamaSampler::min_p(self.min_p, 1),
            LlamaSampler::temp(self.temperature),
            LlamaSampler::dist(self.seed),
        ])
    }
}

/// A loaded model ready to generate.
///
/// Fields drop in declaration order, which releases the sampler, then the
/// context, then the model, then the projector.
pub struct LlamaCppBackend {
    sampler: LlamaSampler,
    context: LlamaContext<'static>,
    model: Box<LlamaModel>,
    mtmd: Option<MtmdContext>,
    template: LlamaChatTemplate,
    media_marker: String,
    context_size: u32,
    batch_capacity: u32,
}

impl LlamaCppBackend {
    /// Loads a text model.
    pub fn load<P: AsRef<Path>>(
        path: P,
        params: &InferenceParams,
        verbose: bool,
    ) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let metadata = read_model_metadata(path)?;
        let context_size = params.resolve_context_size(&metadata);
        let template = params.resolve_chat_template(&metadata);

        tracing::info!(
            "Loading model {} (min_p={}, temperature={}, store_chats={}, context_size={}, \
             custom_template={}, threads={}, mmap={}, mlock={}, gpu_layers={})",
            path.display(),
            params.min_p,
            params.temperature,
            params.store_chats,
            context_size,
            params.chat_template.is_some(),
            params.num_threads,
            params.use_mmap,
            params.use_mlock,
            params.gpu_layers
        );
        if !params.use_mmap {
            tracing::warn!("Disabling mmap is not supported by this build; the model stays memory-mapped");
        }

        let backend = llama_backend(verbose)?;
        let model_params = LlamaModelParams::default()
            .with_n_gpu_layers(params.gpu_layers)
            .with_use_mlock(params.use_mlock);
        let model = load_model(backend, path, &model_params)?;

        let sampler = SamplerConfig {
            min_p: params.min_p,
            temperature: params.temperature,
            seed: params.seed,
        };
        Self::assemble(
            backend,
            model,
            None,
            &template,
            context_size,
            params.num_threads,
            &sampler,
        )
    }

    /// Loads a vision model together with its projector file.
    pub fn load_multimodal<P: AsRef<Path>, Q: AsRef<Path>>(
        path: P,
        mmproj_path: Q,
        params: &MultimodalParams,
        verbose: bool,
    ) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let mmproj_path = mmproj_path.as_ref();
        let metadata = read_model_metadata(path)?;
        let context_size = params.resolve_context_size(&metadata);
        let template = metadata
            .chat_template
            .clone()
            .unwrap_or_else(|| crate::config::DEFAULT_CHAT_TEMPLATE.to_string());

        tracing::info!(
            "Loading multimodal model {} with projector {} (min_p={}, temperature={}, \
             gpu_layers={}, context_size={})",
            path.display(),
            mmproj_path.display(),
            params.min_p,
            params.temperature,
            params.gpu_layers,
            context_size
        );

        let backend = llama_backend(verbose)?;
        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        let model = load_model(backend, path, &model_params)?;

        let mtmd_params = MtmdContextParams {
            use_gpu: params.gpu_layers > 0,
            print_timings: false,
            n_threads: params.num_threads as i32,
            ..MtmdContextParams::default()
        };
        let mtmd = MtmdContext::init_from_file(&mmproj_path.to_string_lossy(), &model, &mtmd_params)
            .map_err(|e| BackendError::Multimodal(format!("failed to load projector: {e}")))?;
        tracing::info!(
            "Projector loaded: vision={}, audio={}",
            mtmd.support_vision(),
            mtmd.support_audio()
        );

        let sampler = SamplerConfig {
            min_p: params.min_p,
            temperature: params.temperature,
            seed: params.seed,
        };
        Self::assemble(
            backend,
            model,
            Some(mtmd),
            &template,
            context_size,
            params.num_threads,
            &sampler,
        )
    }

    fn assemble(
        backend: &LlamaBackend,
        model: Box<LlamaModel>,
        mtmd: Option<MtmdContext>,
        template: &str,
        context_size: u32,
        num_threads: u32,
        sampler: &SamplerConfig,
    ) -> Result<Self, BackendError> {
        let n_ctx = NonZeroU32::new(context_size)
            .ok_or_else(|| BackendError::ContextCreate("context size must be non-zero".into()))?;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(context_size)
            .with_n_threads(num_threads as i32)
            .with_n_threads_batch(num_threads as i32);

        let context = model
            .new_context(backend, ctx_params)
            .map_err(|e| BackendError::ContextCreate(e.to_string()))?;
        // SAFETY: the context borrows the boxed model, whose heap address is
        // stable for the life of the backend, and the field order drops the
        // context before the model.
        let context: LlamaContext<'static> = unsafe { std::mem::transmute(context) };

        let template = LlamaChatTemplate::new(template)
            .map_err(|e| BackendError::Template(e.to_string()))?;

        let context_size = context.n_ctx();
        let batch_capacity = context.n_batch();
        tracing::info!(
            "Context created: {} positions, batch capacity {}",
            context_size,
            batch_capacity
        );

        Ok(Self {
            sampler: sampler.build(),
            context,
            model,
            mtmd,
            template,
            media_marker: mtmd_default_marker().to_string(),
            context_size,
            batch_capacity,
        })
    }

    fn projector(&self) -> Result<&MtmdContext, BackendError> {
        self.mtmd
            .as_ref()
            .ok_or_else(|| BackendError::Multimodal("model was loaded without a projector".into()))
    }
}

fn read_model_metadata(path: &Path) -> Result<GgufMetadata, BackendError> {
    read_gguf_metadata(path).map_err(|e| BackendError::ModelLoad(e.to_string()))
}

fn load_model(
    backend: &LlamaBackend,
    path: &Path,
    params: &LlamaModelParams,
) -> Result<Box<LlamaModel>, BackendError> {
    let model = LlamaModel::load_from_file(backend, path, params)
        .map_err(|e| BackendError::ModelLoad(format!("{}: {e}", path.display())))?;
    tracing::info!(
        "Model loaded: {} params, {} vocab, trained context {}",
        model.n_params(),
        model.n_vocab(),
        model.n_ctx_train()
    );
    Ok(Box::new(model))
}

impl InferenceBackend for LlamaCppBackend {
    fn context_size(&self) -> u32 {
        self.context_size
    }

    fn batch_capacity(&self) -> u32 {
        self.batch_capacity
    }

    fn render_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
        buf: &mut [u8],
    ) -> Result<usize, BackendError> {
        let chat = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.as_str().to_string(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BackendError::Template(e.to_string()))?;
        let rendered = self
            .model
            .apply_chat_template(&self.template, &chat, add_generation_prompt)
            .map_err(|e| BackendError::Template(e.to_string()))?;

        let bytes = rendered.as_bytes();
        if bytes.len() <= buf.len() {
            buf[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(bytes.len())
    }

    /// Special tokens in `text` are always parsed by llama-cpp-2, so
    /// `_parse_special` has no effect.
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        _parse_special: bool,
    ) -> Result<Vec<TokenId>, BackendError> {
        let add_bos = if add_special {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| BackendError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>, BackendError> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| BackendError::Detokenization(e.to_string()))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn decode(&mut self, batch: &PromptBatch) -> Result<(), BackendError> {
        let mut llama_batch = LlamaBatch::new(batch.len().max(1), 1);
        for entry in batch.tokens() {
            llama_batch
                .add(
                    LlamaToken(entry.token),
                    entry.position,
                    &[entry.sequence],
                    entry.logits,
                )
                .map_err(|e| BackendError::Decode(e.to_string()))?;
        }
        self.context
            .decode(&mut llama_batch)
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    fn sample(&mut self) -> TokenId {
        self.sampler.sample(&self.context, -1).0
    }

    fn max_position(&self, sequence: i32) -> i32 {
        self.context.kv_cache_seq_pos_max(sequence)
    }

    fn clear_memory(&mut self) {
        self.context.clear_kv_cache();
    }
}

impl MultimodalBackend for LlamaCppBackend {
    type Bitmap = MtmdBitmap;
    type Chunks = MtmdInputChunks;

    fn media_marker(&self) -> &str {
        &self.media_marker
    }

    fn create_bitmap(&self, frame: &ImageFrame) -> Result<MtmdBitmap, BackendError> {
        MtmdBitmap::from_image_data(frame.width(), frame.height(), frame.pixels())
            .map_err(|e| BackendError::Multimodal(format!("bitmap creation failed: {e}")))
    }

    fn tokenize_multimodal(
        &self,
        text: &str,
        bitmaps: &[MtmdBitmap],
    ) -> Result<MtmdInputChunks, BackendError> {
        let input = MtmdInputText {
            text: text.to_string(),
            add_special: true,
            parse_special: true,
        };
        let refs: Vec<&MtmdBitmap> = bitmaps.iter().collect();
        let chunks = self
            .projector()?
            .tokenize(input, &refs)
            .map_err(|e| BackendError::Multimodal(format!("tokenization failed: {e}")))?;
        tracing::debug!(
            "Multimodal prompt tokenized: {} chunks, {} tokens",
            chunks.len(),
            chunks.total_tokens()
        );
        Ok(chunks)
    }

    fn evaluate_chunks(
        &mut self,
        chunks: &MtmdInputChunks,
        start_position: i32,
        batch_capacity: u32,
    ) -> Result<i32, BackendError> {
        let mtmd = self
            .mtmd
            .as_ref()
            .ok_or_else(|| BackendError::Multimodal("model was loaded without a projector".into()))?;
        chunks
            .eval_chunks(
                mtmd,
                &mut self.context,
                start_position,
                0,
                batch_capacity as i32,
                true,
            )
            .map_err(|e| BackendError::Multimodal(format!("evaluation failed: {e}")))
    }
}
