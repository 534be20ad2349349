//! Runtime configuration
//!
//! Load-time parameters for text and multimodal sessions, and the JSON
//! settings file that stores them between runs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::inference::model::GgufMetadata;
use crate::storage::{get_data_dir, StorageError};

/// Context size used when neither the caller nor the model file names one.
pub const DEFAULT_CONTEXT_SIZE: u32 = 1024;

/// Multimodal prompts carry hundreds of image tokens per frame.
pub const DEFAULT_MULTIMODAL_CONTEXT_SIZE: u32 = 4096;

/// llama.cpp's `LLAMA_DEFAULT_SEED`, which asks for a random seed.
pub const DEFAULT_SEED: u32 = u32::MAX;

/// ChatML template used when a model ships without one.
pub const DEFAULT_CHAT_TEMPLATE: &str = "{% for message in messages %}{% if loop.first and messages[0]['role'] != 'system' %}{{ '<|im_start|>system You are a helpful AI assistant named SmolLM, trained by Hugging Face<|im_end|> ' }}{% endif %}{{'<|im_start|>' + message['role'] + ' ' + message['content'] + '<|im_end|>' + ' '}}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant ' }}{% endif %}";

const MAX_TEMPERATURE: f32 = 2.0;

/// Parameters for loading a text model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceParams {
    /// Minimum probability relative to the top token (0.0 - 1.0)
    pub min_p: f32,
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: f32,
    /// Keep the history between turns
    pub store_chats: bool,
    /// Context window; falls back to the model's trained length
    pub context_size: Option<u32>,
    /// Chat template override; falls back to the model's own template
    pub chat_template: Option<String>,
    pub num_threads: u32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    /// Layers offloaded to the GPU (0 = CPU only)
    pub gpu_layers: u32,
    pub seed: u32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            min_p: 0.1,
            temperature: 0.8,
            store_chats: true,
            context_size: None,
            chat_template: None,
            num_threads: 4,
            use_mmap: true,
            use_mlock: false,
            gpu_layers: 0,
            seed: DEFAULT_SEED,
        }
    }
}

impl InferenceParams {
    /// Clamps values into their accepted ranges.
    pub fn validate(&mut self) {
        self.min_p = self.min_p.clamp(0.0, 1.0);
        self.temperature = self.temperature.clamp(0.0, MAX_TEMPERATURE);
        if self.num_threads == 0 {
            self.num_threads = 1;
        }
        if self.context_size == Some(0) {
            self.context_size = None;
        }
        if self
            .chat_template
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            self.chat_template = None;
        }
    }

    /// Context size to request: explicit value, then the model's trained
    /// length, then [`DEFAULT_CONTEXT_SIZE`].
    pub fn resolve_context_size(&self, metadata: &GgufMetadata) -> u32 {
        resolve_context_size(self.context_size, metadata, DEFAULT_CONTEXT_SIZE)
    }

    /// Template to render with: explicit value, then the model's embedded
    /// template, then [`DEFAULT_CHAT_TEMPLATE`].
    pub fn resolve_chat_template(&self, metadata: &GgufMetadata) -> String {
        self.chat_template
            .clone()
            .or_else(|| metadata.chat_template.clone())
            .unwrap_or_else(|| DEFAULT_CHAT_TEMPLATE.to_string())
    }
}

/// Parameters for loading a vision model with its projector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultimodalParams {
    pub min_p: f32,
    pub temperature: f32,
    pub gpu_layers: u32,
    pub context_size: Option<u32>,
    pub num_threads: u32,
    pub seed: u32,
}

impl Default for MultimodalParams {
    fn default() -> Self {
        Self {
            min_p: 0.05,
            temperature: 0.2,
            gpu_layers: 35,
            context_size: None,
            num_threads: 4,
            seed: DEFAULT_SEED,
        }
    }
}

impl MultimodalParams {
    pub fn validate(&mut self) {
        self.min_p = self.min_p.clamp(0.0, 1.0);
        self.temperature = self.temperature.clamp(0.0, MAX_TEMPERATURE);
        if self.num_threads == 0 {
            self.num_threads = 1;
        }
        if self.context_size == Some(0) {
            self.context_size = None;
        }
    }

    pub fn resolve_context_size(&self, metadata: &GgufMetadata) -> u32 {
        resolve_context_size(
            self.context_size,
            metadata,
            DEFAULT_MULTIMODAL_CONTEXT_SIZE,
        )
    }
}

fn resolve_context_size(explicit: Option<u32>, metadata: &GgufMetadata, fallback: u32) -> u32 {
    explicit
        .or_else(|| {
            metadata
                .context_length
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
        })
        .unwrap_or(fallback)
}

/// Everything the settings file holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub inference: InferenceParams,
    pub multimodal: MultimodalParams,
    /// Route llama.cpp's own logging through `tracing`
    pub verbose: bool,
}

impl Settings {
    pub fn validate(&mut self) {
        self.inference.validate();
        self.multimodal.validate();
    }
}

/// Default settings file location in the platform data directory.
pub fn default_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Loads settings from `path`.
///
/// Returns defaults if the file doesn't exist or is corrupted.
pub fn load_settings(path: &Path) -> Settings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    }
}

fn load_settings_internal(path: &Path) -> Result<Settings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(Settings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
