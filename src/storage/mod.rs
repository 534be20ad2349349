//! Persistent storage
//!
//! Data directory resolution and saved chat transcripts.

use std::path::PathBuf;
use thiserror::Error;

pub mod transcript;

pub use transcript::{
    list_transcripts, load_transcript, load_transcript_file, save_transcript, transcripts_dir,
    Transcript,
};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Transcript not found: {0}")]
    TranscriptNotFound(String),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\SmolChat\SmolChat`
/// - macOS: `/Users/{user}/Library/Application Support/io.SmolChat.SmolChat`
/// - Linux: `/home/{user}/.local/share/smolchat`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("io", "SmolChat", "SmolChat")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_retrieval() {
        // No home directory in some sandboxes; only check the name when resolved
        if let Ok(path) = get_data_dir() {
            assert!(path.to_string_lossy().to_lowercase().contains("smolchat"));
        }
    }

    #[test]
    fn test_transcripts_live_under_data_dir() {
        if let (Ok(data), Ok(transcripts)) = (get_data_dir(), transcripts_dir()) {
            assert!(transcripts.starts_with(data));
        }
    }
}
