//! Transcript storage
//!
//! Saves a session's chat history as JSON so a conversation can be resumed
//! by seeding a new session with it.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{get_data_dir, StorageError};
use crate::types::{ChatMessage, Role};

const TITLE_CHARS: usize = 50;

/// A saved chat history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub id: String,
    /// Derived from the first user message
    pub title: String,
    /// Model file the conversation was held with
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
}

impl Transcript {
    pub fn new(model: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: "New Conversation".to_string(),
            model,
            messages: Vec::new(),
            created_at: now,
            saved_at: now,
        }
    }

    /// Replaces the stored messages with `history`.
    pub fn update(&mut self, history: &[ChatMessage]) {
        self.messages = history.to_vec();
        if let Some(first) = self.messages.iter().find(|m| m.role == Role::User) {
            self.title = generate_title(&first.content);
        }
        self.saved_at = Utc::now();
    }
}

/// Takes the first characters of the message content
fn generate_title(content: &str) -> String {
    let title = content.chars().take(TITLE_CHARS).collect::<String>();
    if content.chars().count() > TITLE_CHARS {
        format!("{}...", title)
    } else {
        title
    }
}

/// Default transcript directory in the platform data directory.
pub fn transcripts_dir() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("transcripts"))
}

fn transcript_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", id))
}

pub fn save_transcript(dir: &Path, transcript: &Transcript) -> Result<PathBuf, StorageError> {
    fs::create_dir_all(dir)?;
    let path = transcript_path(dir, &transcript.id);
    let json = serde_json::to_string_pretty(transcript)?;
    fs::write(&path, json)?;
    tracing::debug!("Saved transcript: {}", transcript.id);
    Ok(path)
}

/// Loads a transcript by id from `dir`.
pub fn load_transcript(dir: &Path, id: &str) -> Result<Transcript, StorageError> {
    let path = transcript_path(dir, id);
    if !path.exists() {
        return Err(StorageError::TranscriptNotFound(id.to_string()));
    }
    load_transcript_file(&path)
}

pub fn load_transcript_file(path: &Path) -> Result<Transcript, StorageError> {
    let json = fs::read_to_string(path)?;
    let transcript: Transcript = serde_json::from_str(&json)?;
    tracing::debug!("Loaded transcript: {}", transcript.id);
    Ok(transcript)
}

/// Lists the transcripts in `dir`, most recently saved first.
///
/// Unreadable files are skipped with a warning.
pub fn list_transcripts(dir: &Path) -> Result<Vec<Transcript>, StorageError> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut transcripts = vec![];
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match load_transcript_file(&path) {
            Ok(transcript) => transcripts.push(transcript),
            Err(e) => tracing::warn!("Skipping transcript {:?}: {}", path, e),
        }
    }

    transcripts.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
    Ok(transcripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Transcript {
        let mut transcript = Transcript::new(Some("smollm2-360m.gguf".to_string()));
        transcript.update(&[
            ChatMessage::system("Be helpful."),
            ChatMessage::user("What is Rust?"),
            ChatMessage::assistant("A systems programming language."),
        ]);
        transcript
    }

    #[test]
    fn test_title_from_first_user_message() {
        let transcript = sample();
        assert_eq!(transcript.title, "What is Rust?");

        let long = "a".repeat(100);
        let title = generate_title(&long);
        assert_eq!(title.len(), 53);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let transcript = sample();

        let path = save_transcript(dir.path(), &transcript).unwrap();
        assert!(path.exists());

        let loaded = load_transcript(dir.path(), &transcript.id).unwrap();
        assert_eq!(loaded, transcript);
        assert_eq!(load_transcript_file(&path).unwrap(), transcript);
    }

    #[test]
    fn test_missing_transcript() {
        let dir = TempDir::new().unwrap();
        let err = load_transcript(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, StorageError::TranscriptNotFound(_)));
    }

    #[test]
    fn test_list_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let first = sample();
        save_transcript(dir.path(), &first).unwrap();
        let mut second = sample();
        second.id = "second".to_string();
        second.saved_at = first.saved_at + chrono::Duration::seconds(5);
        save_transcript(dir.path(), &second).unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let listed = list_transcripts(dir.path()).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "second");
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("none");
        assert!(list_transcripts(&missing).unwrap().is_empty());
    }
}
