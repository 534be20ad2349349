//! Model file inspection
//!
//! Validates GGUF headers and reads the metadata a session needs before the
//! model is handed to llama.cpp: the training context length and the
//! embedded chat template.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Metadata key holding the model architecture name
pub const KEY_ARCHITECTURE: &str = "general.architecture";

/// Metadata key holding the Jinja chat template
pub const KEY_CHAT_TEMPLATE: &str = "tokenizer.chat_template";

/// Upper bound on a single metadata string; anything larger is corrupt.
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;

/// Errors that can occur during model operations
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,

    #[error("Unknown GGUF value type {value_type} for key {key}")]
    UnknownValueType { key: String, value_type: u32 },

    #[error("Corrupt GGUF metadata: {0}")]
    Corrupt(String),
}

/// Header fields of a GGUF file
#[derive(Debug, Clone)]
pub struct GgufHeader {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Session-relevant metadata extracted from a GGUF file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GgufMetadata {
    pub architecture: Option<String>,
    /// `<architecture>.context_length`
    pub context_length: Option<u64>,
    pub chat_template: Option<String>,
}

/// Validates that a file is a valid GGUF format and extracts its header.
///
/// # Arguments
/// * `path` - Path to the GGUF file
///
/// # Returns
/// * `Ok(GgufHeader)` - Header of a valid GGUF file
/// * `Err(ModelError)` - If the file is not a valid GGUF file
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, ModelError> {
    let mut file = File::open(path)?;

    // magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8) = 24 bytes
    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    read_header(&mut file)
}

/// Reads the architecture, context length and chat template of a GGUF file.
///
/// Large arrays (vocabularies, merges) are skipped without being loaded.
pub fn read_gguf_metadata<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let header = validate_gguf(path.as_ref())?;
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    reader.seek(SeekFrom::Start(24))?;

    let mut metadata = GgufMetadata::default();
    // Context length keys are architecture-prefixed and may appear before the
    // architecture itself, so collect candidates first.
    let mut context_lengths: Vec<(String, u64)> = Vec::new();

    for _ in 0..header.metadata_kv_count {
        let key = read_string(&mut reader)?;
        let value_type = read_u32(&mut reader)?;

        if key == KEY_ARCHITECTURE || key == KEY_CHAT_TEMPLATE {
            if value_type != GGUF_TYPE_STRING {
                return Err(ModelError::Corrupt(format!("{key} is not a string")));
            }
            let value = read_string(&mut reader)?;
            if key == KEY_ARCHITECTURE {
                metadata.architecture = Some(value);
            } else {
                metadata.chat_template = Some(value);
            }
        } else if key.ends_with(".context_length") {
            match read_unsigned(&mut reader, value_type)? {
                Some(n) => context_lengths.push((key, n)),
                None => skip_value(&mut reader, &key, value_type)?,
            }
        } else {
            skip_value(&mut reader, &key, value_type)?;
        }
    }

    if let Some(arch) = &metadata.architecture {
        let wanted = format!("{arch}.context_length");
        metadata.context_length = context_lengths
            .iter()
            .find(|(key, _)| *key == wanted)
            .map(|(_, n)| *n);
    }

    tracing::debug!(
        "GGUF metadata: arch={:?}, context_length={:?}, chat_template={}",
        metadata.architecture,
        metadata.context_length,
        metadata.chat_template.is_some()
    );

    Ok(metadata)
}

const GGUF_TYPE_UINT8: u32 = 0;
const GGUF_TYPE_INT8: u32 = 1;
const GGUF_TYPE_UINT16: u32 = 2;
const GGUF_TYPE_INT16: u32 = 3;
const GGUF_TYPE_UINT32: u32 = 4;
const GGUF_TYPE_INT32: u32 = 5;
const GGUF_TYPE_FLOAT32: u32 = 6;
const GGUF_TYPE_BOOL: u32 = 7;
const GGUF_TYPE_STRING: u32 = 8;
const GGUF_TYPE_ARRAY: u32 = 9;
const GGUF_TYPE_UINT64: u32 = 10;
const GGUF_TYPE_INT64: u32 = 11;
const GGUF_TYPE_FLOAT64: u32 = 12;

fn read_header<R: Read>(reader: &mut R) -> Result<GgufHeader, ModelError> {
    let magic = read_u32(reader)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = read_u32(reader)?;
    // GGUF v2 and v3 are supported
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(reader)?;
    let metadata_kv_count = read_u64(reader)?;

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata_kv_count,
    })
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ModelError> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, ModelError> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, ModelError> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(ModelError::Corrupt(format!("string length {len}")));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| ModelError::Corrupt(e.to_string()))
}

/// Reads an unsigned integer value, or returns `None` (consuming nothing)
/// when `value_type` is not an unsigned integer type.
fn read_unsigned<R: Read>(reader: &mut R, value_type: u32) -> Result<Option<u64>, ModelError> {
    let value = match value_type {
        GGUF_TYPE_UINT32 => read_u32(reader)? as u64,
        GGUF_TYPE_UINT64 => read_u64(reader)?,
        GGUF_TYPE_INT32 => {
            let n = read_u32(reader)? as i32;
            u64::try_from(n).map_err(|_| ModelError::Corrupt(format!("negative length {n}")))?
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Size in bytes of a fixed-width value type.
fn fixed_width(value_type: u32) -> Option<u64> {
    match value_type {
        GGUF_TYPE_UINT8 | GGUF_TYPE_INT8 | GGUF_TYPE_BOOL => Some(1),
        GGUF_TYPE_UINT16 | GGUF_TYPE_INT16 => Some(2),
        GGUF_TYPE_UINT32 | GGUF_TYPE_INT32 | GGUF_TYPE_FLOAT32 => Some(4),
        GGUF_TYPE_UINT64 | GGUF_TYPE_INT64 | GGUF_TYPE_FLOAT64 => Some(8),
        _ => None,
    }
}

fn skip_bytes<R: Read + Seek>(reader: &mut R, n: u64) -> Result<(), ModelError> {
    let n = i64::try_from(n).map_err(|_| ModelError::Corrupt(format!("skip of {n} bytes")))?;
    reader.seek(SeekFrom::Current(n))?;
    Ok(())
}

fn skip_value<R: Read + Seek>(reader: &mut R, key: &str, value_type: u32) -> Result<(), ModelError> {
    if let Some(width) = fixed_width(value_type) {
        return skip_bytes(reader, width);
    }
    match value_type {
        GGUF_TYPE_STRING => {
            let len = read_u64(reader)?;
            skip_bytes(reader, len)
        }
        GGUF_TYPE_ARRAY => {
            let item_type = read_u32(reader)?;
            let count = read_u64(reader)?;
            if let Some(width) = fixed_width(item_type) {
                let total = width
                    .checked_mul(count)
                    .ok_or_else(|| ModelError::Corrupt(format!("array {key} too large")))?;
                return skip_bytes(reader, total);
            }
            for _ in 0..count {
                skip_value(reader, key, item_type)?;
            }
            Ok(())
        }
        _ => Err(ModelError::UnknownValueType {
            key: key.to_string(),
            value_type,
        }),
    }
}
