//! SmolChat Library
//!
//! On-device chat inference over llama.cpp: incremental text sessions with a
//! persistent context, image + text sessions, and a streaming worker.

pub mod config;
pub mod inference;
pub mod session;
pub mod storage;
pub mod types;

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    // Walk backwards from max_bytes to find a valid char boundary
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
