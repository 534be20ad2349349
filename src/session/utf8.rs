//! UTF-8 reassembly
//!
//! The engine hands out one token piece at a time and a multi-byte
//! character may straddle two pieces. [`Utf8Reassembler`] holds bytes back
//! until every started sequence is complete, then releases the whole
//! buffer at once.

/// Where the scanner stands after the bytes seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ScanState {
    /// Every sequence in the buffer is complete
    #[default]
    Complete,
    /// The last sequence still needs this many continuation bytes
    AwaitingContinuation(u8),
}

/// Buffers raw token bytes until they form complete UTF-8 text.
///
/// Only newly fed bytes are scanned; the state carried between calls is the
/// number of continuation bytes still owed by the last sequence.
#[derive(Debug, Default)]
pub struct Utf8Reassembler {
    buffer: Vec<u8>,
    state: ScanState,
}

impl Utf8Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns the whole buffer as text once it holds
    /// only complete sequences.
    ///
    /// Returns `None` while a multi-byte sequence is cut off at the end of
    /// the buffer. A structurally invalid byte (a stray continuation byte or
    /// an impossible lead byte) cannot be fixed by waiting, so the buffer is
    /// released immediately with replacement characters.
    pub fn feed(&mut self, bytes: &[u8]) -> Option<String> {
        if bytes.is_empty() {
            return None;
        }
        let start = self.buffer.len();
        self.buffer.extend_from_slice(bytes);

        let mut state = Some(self.state);
        for &byte in &self.buffer[start..] {
            let Some(current) = state else { break };
            state = match (current, byte) {
                (ScanState::AwaitingContinuation(n), b) if b & 0xC0 == 0x80 => {
                    if n == 1 {
                        Some(ScanState::Complete)
                    } else {
                        Some(ScanState::AwaitingContinuation(n - 1))
                    }
                }
                (ScanState::AwaitingContinuation(_), _) => None,
                (ScanState::Complete, b) => sequence_len(b).map(|len| match len {
                    1 => ScanState::Complete,
                    n => ScanState::AwaitingContinuation(n - 1),
                }),
            };
        }

        let Some(state) = state else {
            return Some(self.flush_invalid());
        };
        self.state = state;

        match self.state {
            ScanState::Complete => Some(self.flush()),
            ScanState::AwaitingContinuation(_) => None,
        }
    }

    /// True while bytes are held back.
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Discards held-back bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = ScanState::Complete;
    }

    fn flush(&mut self) -> String {
        self.state = ScanState::Complete;
        match String::from_utf8(std::mem::take(&mut self.buffer)) {
            Ok(text) => text,
            // Structurally complete but not valid text (overlong forms,
            // surrogates).
            Err(e) => {
                tracing::warn!("Token bytes are not valid UTF-8: {}", e.utf8_error());
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        }
    }

    fn flush_invalid(&mut self) -> String {
        tracing::warn!(
            "Malformed UTF-8 in token stream, releasing {} buffered bytes",
            self.buffer.len()
        );
        self.state = ScanState::Complete;
        let bytes = std::mem::take(&mut self.buffer);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Sequence length announced by a lead byte.
fn sequence_len(lead: u8) -> Option<u8> {
    if lead & 0x80 == 0x00 {
        Some(1)
    } else if lead & 0xE0 == 0xC0 {
        Some(2)
    } else if lead & 0xF0 == 0xE0 {
        Some(3)
    } else if lead & 0xF8 == 0xF0 {
        Some(4)
    } else {
        None
    }
}
