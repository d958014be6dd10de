//! Line reassembly over arbitrarily chunked process output
//!
//! rsync rewrites its progress line in place with `\r`, and pipes deliver
//! output in whatever chunks the kernel hands over, so one read can end in
//! the middle of a line, of a CRLF pair or of a multi-byte character.
//! [`LineSplitter`] buffers raw bytes and only decodes a line once its
//! terminator has been seen.

/// Incremental splitter for one output stream
///
/// `\n` and `\r` are equivalent line breaks. Empty segments are dropped, so
/// a CRLF pair yields a single line no matter where a chunk boundary falls.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Create an empty splitter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        for (idx, byte) in chunk.iter().enumerate() {
            if *byte == b'\n' || *byte == b'\r' {
                if self.pending.is_empty() {
                    if idx > start {
                        lines.push(decode(&chunk[start..idx]));
                    }
                } else {
                    self.pending.extend_from_slice(&chunk[start..idx]);
                    lines.push(decode(&self.pending));
                    self.pending.clear();
                }
                start = idx + 1;
            }
        }

        self.pending.extend_from_slice(&chunk[start..]);
        lines
    }

    /// Flush the unterminated remainder once the stream has closed
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode(&self.pending);
        self.pending.clear();
        Some(line)
    }

    /// Bytes buffered waiting for a terminator
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// Invalid sequences become U+FFFD rather than stalling the stream
fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
