//! Incremental UTF-8 assembly
//!
//! Token pieces come back from the model as raw bytes and can split a
//! multi-byte character across two generation steps. The assembler
//! buffers pieces and only ever releases complete, valid UTF-8.

/// Accumulates raw generated bytes and releases the longest prefix that
/// is complete UTF-8. An incomplete trailing sequence stays buffered
/// until the next push completes it.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    buf: Vec<u8>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw token piece.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Releases the longest valid UTF-8 prefix of the buffer, or `None`
    /// if nothing complete has accumulated yet.
    ///
    /// A trailing sequence that could still be completed by later bytes
    /// is kept. Bytes that can never start or continue a valid sequence
    /// are discarded; the model is not expected to produce those except
    /// where a character was cut at a step boundary.
    pub fn drain(&mut self) -> Option<String> {
        match std::str::from_utf8(&self.buf) {
            Ok(s) => {
                if s.is_empty() {
                    return None;
                }
                let out = s.to_string();
                self.buf.clear();
                Some(out)
            }
            Err(e) => {
                let valid = e.valid_up_to();
                let rest_malformed = e.error_len().is_some();
                let out = if valid > 0 {
                    // Safe: from_utf8 validated exactly this prefix
                    let s = std::str::from_utf8(&self.buf[..valid])
                        .unwrap_or_default()
                        .to_string();
                    self.buf.drain(..valid);
                    Some(s)
                } else {
                    None
                };
                if rest_malformed {
                    tracing::trace!("Dropping {} malformed trailing bytes", self.buf.len());
                    self.buf.clear();
                }
                out
            }
        }
    }

    /// Final flush at end of generation: releases the valid prefix and
    /// drops whatever undecodable tail remains.
    pub fn finish(mut self) -> Option<String> {
        let out = self.drain();
        if !self.buf.is_empty() {
            tracing::trace!("Dropping {} undecodable residual bytes", self.buf.len());
        }
        out
    }

    /// Bytes currently held back.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
