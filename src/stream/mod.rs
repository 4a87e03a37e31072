//! Inbound stream plumbing: frame parsing and byte-to-text decoding.

pub mod frame;

pub use frame::{Frame, FrameBatch, FrameParser};

/// Accumulates raw body bytes and yields valid UTF-8 text, holding back any
/// multi-byte sequence split across network chunks until its tail arrives.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    remainder: Vec<u8>,
}

impl Utf8Accumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk of body bytes, invoking `sink` with each decodable text
    /// segment. An incomplete trailing sequence is buffered until its tail
    /// arrives; a sequence that can never become valid UTF-8 is replaced with
    /// U+FFFD and decoding resumes right after it.
    pub fn push(&mut self, bytes: &[u8], mut sink: impl FnMut(&str)) {
        if self.remainder.is_empty() {
            if let Ok(text) = std::str::from_utf8(bytes) {
                sink(text);
                return;
            }
        }

        self.remainder.extend_from_slice(bytes);
        loop {
            match std::str::from_utf8(&self.remainder) {
                Ok(text) => {
                    sink(text);
                    self.remainder.clear();
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    if valid_up_to > 0 {
                        // Safety: valid_up_to is a valid UTF-8 boundary.
                        let text = unsafe {
                            std::str::from_utf8_unchecked(&self.remainder[..valid_up_to])
                        };
                        sink(text);
                    }
                    match e.error_len() {
                        // Definitively invalid sequence, not a split boundary:
                        // replace it and keep decoding what follows.
                        Some(len) => {
                            sink("\u{FFFD}");
                            self.remainder.drain(..valid_up_to + len);
                        }
                        // Incomplete trailing sequence: wait for its tail.
                        None => {
                            let remain_len = self.remainder.len() - valid_up_to;
                            self.remainder.copy_within(valid_up_to.., 0);
                            self.remainder.truncate(remain_len);
                            return;
                        }
                    }
                }
            }
        }
    }
}
