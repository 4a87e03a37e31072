//! Incremental SSE-shaped frame parser.
//!
//! Splits a raw incremental text stream into discrete event frames (event
//! name + data payload), tolerant of partial network chunks, CRLF line
//! endings, and comment lines. Comment lines never produce frames but are
//! counted as activity signals so liveness watchdogs can be bumped.

use memchr::memchr_iter;
use smallvec::SmallVec;

/// One complete parsed frame: optional event name plus joined data payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

/// Inline batch of frames produced by one feed call.
pub type FrameBatch = SmallVec<[Frame; 4]>;

/// Incremental frame parser.
///
/// Feed it raw text chunks arriving at arbitrary byte boundaries; it yields
/// fully-assembled [`Frame`]s. Within a block: `event:` sets the declared
/// event name, one or more `data:` lines are newline-joined into the payload,
/// `:` lines are comments, and a blank line dispatches the block. Blocks
/// whose joined payload is empty are discarded.
pub struct FrameParser {
    buffer: String,
    read_offset: usize,
    event_name: Option<String>,
    data_buffer: String,
    has_data: bool,
    comment_lines: u64,
}

impl FrameParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            event_name: None,
            data_buffer: String::new(),
            has_data: false,
            comment_lines: 0,
        }
    }

    /// Total comment lines seen so far. The read loop diffs this counter to
    /// detect liveness-only activity that produces no frames.
    #[must_use]
    pub fn comment_lines(&self) -> u64 {
        self.comment_lines
    }

    /// Feed raw text and return any complete frames parsed.
    pub fn feed(&mut self, chunk: &str) -> FrameBatch {
        let mut out = FrameBatch::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete frames into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &str, out: &mut FrameBatch) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            Self::process_line(
                line,
                &mut self.event_name,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.comment_lines,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Flush at end of stream: the producer is not required to terminate the
    /// final block with a blank line. Processes any trailing partial line and
    /// dispatches a pending block.
    pub fn finish_into(&mut self, out: &mut FrameBatch) {
        if self.read_offset < self.buffer.len() {
            let tail = self.buffer.split_off(self.read_offset);
            let mut line = tail.as_str();
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            Self::process_line(
                line,
                &mut self.event_name,
                &mut self.data_buffer,
                &mut self.has_data,
                &mut self.comment_lines,
                out,
            );
        }
        self.buffer.clear();
        self.read_offset = 0;
        Self::dispatch(
            &mut self.event_name,
            &mut self.data_buffer,
            &mut self.has_data,
            out,
        );
    }

    fn process_line(
        line: &str,
        event_name: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        comment_lines: &mut u64,
        out: &mut FrameBatch,
    ) {
        if line.is_empty() {
            Self::dispatch(event_name, data_buffer, has_data, out);
            return;
        }

        // Comment line: activity signal only, never part of a frame.
        if line.starts_with(':') {
            *comment_lines += 1;
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if *has_data {
                data_buffer.push('\n');
            } else {
                *has_data = true;
            }
            data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *event_name = Some(value.to_string());
        }
        // Unknown field names are ignored.
    }

    fn dispatch(
        event_name: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        out: &mut FrameBatch,
    ) {
        let name = event_name.take();
        if !*has_data {
            return;
        }
        *has_data = false;
        let data = std::mem::take(data_buffer);
        if data.is_empty() {
            // Empty payload block: discarded.
            return;
        }
        out.push(Frame { event: name, data });
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
