//! Incremental decoder for `text/event-stream` bodies from backends.

use bytes::BytesMut;
use llm_gateway_common::STREAM_DONE;

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// The joined `data:` payload of an event.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

/// Splits an arbitrarily chunked byte stream into SSE events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((pos, delimiter_len)) = find_sse_delimiter(&self.buffer) {
            let event = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);
            if let Some(frame) = decode_event(&event) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = self.buffer.split();
        decode_event(&rest)
    }
}

fn decode_event(event: &[u8]) -> Option<SseFrame> {
    let data = extract_sse_data(event)?;
    let text = String::from_utf8_lossy(&data).into_owned();
    if text == STREAM_DONE {
        Some(SseFrame::Done)
    } else {
        Some(SseFrame::Data(text))
    }
}

fn find_sse_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    // Single forward scan so mixed newline styles split at the earliest boundary.
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len() && &buf[idx..idx + 4] == b"\r\n\r\n" {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}

fn extract_sse_data(event: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let rest = trim_ascii_whitespace(rest);
        if rest.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(b'\n');
        }
        out.extend_from_slice(rest);
    }
    (!out.is_empty()).then_some(out)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(start);
    &bytes[start..end]
}
