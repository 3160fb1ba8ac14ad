//! SSE frame decoding for the agent backend stream
//!
//! The backend writes one `data: <json>` line per event. Network chunks can split a line (and a
//! multi-byte character) anywhere, so [`SseDecoder`] keeps the trailing incomplete line as carry-over
//! and only decodes complete lines. Splitting happens on raw bytes: `\n` never occurs inside a UTF-8
//! multi-byte sequence, so a complete line is always a complete run of characters.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::{trace, warn};

/// Marker that prefixes every payload line.
pub const DATA_PREFIX: &str = "data: ";

/// Payload the backend sends when it has nothing more to say.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded backend frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Payload(serde_json::Value),
    /// The done sentinel. Never parsed as JSON.
    Done,
}

/// Incremental line decoder. Feed it chunks with [`push`](Self::push) and call
/// [`finish`](Self::finish) once the byte stream is exhausted.
#[derive(Debug, Default)]
pub struct SseDecoder {
    carry: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.carry.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.carry[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            if let Some(frame) = decode_line(&self.carry[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
        }
        self.carry.drain(..start);

        frames
    }

    /// Decode whatever is left in the carry-over once the stream has ended. Backends usually
    /// terminate their last line, but a final unterminated `data:` line is still honoured.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.carry);
        decode_line(&rest)
    }

    /// Bytes currently held back waiting for a line feed.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

fn decode_line(line: &[u8]) -> Option<SseFrame> {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Skipping SSE line that is not valid UTF-8");
            return None;
        }
    };

    let payload = line.strip_prefix(DATA_PREFIX)?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == DONE_SENTINEL {
        trace!("Received [DONE] marker");
        return Some(SseFrame::Done);
    }

    match serde_json::from_str(payload) {
        Ok(value) => Some(SseFrame::Payload(value)),
        Err(e) => {
            warn!(error = %e, payload = %payload, "Skipping malformed SSE payload");
            None
        }
    }
}

/// Drive an [`SseDecoder`] over a byte stream.
///
/// A transport error is passed through and ends the frame stream. The byte stream is owned by the
/// returned stream and dropped with it, whichever way decoding ends.
pub fn decode_frames<S, E>(bytes: S) -> impl Stream<Item = Result<SseFrame, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for frame in decoder.push(&chunk) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(frame) = decoder.finish() {
            yield Ok(frame);
        }
    }
}
