//! Backend event to UI message stream transcoding
//!
//! ## Text span
//!
//! Model output is bracketed by exactly one span per request:
//!
//! 1. `text-start` - emitted right before the first non-empty delta
//! 2. `text-delta` - repeating
//! 3. `text-end` - emitted by [`Transcoder::close_span`] at end of stream, only if the span opened
//!
//! Node-tagged updates are forwarded verbatim when they come from the model node; anything from a
//! tool node is dropped so raw tool output never reaches the user. Whole-content updates are diffed
//! against the last content sent.

use tracing::trace;

use crate::protocol::{NormalizedEvent, UpstreamEvent};

/// Per-request transcoding state. Never shared between requests.
#[derive(Debug, Clone)]
pub struct Transcoder {
    text_span_open: bool,
    last_emitted_content: String,
    text_block_id: String,
    ended: bool,
}

impl Transcoder {
    pub fn new(text_block_id: impl Into<String>) -> Self {
        Self {
            text_span_open: false,
            last_emitted_content: String::new(),
            text_block_id: text_block_id.into(),
            ended: false,
        }
    }

    pub fn is_span_open(&self) -> bool {
        self.text_span_open
    }

    /// Whether the backend has sent its done sentinel.
    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// Translate one backend event into zero or more client events.
    pub fn process(&mut self, event: UpstreamEvent) -> Vec<NormalizedEvent> {
        match event {
            UpstreamEvent::ContentUpdate { node, content } => {
                if !UpstreamEvent::is_model_node(&node) {
                    trace!(node = %node, "Suppressing non-model node output");
                    return Vec::new();
                }
                self.text(content)
            }
            UpstreamEvent::RawDelta { text } => match self.diff(&text) {
                Some(delta) => {
                    self.last_emitted_content = text;
                    self.text(delta)
                }
                None => Vec::new(),
            },
            UpstreamEvent::Heartbeat => vec![NormalizedEvent::heartbeat_now()],
            UpstreamEvent::ErrorEvent { message } => vec![NormalizedEvent::Error {
                error_text: message,
            }],
            UpstreamEvent::StreamEnd => {
                self.ended = true;
                Vec::new()
            }
        }
    }

    /// Close the text span if one was opened. Returns `text-end` at most once.
    pub fn close_span(&mut self) -> Option<NormalizedEvent> {
        if !self.text_span_open {
            return None;
        }
        self.text_span_open = false;
        Some(NormalizedEvent::TextEnd {
            id: self.text_block_id.clone(),
        })
    }

    fn text(&mut self, delta: String) -> Vec<NormalizedEvent> {
        if delta.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(2);
        if !self.text_span_open {
            self.text_span_open = true;
            events.push(NormalizedEvent::TextStart {
                id: self.text_block_id.clone(),
            });
        }
        events.push(NormalizedEvent::TextDelta {
            id: self.text_block_id.clone(),
            delta,
        });
        events
    }

    /// The part of `content` not yet sent. A content that does not extend what was sent is
    /// treated as a fresh chunk in full.
    fn diff(&self, content: &str) -> Option<String> {
        if content.is_empty() || content == self.last_emitted_content {
            return None;
        }
        let delta = content
            .strip_prefix(self.last_emitted_content.as_str())
            .unwrap_or(content);
        Some(delta.to_string())
    }
}
