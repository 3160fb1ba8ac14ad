//! Client-facing output of one chat request
//!
//! ## Event Sequence
//!
//! Every response follows the same envelope, whatever the backend does:
//!
//! 1. `start`
//! 2. `text-start`, `text-delta`*, `text-end`, with `data-heartbeat` and `error` interleaved
//! 3. `finish`
//! 4. `[DONE]`
//!
//! After the terminal pair the sink is closed, the accumulated reply is saved and the title of a
//! new chat is applied. Both happen after the client has seen `[DONE]`, so their failures are
//! only logged.

use bytes::Bytes;
use futures_util::{FutureExt, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::ChatError;
use crate::protocol::{FinishReason, NormalizedEvent, UpstreamEvent};
use crate::sse::decode_frames;
use crate::traits::{ChatStore, Role, StoredMessage, TitleError};
use crate::transcoder::Transcoder;
use crate::upstream::{UpstreamError, UpstreamStream};

/// Frames buffered between the pipeline and the response body.
const SINK_BUFFER: usize = 64;

pub type SinkStream = ReceiverStream<Result<Bytes, Infallible>>;

/// Write half of the client response. Writes after the client went away are dropped.
#[derive(Debug)]
pub struct OutputSink {
    tx: Option<mpsc::Sender<Result<Bytes, Infallible>>>,
}

impl OutputSink {
    /// Create a sink and the stream to use as the response body.
    pub fn channel() -> (Self, SinkStream) {
        let (tx, rx) = mpsc::channel(SINK_BUFFER);
        (Self { tx: Some(tx) }, ReceiverStream::new(rx))
    }

    /// Write one event. Returns whether it was handed to the client.
    pub async fn send(&mut self, event: &NormalizedEvent) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if tx.send(Ok(Bytes::from(event.to_sse()))).await.is_err() {
            debug!("Client disconnected, dropping further writes");
            self.tx = None;
            return false;
        }
        true
    }

    /// Close the response body. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            debug!("Output stream closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Identifiers of one reply.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub chat_id: String,
    /// Id of the assistant message, sent in `start` and used when persisting.
    pub message_id: String,
    pub text_block_id: String,
}

impl StreamContext {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            text_block_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// What happened during one request, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub text: String,
    pub persisted: bool,
    pub failed: bool,
}

/// Run the whole pipeline for one request: open the backend stream, decode and transcode it onto
/// `sink`, emit the terminal sequence, then persist the reply and apply the title.
#[instrument(skip_all, fields(chat_id = %ctx.chat_id))]
pub async fn run_stream<F>(
    ctx: StreamContext,
    upstream: F,
    mut sink: OutputSink,
    store: Arc<dyn ChatStore>,
    title: Option<JoinHandle<Result<String, TitleError>>>,
) -> StreamOutcome
where
    F: Future<Output = Result<UpstreamStream, UpstreamError>> + Send,
{
    sink.send(&NormalizedEvent::Start {
        message_id: ctx.message_id.clone(),
    })
    .await;

    let mut transcoder = Transcoder::new(ctx.text_block_id.clone());
    let mut text = String::new();

    let result = AssertUnwindSafe(transcode(upstream, &mut transcoder, &mut sink, &mut text))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(ChatError::StreamProcessing(
                "transcoder panicked".to_string(),
            ))
        });

    let failed = result.is_err();
    if let Err(e) = result {
        error!(error = %e, "Stream failed");
        sink.send(&NormalizedEvent::Error {
            error_text: e.to_string(),
        })
        .await;
    }

    if let Some(end) = transcoder.close_span() {
        sink.send(&end).await;
    }
    sink.send(&NormalizedEvent::Finish {
        finish_reason: FinishReason::Stop,
    })
    .await;
    sink.send(&NormalizedEvent::Done).await;
    sink.close();

    let persisted = persist_reply(&ctx, &text, store.as_ref()).await;
    if let Some(title) = title {
        apply_title(&ctx.chat_id, title, store.as_ref()).await;
    }

    info!(
        reply_chars = text.chars().count(),
        persisted = persisted,
        failed = failed,
        "Chat stream complete"
    );

    StreamOutcome {
        text,
        persisted,
        failed,
    }
}

async fn transcode<F>(
    upstream: F,
    transcoder: &mut Transcoder,
    sink: &mut OutputSink,
    text: &mut String,
) -> Result<(), ChatError>
where
    F: Future<Output = Result<UpstreamStream, UpstreamError>>,
{
    let bytes = upstream.await?;
    let mut frames = std::pin::pin!(decode_frames(bytes));

    while let Some(frame) = frames.next().await {
        let Some(event) = UpstreamEvent::from_frame(frame?) else {
            continue;
        };
        for event in transcoder.process(event) {
            if let NormalizedEvent::TextDelta { delta, .. } = &event {
                text.push_str(delta);
            }
            sink.send(&event).await;
        }
        if transcoder.has_ended() {
            debug!("Backend signalled end of stream");
            break;
        }
    }

    Ok(())
}

/// Save the assistant reply if there is one. Returns whether it was saved.
async fn persist_reply(ctx: &StreamContext, text: &str, store: &dyn ChatStore) -> bool {
    if text.is_empty() {
        debug!("No reply text, nothing to persist");
        return false;
    }

    let message = StoredMessage {
        chat_id: ctx.chat_id.clone(),
        id: ctx.message_id.clone(),
        role: Role::Assistant,
        parts: vec![json!({"type": "text", "text": text})],
        created_at: chrono::Utc::now(),
    };
    match store.save_messages(vec![message]).await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Failed to persist assistant reply");
            false
        }
    }
}

/// Best effort: the client stream is already closed, so nobody is told about the new title.
async fn apply_title(
    chat_id: &str,
    title: JoinHandle<Result<String, TitleError>>,
    store: &dyn ChatStore,
) {
    let title = match title.await {
        Ok(Ok(title)) => title,
        Ok(Err(e)) => {
            warn!(error = %e, "Title generation failed");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Title generation task did not complete");
            return;
        }
    };
    if let Err(e) = store.update_chat_title(chat_id, &title).await {
        error!(error = %e, "Failed to update chat title");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{InMemoryChatStore, Visibility};
    use serde_json::Value;

    fn bytes_upstream(
        chunks: Vec<&'static str>,
    ) -> impl Future<Output = Result<UpstreamStream, UpstreamError>> + Send {
        async move {
            let stream = futures_util::stream::iter(
                chunks
                    .into_iter()
                    .map(|c| Ok::<_, UpstreamError>(Bytes::from_static(c.as_bytes()))),
            );
            Ok(Box::pin(stream) as UpstreamStream)
        }
    }

    fn failing_upstream(
        err: UpstreamError,
    ) -> impl Future<Output = Result<UpstreamStream, UpstreamError>> + Send {
        async move { Err(err) }
    }

    async fn store_with_chat() -> Arc<InMemoryChatStore> {
        let store = Arc::new(InMemoryChatStore::new());
        store
            .create_chat("chat-1", "alice", "New chat", Visibility::Private)
            .await
            .unwrap();
        store
    }

    /// Parse the SSE body into (type, payload) pairs, `[DONE]` mapping to ("[DONE]", Null).
    async fn collect_events(stream: SinkStream) -> Vec<(String, Value)> {
        let body: Vec<u8> = stream
            .map(|chunk| chunk.unwrap().to_vec())
            .collect::<Vec<_>>()
            .await
            .concat();
        String::from_utf8(body)
            .unwrap()
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| {
                let payload = frame.strip_prefix("data: ").unwrap();
                if payload == "[DONE]" {
                    ("[DONE]".to_string(), Value::Null)
                } else {
                    let value: Value = serde_json::from_str(payload).unwrap();
                    (value["type"].as_str().unwrap().to_string(), value)
                }
            })
            .collect()
    }

    fn types(events: &[(String, Value)]) -> Vec<&str> {
        events.iter().map(|(t, _)| t.as_str()).collect()
    }

    #[tokio::test]
    async fn test_single_answer_scenario() {
        let store = store_with_chat().await;
        let (sink, body) = OutputSink::channel();
        let ctx = StreamContext::new("chat-1");

        let upstream = bytes_upstream(vec![
            "data: {\"node\":\"model\",\"content\":\"4\"}\n\n",
            "data: [DONE]\n\n",
        ]);
        let (outcome, events) = tokio::join!(
            run_stream(ctx.clone(), upstream, sink, store.clone(), None),
            collect_events(body)
        );

        assert_eq!(
            types(&events),
            vec!["start", "text-start", "text-delta", "text-end", "finish", "[DONE]"]
        );
        assert_eq!(events[0].1["messageId"], ctx.message_id.as_str());
        assert_eq!(events[2].1["delta"], "4");
        assert_eq!(events[1].1["id"], events[3].1["id"]);
        assert_eq!(events[4].1["finishReason"], "stop");

        assert_eq!(outcome.text, "4");
        assert!(outcome.persisted);
        assert!(!outcome.failed);

        let messages = store.messages("chat-1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].id, ctx.message_id);
        assert_eq!(messages[0].parts[0]["text"], "4");
    }

    #[tokio::test]
    async fn test_upstream_failure_still_terminates_cleanly() {
        let store = store_with_chat().await;
        let (sink, body) = OutputSink::channel();

        let upstream = failing_upstream(UpstreamError::Connect("connection refused".to_string()));
        let (outcome, events) = tokio::join!(
            run_stream(StreamContext::new("chat-1"), upstream, sink, store.clone(), None),
            collect_events(body)
        );

        assert_eq!(types(&events), vec!["start", "error", "finish", "[DONE]"]);
        assert!(
            events[1].1["errorText"]
                .as_str()
                .unwrap()
                .contains("connection refused")
        );
        assert!(outcome.failed);
        assert!(!outcome.persisted);
        assert!(store.messages("chat-1").is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_failure_closes_open_span() {
        let store = store_with_chat().await;
        let (sink, body) = OutputSink::channel();

        let upstream = async {
            let stream = futures_util::stream::iter(vec![
                Ok(Bytes::from_static(b"data: {\"node\":\"agent\",\"content\":\"par\"}\n")),
                Err(UpstreamError::Timeout(std::time::Duration::from_secs(300))),
            ]);
            Ok::<_, UpstreamError>(Box::pin(stream) as UpstreamStream)
        };
        let (outcome, events) = tokio::join!(
            run_stream(StreamContext::new("chat-1"), upstream, sink, store.clone(), None),
            collect_events(body)
        );

        assert_eq!(
            types(&events),
            vec![
                "start",
                "text-start",
                "text-delta",
                "error",
                "text-end",
                "finish",
                "[DONE]"
            ]
        );
        assert!(outcome.failed);
        // the partial reply is still kept
        assert!(outcome.persisted);
        assert_eq!(store.messages("chat-1")[0].parts[0]["text"], "par");
    }

    #[tokio::test]
    async fn test_tools_heartbeats_and_errors_interleave() {
        let store = store_with_chat().await;
        let (sink, body) = OutputSink::channel();

        let upstream = bytes_upstream(vec![
            "data: {\"type\":\"ping\"}\n\n",
            "data: {\"node\":\"tools\",\"content\":\"SECRET TOOL OUTPUT\"}\n\n",
            "data: {\"node\":\"model\",\"content\":\"Hel\"}\n\ndata: {\"node\":\"mo",
            "del\",\"content\":\"lo\"}\n\ndata: not json\n\n",
            "data: {\"error\":\"rate limited by provider\"}\n\n",
        ]);
        let (outcome, events) = tokio::join!(
            run_stream(StreamContext::new("chat-1"), upstream, sink, store, None),
            collect_events(body)
        );

        assert_eq!(
            types(&events),
            vec![
                "start",
                "data-heartbeat",
                "text-start",
                "text-delta",
                "text-delta",
                "error",
                "text-end",
                "finish",
                "[DONE]"
            ]
        );
        assert!(events[1].1["data"]["timestamp"].is_i64());
        assert_eq!(outcome.text, "Hello");
        assert!(!outcome.text.contains("SECRET"));
        // a backend error event is forwarded, not a pipeline failure
        assert!(!outcome.failed);
    }

    #[tokio::test]
    async fn test_whole_content_backend_is_diffed() {
        let store = store_with_chat().await;
        let (sink, body) = OutputSink::channel();

        let upstream = bytes_upstream(vec![
            "data: {\"output\":\"Hi\"}\n\n",
            "data: {\"agent\":{\"messages\":[{\"role\":\"assistant\",\"content\":\"Hi there\"}]}}\n\n",
            "data: {\"output\":\"Hi there!\"}\n\n",
        ]);
        let (outcome, events) = tokio::join!(
            run_stream(StreamContext::new("chat-1"), upstream, sink, store, None),
            collect_events(body)
        );

        let deltas: Vec<_> = events
            .iter()
            .filter(|(t, _)| t == "text-delta")
            .map(|(_, v)| v["delta"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(deltas, vec!["Hi", " there", "!"]);
        assert_eq!(outcome.text, "Hi there!");
    }

    #[tokio::test]
    async fn test_no_text_means_no_persistence() {
        let store = store_with_chat().await;
        let (sink, body) = OutputSink::channel();

        let upstream = bytes_upstream(vec![
            "data: {\"node\":\"tools\",\"content\":\"x\"}\n\n",
            "data: [DONE]\n\n",
        ]);
        let (outcome, events) = tokio::join!(
            run_stream(StreamContext::new("chat-1"), upstream, sink, store.clone(), None),
            collect_events(body)
        );

        assert_eq!(types(&events), vec!["start", "finish", "[DONE]"]);
        assert!(!outcome.persisted);
        assert!(store.messages("chat-1").is_empty());
    }

    #[tokio::test]
    async fn test_frames_after_done_are_not_read() {
        let store = store_with_chat().await;
        let (sink, body) = OutputSink::channel();

        let upstream = bytes_upstream(vec![
            "data: {\"node\":\"model\",\"content\":\"a\"}\n\ndata: [DONE]\n\n",
            "data: {\"node\":\"model\",\"content\":\"b\"}\n\n",
        ]);
        let (outcome, _) = tokio::join!(
            run_stream(StreamContext::new("chat-1"), upstream, sink, store, None),
            collect_events(body)
        );

        assert_eq!(outcome.text, "a");
    }

    #[tokio::test]
    async fn test_client_disconnect_still_persists() {
        let store = store_with_chat().await;
        let (sink, body) = OutputSink::channel();
        drop(body);

        let upstream = bytes_upstream(vec![
            "data: {\"node\":\"model\",\"content\":\"still \"}\n\n",
            "data: {\"node\":\"model\",\"content\":\"saved\"}\n\n",
        ]);
        let outcome = run_stream(StreamContext::new("chat-1"), upstream, sink, store.clone(), None)
            .await;

        assert_eq!(outcome.text, "still saved");
        assert!(outcome.persisted);
        assert_eq!(store.messages("chat-1")[0].parts[0]["text"], "still saved");
    }

    #[tokio::test]
    async fn test_title_is_applied_after_stream() {
        let store = store_with_chat().await;
        let (sink, body) = OutputSink::channel();
        let title = tokio::spawn(async { Ok::<_, TitleError>("Arithmetic".to_string()) });

        let upstream = bytes_upstream(vec!["data: {\"node\":\"model\",\"content\":\"4\"}\n\n"]);
        let _ = tokio::join!(
            run_stream(
                StreamContext::new("chat-1"),
                upstream,
                sink,
                store.clone(),
                Some(title)
            ),
            collect_events(body)
        );

        let chat = store.lookup_chat("chat-1").await.unwrap().unwrap();
        assert_eq!(chat.title, "Arithmetic");
    }

    #[tokio::test]
    async fn test_failed_title_leaves_placeholder() {
        let store = store_with_chat().await;
        let (sink, _body) = OutputSink::channel();
        let title = tokio::spawn(async {
            Err::<String, _>(TitleError::GenerationFailed("model down".to_string()))
        });

        let upstream = bytes_upstream(vec![]);
        run_stream(
            StreamContext::new("chat-1"),
            upstream,
            sink,
            store.clone(),
            Some(title),
        )
        .await;

        let chat = store.lookup_chat("chat-1").await.unwrap().unwrap();
        assert_eq!(chat.title, "New chat");
    }

    #[tokio::test]
    async fn test_sink_double_close_is_noop() {
        let (mut sink, body) = OutputSink::channel();

        assert!(sink.send(&NormalizedEvent::Done).await);
        sink.close();
        sink.close();
        assert!(sink.is_closed());
        assert!(!sink.send(&NormalizedEvent::Done).await);

        let frames: Vec<_> = body.collect().await;
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test]
    async fn test_sink_write_after_disconnect_is_dropped() {
        let (mut sink, body) = OutputSink::channel();
        drop(body);

        assert!(!sink.send(&NormalizedEvent::Done).await);
        assert!(sink.is_closed());
        sink.close();
    }
}
