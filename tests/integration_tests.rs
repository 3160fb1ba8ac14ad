//! Integration tests for the chat server
//!
//! These drive the public router with a scripted agent backend and check what the widget
//! receives and what ends up in the store.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chatstream::client::HttpClient;
use chatstream::traits::{ChatStore, InMemoryChatStore, Role};
use chatstream::upstream::{BackendMode, UpstreamConfig};
use chatstream::{AppState, auth::Sessions, build_router};
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::util::ServiceExt; // for oneshot()

/// Backend that answers every request with the same SSE chunks and records request bodies.
#[derive(Debug, Clone)]
struct ScriptedBackend {
    chunks: Vec<&'static str>,
    bodies: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedBackend {
    fn new(chunks: Vec<&'static str>) -> Self {
        Self {
            chunks,
            bodies: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl HttpClient for ScriptedBackend {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        let body = axum::body::to_bytes(req.into_body(), usize::MAX).await?;
        self.bodies.lock().unwrap().push(serde_json::from_slice(&body)?);

        let stream = futures_util::stream::iter(
            self.chunks
                .clone()
                .into_iter()
                .map(|chunk| Ok::<_, std::io::Error>(chunk.as_bytes().to_vec())),
        );
        Ok(axum::response::Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(stream))?)
    }
}

fn app(backend: ScriptedBackend, mode: BackendMode, store: Arc<InMemoryChatStore>) -> axum::Router {
    let upstream = UpstreamConfig::builder()
        .base_url("http://agent.internal:8000".parse().unwrap())
        .mode(mode)
        .build();
    let state = AppState::with_client(Some(upstream), backend)
        .with_store(store)
        .with_sessions(Sessions::new([(
            "alice-token".to_string(),
            "alice".to_string(),
        )]));
    build_router(state)
}

fn chat_request(chat_id: &str, text: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .header("authorization", "Bearer alice-token")
        .body(Body::from(
            serde_json::to_vec(&json!({
                "id": chat_id,
                "message": {
                    "id": "m-1",
                    "role": "user",
                    "parts": [{"type": "text", "text": text}]
                }
            }))
            .unwrap(),
        ))
        .unwrap()
}

/// Read the whole response body and split it into SSE payloads.
async fn read_frames(response: axum::response::Response) -> Vec<String> {
    let body: Vec<u8> = response
        .into_body()
        .into_data_stream()
        .map(|chunk| chunk.unwrap().to_vec())
        .collect::<Vec<_>>()
        .await
        .concat();
    String::from_utf8(body)
        .unwrap()
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| frame.strip_prefix("data: ").unwrap().to_string())
        .collect()
}

fn frame_types(frames: &[String]) -> Vec<String> {
    frames
        .iter()
        .map(|frame| {
            if frame == "[DONE]" {
                frame.clone()
            } else {
                let value: Value = serde_json::from_str(frame).unwrap();
                value["type"].as_str().unwrap().to_string()
            }
        })
        .collect()
}

/// The reply is saved by the pipeline task after the client has seen `[DONE]`.
async fn wait_for_messages(store: &InMemoryChatStore, chat_id: &str, count: usize) {
    for _ in 0..100 {
        if store.messages(chat_id).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("chat {chat_id} never reached {count} messages");
}

#[tokio::test]
async fn test_node_tagged_backend_end_to_end() {
    let backend = ScriptedBackend::new(vec![
        "data: {\"node\":\"tools\",\"content\":\"calculator: 4\"}\n\n",
        "data: {\"node\":\"model\",\"content\":\"4\"}\n\n",
        "data: [DONE]\n\n",
    ]);
    let store = Arc::new(InMemoryChatStore::new());
    let app = app(backend.clone(), BackendMode::NodeTagged, store.clone());

    let response = app.oneshot(chat_request("chat-42", "What is 2+2?")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["x-vercel-ai-ui-message-stream"],
        "v1"
    );
    assert_eq!(response.headers()["cache-control"], "no-cache");

    let frames = read_frames(response).await;
    assert_eq!(
        frame_types(&frames),
        vec!["start", "text-start", "text-delta", "text-end", "finish", "[DONE]"]
    );
    let delta: Value = serde_json::from_str(&frames[2]).unwrap();
    assert_eq!(delta["delta"], "4");
    assert!(frames.iter().all(|f| !f.contains("calculator")));

    assert_eq!(
        backend.bodies.lock().unwrap().as_slice(),
        &[json!({"message": "What is 2+2?", "thread_id": "chat-42"})]
    );

    wait_for_messages(&store, "chat-42", 2).await;
    let messages = store.messages("chat-42");
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].parts, vec![json!({"type": "text", "text": "4"})]);

    let chat = store.lookup_chat("chat-42").await.unwrap().unwrap();
    assert_eq!(chat.user_id, "alice");
}

#[tokio::test]
async fn test_whole_content_backend_streams_only_new_text() {
    let backend = ScriptedBackend::new(vec![
        "data: {\"output\":\"The answer\"}\n\n",
        "data: {\"output\":\"The answer is 4\"}\n\n",
        "data: {\"output\":\"The answer is 4\"}\n\n",
    ]);
    let store = Arc::new(InMemoryChatStore::new());
    let app = app(backend, BackendMode::WholeContent, store.clone());

    let response = app.oneshot(chat_request("chat-7", "2+2?")).await.unwrap();
    let frames = read_frames(response).await;

    let deltas: Vec<String> = frames
        .iter()
        .filter(|f| f.as_str() != "[DONE]")
        .map(|f| serde_json::from_str::<Value>(f).unwrap())
        .filter(|v| v["type"] == "text-delta")
        .map(|v| v["delta"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(deltas, vec!["The answer", " is 4"]);

    wait_for_messages(&store, "chat-7", 2).await;
    assert_eq!(store.messages("chat-7")[1].parts[0]["text"], "The answer is 4");
}

#[tokio::test]
async fn test_request_rejected_before_stream_has_json_error() {
    let backend = ScriptedBackend::new(vec![]);
    let store = Arc::new(InMemoryChatStore::new());
    let app = app(backend.clone(), BackendMode::NodeTagged, store);

    let response = app.oneshot(chat_request("chat-1", "   ")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()["content-type"], "application/json");

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(backend.bodies.lock().unwrap().is_empty());
}
