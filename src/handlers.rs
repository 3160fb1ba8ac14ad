/// Axum handlers for the chat server
use crate::AppState;
use crate::client::HttpClient;
use crate::errors::ChatError;
use crate::message::ChatRequest;
use crate::multiplexer::{OutputSink, StreamContext, run_stream};
use crate::protocol::{UI_MESSAGE_STREAM_HEADER, UI_MESSAGE_STREAM_VERSION};
use crate::traits::{Chat, Role, StoreError, StoredMessage};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use tracing::{debug, info, instrument};

/// Window used for the per-user message limit.
const RATE_LIMIT_WINDOW_HOURS: u32 = 24;

/// Placeholder title of a chat until its generated title arrives.
const PLACEHOLDER_TITLE: &str = "New chat";

/// Accept one user message and stream the agent's reply back as a UI message stream.
///
/// Everything that can be rejected is rejected here, before the response is committed and before
/// the backend is contacted. After that, failures are reported inside the stream.
#[instrument(skip(state, headers, body))]
pub async fn chat_handler<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ChatError> {
    let request = ChatRequest::from_slice(&body)?;

    let upstream = state.upstream.clone().ok_or_else(|| {
        ChatError::Configuration("no agent backend URL configured".to_string())
    })?;

    let session = state
        .sessions
        .resolve(&headers)
        .ok_or(ChatError::Unauthorized)?;

    let text = request.message.require_text()?;

    let recent = state
        .store
        .count_recent_messages(&session.user_id, RATE_LIMIT_WINDOW_HOURS)
        .await?;
    if recent >= state.max_messages_per_day {
        debug!(user_id = %session.user_id, recent, "Message limit reached");
        return Err(ChatError::RateLimited {
            limit: state.max_messages_per_day,
        });
    }

    let is_new_chat = match state.store.lookup_chat(&request.id).await? {
        Some(chat) => {
            ensure_owner(&chat, &session.user_id)?;
            false
        }
        None => match state
            .store
            .create_chat(
                &request.id,
                &session.user_id,
                PLACEHOLDER_TITLE,
                request.selected_visibility_type,
            )
            .await
        {
            Ok(_) => true,
            // Created by a concurrent request since the lookup.
            Err(StoreError::AlreadyExists(_)) => {
                let chat = state
                    .store
                    .lookup_chat(&request.id)
                    .await?
                    .ok_or(ChatError::NotFound)?;
                ensure_owner(&chat, &session.user_id)?;
                false
            }
            Err(e) => return Err(e.into()),
        },
    };

    state
        .store
        .save_messages(vec![StoredMessage {
            chat_id: request.id.clone(),
            id: request.message.id.clone(),
            role: Role::User,
            parts: request.message.parts.clone(),
            created_at: chrono::Utc::now(),
        }])
        .await?;

    let title = is_new_chat.then(|| {
        let titles = state.titles.clone();
        let message = text.clone();
        tokio::spawn(async move { titles.generate_title(&message).await })
    });

    let ctx = StreamContext::new(request.id.clone());
    info!(chat_id = %ctx.chat_id, message_id = %ctx.message_id, "Streaming agent reply");

    let (sink, body) = OutputSink::channel();
    let thread_id = request.id;
    let backend = async move { upstream.open(&text, &thread_id).await };
    tokio::spawn(run_stream(ctx, backend, sink, state.store.clone(), title));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .header(UI_MESSAGE_STREAM_HEADER, UI_MESSAGE_STREAM_VERSION)
        .body(Body::from_stream(body))
        .map_err(ChatError::unhandled)
}

/// Delete one of the caller's chats, returning the deleted record.
#[instrument(skip(state, headers))]
pub async fn delete_chat_handler<T: HttpClient + Clone + Send + Sync + 'static>(
    State(state): State<AppState<T>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Chat>, ChatError> {
    let session = state
        .sessions
        .resolve(&headers)
        .ok_or(ChatError::Unauthorized)?;

    let chat = state
        .store
        .lookup_chat(&id)
        .await?
        .ok_or(ChatError::NotFound)?;
    ensure_owner(&chat, &session.user_id)?;

    let deleted = state.store.delete_chat(&id).await?;
    info!(chat_id = %deleted.id, "Chat deleted");
    Ok(Json(deleted))
}

fn ensure_owner(chat: &Chat, user_id: &str) -> Result<(), ChatError> {
    if chat.user_id != user_id {
        debug!(chat_id = %chat.id, "Chat belongs to another user");
        return Err(ChatError::Forbidden);
    }
    Ok(())
}

pub async fn health() -> &'static str {
    "ok"
}
