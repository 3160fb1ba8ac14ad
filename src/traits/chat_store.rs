//! Chat and message persistence
//!
//! Implement [`ChatStore`] to back the chat endpoint with a real database. [`InMemoryChatStore`] is
//! the default and keeps everything in process memory.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Error type for chat store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Chat not found with the given ID
    #[error("Chat not found: {0}")]
    NotFound(String),
    /// A chat with the given ID already exists
    #[error("Chat already exists: {0}")]
    AlreadyExists(String),
    /// Storage backend error
    #[error("Storage error: {0}")]
    StorageError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub chat_id: String,
    pub id: String,
    pub role: Role,
    /// Message parts exactly as the client sent them (or as produced for the assistant).
    pub parts: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ChatStore: Send + Sync + std::fmt::Debug {
    async fn lookup_chat(&self, id: &str) -> Result<Option<Chat>, StoreError>;

    /// Fails with [`StoreError::AlreadyExists`] if the id is taken; the existing chat is untouched.
    async fn create_chat(
        &self,
        id: &str,
        user_id: &str,
        title: &str,
        visibility: Visibility,
    ) -> Result<Chat, StoreError>;

    /// Number of user messages sent by `user_id` in the last `hours` hours.
    async fn count_recent_messages(&self, user_id: &str, hours: u32) -> Result<usize, StoreError>;

    async fn save_messages(&self, messages: Vec<StoredMessage>) -> Result<(), StoreError>;

    async fn update_chat_title(&self, chat_id: &str, title: &str) -> Result<(), StoreError>;

    /// Delete a chat and its messages, returning the deleted chat.
    async fn delete_chat(&self, id: &str) -> Result<Chat, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryChatStore {
    chats: Arc<DashMap<String, Chat>>,
    messages: Arc<DashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of a chat in insertion order.
    pub fn messages(&self, chat_id: &str) -> Vec<StoredMessage> {
        self.messages
            .get(chat_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn lookup_chat(&self, id: &str) -> Result<Option<Chat>, StoreError> {
        Ok(self.chats.get(id).map(|entry| entry.value().clone()))
    }

    async fn create_chat(
        &self,
        id: &str,
        user_id: &str,
        title: &str,
        visibility: Visibility,
    ) -> Result<Chat, StoreError> {
        match self.chats.entry(id.to_string()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(id.to_string())),
            Entry::Vacant(entry) => {
                let chat = Chat {
                    id: id.to_string(),
                    user_id: user_id.to_string(),
                    title: title.to_string(),
                    visibility,
                    created_at: Utc::now(),
                };
                entry.insert(chat.clone());
                Ok(chat)
            }
        }
    }

    async fn count_recent_messages(&self, user_id: &str, hours: u32) -> Result<usize, StoreError> {
        let since = Utc::now() - Duration::hours(i64::from(hours));
        let count = self
            .chats
            .iter()
            .filter(|chat| chat.user_id == user_id)
            .map(|chat| {
                self.messages
                    .get(chat.key())
                    .map(|messages| {
                        messages
                            .iter()
                            .filter(|m| m.role == Role::User && m.created_at >= since)
                            .count()
                    })
                    .unwrap_or(0)
            })
            .sum();
        Ok(count)
    }

    async fn save_messages(&self, messages: Vec<StoredMessage>) -> Result<(), StoreError> {
        for message in messages {
            if !self.chats.contains_key(&message.chat_id) {
                return Err(StoreError::NotFound(message.chat_id));
            }
            self.messages
                .entry(message.chat_id.clone())
                .or_default()
                .push(message);
        }
        Ok(())
    }

    async fn update_chat_title(&self, chat_id: &str, title: &str) -> Result<(), StoreError> {
        let mut chat = self
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(chat_id.to_string()))?;
        chat.title = title.to_string();
        Ok(())
    }

    async fn delete_chat(&self, id: &str) -> Result<Chat, StoreError> {
        let (_, chat) = self
            .chats
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.messages.remove(id);
        Ok(chat)
    }
}
