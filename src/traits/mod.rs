//! Collaborator traits for the chat endpoint
//!
//! The streaming pipeline only depends on these interfaces:
//!
//! - **ChatStore**: chats, messages, and the message count used for rate limiting
//! - **TitleGenerator**: titles for newly created chats

mod chat_store;
mod title_generator;

pub use chat_store::{Chat, ChatStore, InMemoryChatStore, Role, StoreError, StoredMessage, Visibility};
pub use title_generator::{FirstLineTitleGenerator, TitleError, TitleGenerator};
