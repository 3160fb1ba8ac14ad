//! Chat title generation
//!
//! Titles are computed concurrently with the first reply of a new chat and written to the store
//! once the stream has finished. Implement [`TitleGenerator`] to use a model for this; the default
//! [`FirstLineTitleGenerator`] derives the title from the user's message.

use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TitleError {
    #[error("Title generation failed: {0}")]
    GenerationFailed(String),
}

#[async_trait]
pub trait TitleGenerator: Send + Sync + std::fmt::Debug {
    async fn generate_title(&self, message: &str) -> Result<String, TitleError>;
}

/// Uses the first non-blank line of the message, whitespace collapsed and cut to `max_chars`.
#[derive(Debug, Clone)]
pub struct FirstLineTitleGenerator {
    max_chars: usize,
}

impl FirstLineTitleGenerator {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for FirstLineTitleGenerator {
    fn default() -> Self {
        Self::new(80)
    }
}

#[async_trait]
impl TitleGenerator for FirstLineTitleGenerator {
    async fn generate_title(&self, message: &str) -> Result<String, TitleError> {
        let line = message
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| TitleError::GenerationFailed("message has no text".to_string()))?;
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");

        if collapsed.chars().count() <= self.max_chars {
            return Ok(collapsed);
        }
        let cut: String = collapsed.chars().take(self.max_chars).collect();
        Ok(format!("{}...", cut.trim_end()))
    }
}
