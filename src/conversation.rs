//! Conversation Store Module
//!
//! Multi-turn history kept independently of which upstream key served a turn.
//! Backends implement [`ConversationStore`]; every append updates the message
//! list and the conversation metadata in one atomic step and refreshes the TTL.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::provider::ChatMessage;

#[derive(Error, Debug)]
pub enum ConversationError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, ConversationError>;

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Which model and key produced a message
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// A single persisted message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMeta>,
}

impl StoredMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, timestamp: f64) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
            tokens: None,
            metadata: None,
        }
    }

    pub fn with_tokens(mut self, tokens: Option<u64>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_meta(mut self, model: Option<String>, key_id: Option<String>) -> Self {
        self.metadata = Some(MessageMeta { model, key_id });
        self
    }

    pub fn model(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.model.as_deref())
    }
}

impl From<&StoredMessage> for ChatMessage {
    fn from(m: &StoredMessage) -> Self {
        ChatMessage::new(m.role.as_str(), m.content.clone())
    }
}

/// History entry as returned to callers; only `role`/`content` unless
/// metadata was requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMeta>,
}

impl HistoryEntry {
    pub fn from_stored(m: StoredMessage, include_metadata: bool) -> Self {
        if include_metadata {
            Self {
                role: m.role,
                content: m.content,
                timestamp: Some(m.timestamp),
                tokens: m.tokens,
                metadata: m.metadata,
            }
        } else {
            Self {
                role: m.role,
                content: m.content,
                timestamp: None,
                tokens: None,
                metadata: None,
            }
        }
    }
}

/// Conversation metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConversationMetadata {
    pub created_at: f64,
    pub updated_at: f64,
    /// Messages currently stored
    pub message_count: u64,
    /// Cumulative over the conversation lifetime
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ConversationMetadata {
    pub fn new(now: f64, init: &ConversationInit) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            user_id: init.user_id.clone(),
            extra: init.extra.clone(),
            ..Default::default()
        }
    }

    /// Account for appended messages. `message_count` is set by the caller
    /// after any trimming.
    pub fn record_append(&mut self, messages: &[StoredMessage], now: f64) {
        self.updated_at = now;
        self.total_tokens += messages.iter().filter_map(|m| m.tokens).sum::<u64>();
        if let Some(model) = messages.iter().rev().find_map(|m| m.model()) {
            self.last_model = Some(model.to_string());
        }
    }
}

/// Caller-supplied fields for a new conversation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationInit {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conv_id: String,
    pub metadata: ConversationMetadata,
}

pub(crate) fn validate_conv_id(conv_id: &str) -> Result<()> {
    if conv_id.trim().is_empty() {
        return Err(ConversationError::InvalidInput(
            "conversation id must not be empty".into(),
        ));
    }
    Ok(())
}

/// Conversation storage trait
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Initialize the storage backend
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Create an empty conversation. Returns `false` when it already exists.
    async fn create_conversation(&self, conv_id: &str, init: &ConversationInit) -> Result<bool>;

    /// Append messages atomically, creating the conversation if needed.
    async fn append_messages(&self, conv_id: &str, messages: &[StoredMessage]) -> Result<()>;

    /// Messages oldest first; `limit` keeps only the most recent ones.
    async fn load_messages(&self, conv_id: &str, limit: Option<usize>)
        -> Result<Vec<StoredMessage>>;

    async fn get_metadata(&self, conv_id: &str) -> Result<Option<ConversationMetadata>>;

    /// Keep only the last `keep_last_n` messages. Returns `false` for an unknown conversation.
    async fn truncate_history(&self, conv_id: &str, keep_last_n: usize) -> Result<bool>;

    /// Returns `false` for an unknown conversation.
    async fn delete_conversation(&self, conv_id: &str) -> Result<bool>;

    /// Most recently updated first.
    async fn list_conversations(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>>;

    /// Health check
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }

    fn backend_name(&self) -> &'static str;
}
