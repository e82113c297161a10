//! Conversation Manager
//!
//! Picks the conversation backend from configuration and exposes the
//! caller-facing history operations.

use crate::clock::Clock;
use crate::conversation::{
    ConversationError, ConversationInit, ConversationMetadata, ConversationStore,
    ConversationSummary, HistoryEntry, MessageMeta, MessageRole, Result, StoredMessage,
};
use crate::conversation_memory::MemoryConversationStore;
use crate::conversation_redis::RedisConversationStore;
use crate::redis_pool::RedisPool;
use crate::util::{env_parse, env_string};

use std::sync::Arc;
use std::time::Duration;

/// Configuration for conversation storage
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// `memory` or `redis`
    pub backend: String,
    /// TTL in seconds, refreshed on every mutation
    pub ttl_seconds: u64,
    /// Oldest messages are trimmed past this count (None = unbounded)
    pub max_messages: Option<usize>,
    /// Key prefix for the Redis backend
    pub key_prefix: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            ttl_seconds: 86_400, // 24 hours
            max_messages: None,
            key_prefix: "keyrelay".to_string(),
        }
    }
}

impl ConversationConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let backend = env_string("KEYRELAY_CONVERSATION_BACKEND")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or(defaults.backend);
        let ttl_seconds = env_parse("KEYRELAY_CONVERSATION_TTL_SECONDS", defaults.ttl_seconds);
        let max_messages = env_string("KEYRELAY_CONVERSATION_MAX_MESSAGES")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|m| *m > 0);
        let key_prefix = env_string("KEYRELAY_QUOTA_PREFIX").unwrap_or(defaults.key_prefix);

        Self {
            backend,
            ttl_seconds,
            max_messages,
            key_prefix,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Conversation manager
pub struct ConversationManager {
    store: Arc<dyn ConversationStore>,
    config: ConversationConfig,
    clock: Arc<dyn Clock>,
}

impl ConversationManager {
    /// Create a manager with the backend named in `config`. `pool` is required
    /// for the redis backend.
    pub async fn new(
        config: ConversationConfig,
        clock: Arc<dyn Clock>,
        pool: Option<RedisPool>,
    ) -> Result<Self> {
        let store = Self::create_backend(&config, clock.clone(), pool)?;
        store.init().await?;
        Ok(Self {
            store,
            config,
            clock,
        })
    }

    /// Wrap an existing store.
    pub fn with_store(
        store: Arc<dyn ConversationStore>,
        config: ConversationConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    fn create_backend(
        config: &ConversationConfig,
        clock: Arc<dyn Clock>,
        pool: Option<RedisPool>,
    ) -> Result<Arc<dyn ConversationStore>> {
        match config.backend.as_str() {
            "memory" => Ok(Arc::new(
                MemoryConversationStore::new(clock, config.ttl())
                    .with_max_messages(config.max_messages),
            )),
            "redis" => {
                let pool = pool.ok_or_else(|| {
                    ConversationError::InvalidInput("Redis pool not configured".to_string())
                })?;
                Ok(Arc::new(
                    RedisConversationStore::new(pool, clock, config.key_prefix.clone(), config.ttl())
                        .with_max_messages(config.max_messages),
                ))
            }
            other => Err(ConversationError::InvalidInput(format!(
                "Unknown backend: {}",
                other
            ))),
        }
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    pub async fn create_conversation(&self, conv_id: &str, init: ConversationInit) -> Result<bool> {
        self.store.create_conversation(conv_id, &init).await
    }

    /// Append one message.
    pub async fn append_message(
        &self,
        conv_id: &str,
        role: MessageRole,
        content: &str,
        tokens: Option<u64>,
        metadata: Option<MessageMeta>,
    ) -> Result<()> {
        let mut message = StoredMessage::new(role, content, self.clock.now()).with_tokens(tokens);
        message.metadata = metadata;
        self.store.append_messages(conv_id, &[message]).await
    }

    /// Append several messages as one atomic step.
    pub async fn append_turn(&self, conv_id: &str, messages: &[StoredMessage]) -> Result<()> {
        self.store.append_messages(conv_id, messages).await
    }

    /// Raw messages, for building provider requests.
    pub async fn load_messages(
        &self,
        conv_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        self.store.load_messages(conv_id, limit).await
    }

    pub async fn get_history(
        &self,
        conv_id: &str,
        limit: Option<usize>,
        include_metadata: bool,
    ) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .store
            .load_messages(conv_id, limit)
            .await?
            .into_iter()
            .map(|m| HistoryEntry::from_stored(m, include_metadata))
            .collect())
    }

    pub async fn get_metadata(&self, conv_id: &str) -> Result<Option<ConversationMetadata>> {
        self.store.get_metadata(conv_id).await
    }

    pub async fn truncate_history(&self, conv_id: &str, keep_last_n: usize) -> Result<bool> {
        self.store.truncate_history(conv_id, keep_last_n).await
    }

    pub async fn delete_conversation(&self, conv_id: &str) -> Result<bool> {
        self.store.delete_conversation(conv_id).await
    }

    pub async fn list_conversations(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>> {
        self.store.list_conversations(user_id, limit).await
    }

    /// Health check; errors read as unhealthy.
    pub async fn health_check(&self) -> bool {
        match self.store.health().await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!("conversation store health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_config_default() {
        let config = ConversationConfig::default();
        assert_eq!(config.backend, "memory");
        assert_eq!(config.ttl_seconds, 86_400);
        assert!(config.max_messages.is_none());
    }

    #[tokio::test]
    async fn test_manager_memory_backend() {
        let manager =
            ConversationManager::new(ConversationConfig::default(), ManualClock::shared(5.0), None)
                .await
                .unwrap();
        assert_eq!(manager.backend_name(), "memory");

        manager
            .append_message("conv_123", MessageRole::User, "hello", Some(2), None)
            .await
            .unwrap();
        manager
            .append_message(
                "conv_123",
                MessageRole::Assistant,
                "hi there",
                Some(3),
                Some(MessageMeta {
                    model: Some("flash".into()),
                    key_id: Some("k1".into()),
                }),
            )
            .await
            .unwrap();

        let history = manager.get_history("conv_123", None, false).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.metadata.is_none() && h.timestamp.is_none()));

        let detailed = manager.get_history("conv_123", Some(1), true).await.unwrap();
        assert_eq!(detailed[0].timestamp, Some(5.0));

        let meta = manager.get_metadata("conv_123").await.unwrap().unwrap();
        assert_eq!(meta.last_model.as_deref(), Some("flash"));
        assert_eq!(meta.total_tokens, 5);
        assert!(manager.health_check().await);
    }

    #[tokio::test]
    async fn test_manager_redis_requires_pool() {
        let config = ConversationConfig {
            backend: "redis".to_string(),
            ..Default::default()
        };
        let result = ConversationManager::new(config, ManualClock::shared(0.0), None).await;
        assert!(matches!(result, Err(ConversationError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_manager_unknown_backend() {
        let config = ConversationConfig {
            backend: "sled".to_string(),
            ..Default::default()
        };
        let result = ConversationManager::new(config, ManualClock::shared(0.0), None).await;
        assert!(matches!(result, Err(ConversationError::InvalidInput(_))));
    }
}
