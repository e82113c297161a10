//! In-memory conversation storage backend
//!
//! Fast, simple storage for single-instance deployments and testing.
//! Data is lost when the process exits. TTLs are evaluated against the
//! injected [`Clock`] and expired conversations are dropped lazily.

use crate::clock::Clock;
use crate::conversation::{
    validate_conv_id, ConversationError, ConversationInit, ConversationMetadata, ConversationStore,
    ConversationSummary, Result, StoredMessage,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;

struct Entry {
    messages: VecDeque<StoredMessage>,
    meta: ConversationMetadata,
    expires_at: f64,
}

/// In-memory storage backend
#[derive(Clone)]
pub struct MemoryConversationStore {
    conversations: Arc<RwLock<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    max_messages: Option<usize>,
}

impl MemoryConversationStore {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
            clock,
            ttl,
            max_messages: None,
        }
    }

    pub fn with_max_messages(mut self, max_messages: Option<usize>) -> Self {
        self.max_messages = max_messages.filter(|m| *m > 0);
        self
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Entry>>> {
        let mut guard = self
            .conversations
            .write()
            .map_err(|e| ConversationError::Storage(format!("Lock error: {}", e)))?;
        let now = self.clock.now();
        guard.retain(|_, e| e.expires_at > now);
        Ok(guard)
    }

    fn expiry(&self, now: f64) -> f64 {
        now + self.ttl.as_secs_f64()
    }
}

#[async_trait::async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_conversation(&self, conv_id: &str, init: &ConversationInit) -> Result<bool> {
        validate_conv_id(conv_id)?;
        let now = self.clock.now();
        let mut conversations = self.write()?;
        if conversations.contains_key(conv_id) {
            return Ok(false);
        }
        conversations.insert(
            conv_id.to_string(),
            Entry {
                messages: VecDeque::new(),
                meta: ConversationMetadata::new(now, init),
                expires_at: self.expiry(now),
            },
        );
        Ok(true)
    }

    async fn append_messages(&self, conv_id: &str, messages: &[StoredMessage]) -> Result<()> {
        validate_conv_id(conv_id)?;
        let now = self.clock.now();
        let expires_at = self.expiry(now);
        let mut conversations = self.write()?;
        let entry = conversations
            .entry(conv_id.to_string())
            .or_insert_with(|| Entry {
                messages: VecDeque::new(),
                meta: ConversationMetadata::new(now, &ConversationInit::default()),
                expires_at,
            });

        entry.messages.extend(messages.iter().cloned());
        if let Some(max) = self.max_messages {
            while entry.messages.len() > max {
                entry.messages.pop_front();
            }
        }
        entry.meta.record_append(messages, now);
        entry.meta.message_count = entry.messages.len() as u64;
        entry.expires_at = expires_at;
        Ok(())
    }

    async fn load_messages(
        &self,
        conv_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let conversations = self.write()?;
        let Some(entry) = conversations.get(conv_id) else {
            return Ok(Vec::new());
        };
        let skip = limit
            .map(|l| entry.messages.len().saturating_sub(l))
            .unwrap_or(0);
        Ok(entry.messages.iter().skip(skip).cloned().collect())
    }

    async fn get_metadata(&self, conv_id: &str) -> Result<Option<ConversationMetadata>> {
        let conversations = self.write()?;
        Ok(conversations.get(conv_id).map(|e| e.meta.clone()))
    }

    async fn truncate_history(&self, conv_id: &str, keep_last_n: usize) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = self.expiry(now);
        let mut conversations = self.write()?;
        let Some(entry) = conversations.get_mut(conv_id) else {
            return Ok(false);
        };
        while entry.messages.len() > keep_last_n {
            entry.messages.pop_front();
        }
        entry.meta.message_count = entry.messages.len() as u64;
        entry.meta.updated_at = now;
        entry.expires_at = expires_at;
        Ok(true)
    }

    async fn delete_conversation(&self, conv_id: &str) -> Result<bool> {
        Ok(self.write()?.remove(conv_id).is_some())
    }

    async fn list_conversations(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>> {
        let conversations = self.write()?;
        let mut results: Vec<ConversationSummary> = conversations
            .iter()
            .filter(|(_, e)| user_id.is_none() || e.meta.user_id.as_deref() == user_id)
            .map(|(id, e)| ConversationSummary {
                conv_id: id.clone(),
                metadata: e.meta.clone(),
            })
            .collect();

        // Sort by updated_at descending
        results.sort_by(|a, b| b.metadata.updated_at.total_cmp(&a.metadata.updated_at));
        results.truncate(limit);
        Ok(results)
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.conversations.read().is_ok())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
