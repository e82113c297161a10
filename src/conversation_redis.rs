//! Redis conversation storage backend
//!
//! Layout under the configured prefix:
//! - `{prefix}:conv:{id}:messages`: list of JSON-encoded messages, oldest first
//! - `{prefix}:conv:{id}:meta`: hash with the conversation metadata
//! - `{prefix}:conversations`: sorted set of conversation ids scored by `updated_at`
//! - `{prefix}:user:{user}:conversations`: per-user sorted set, same scoring
//!
//! Appends and truncations run as Lua scripts so the list, the metadata and
//! both indexes never disagree. The scripts derive the per-user index key from
//! the stored `user_id`, so they assume a single Redis node. Listing walks the
//! index newest first in pages and prunes entries whose conversation expired.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::conversation::{
    validate_conv_id, ConversationError, ConversationInit, ConversationMetadata, ConversationStore,
    ConversationSummary, Result, StoredMessage,
};
use crate::redis_pool::{PoolError, RedisPool};
use std::sync::Arc;

const CREATE_SCRIPT: &str = r#"
if redis.call("HSETNX", KEYS[1], "created_at", ARGV[1]) == 0 then
  return 0
end
redis.call("HSET", KEYS[1], "updated_at", ARGV[1], "message_count", 0, "total_tokens", 0, "extra", ARGV[3])
if ARGV[4] ~= "" then
  redis.call("HSET", KEYS[1], "user_id", ARGV[4])
  redis.call("ZADD", KEYS[3], ARGV[1], ARGV[5])
end
redis.call("EXPIRE", KEYS[1], ARGV[2])
redis.call("ZADD", KEYS[2], ARGV[1], ARGV[5])
return 1
"#;

const APPEND_SCRIPT: &str = r#"
local now = ARGV[1]
local ttl = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local added = tonumber(ARGV[4])
local model = ARGV[5]
local conv_id = ARGV[6]
local prefix = ARGV[7]

for i = 8, #ARGV do
  redis.call("RPUSH", KEYS[1], ARGV[i])
end
if max > 0 then
  redis.call("LTRIM", KEYS[1], -max, -1)
end
local count = redis.call("LLEN", KEYS[1])

redis.call("HSETNX", KEYS[2], "created_at", now)
redis.call("HSET", KEYS[2], "updated_at", now, "message_count", count)
redis.call("HINCRBY", KEYS[2], "total_tokens", added)
if model ~= "" then
  redis.call("HSET", KEYS[2], "last_model", model)
end
if count > 0 then
  redis.call("EXPIRE", KEYS[1], ttl)
end
redis.call("EXPIRE", KEYS[2], ttl)
redis.call("ZADD", KEYS[3], now, conv_id)
local user = redis.call("HGET", KEYS[2], "user_id")
if user then
  redis.call("ZADD", prefix .. ":user:" .. user .. ":conversations", now, conv_id)
end
return count
"#;

const TRUNCATE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[2]) == 0 then
  return -1
end
local keep = tonumber(ARGV[3])
if keep == 0 then
  redis.call("DEL", KEYS[1])
else
  redis.call("LTRIM", KEYS[1], -keep, -1)
end
local count = redis.call("LLEN", KEYS[1])
redis.call("HSET", KEYS[2], "updated_at", ARGV[1], "message_count", count)
if count > 0 then
  redis.call("EXPIRE", KEYS[1], ARGV[2])
end
redis.call("EXPIRE", KEYS[2], ARGV[2])
redis.call("ZADD", KEYS[3], ARGV[1], ARGV[4])
local user = redis.call("HGET", KEYS[2], "user_id")
if user then
  redis.call("ZADD", ARGV[5] .. ":user:" .. user .. ":conversations", ARGV[1], ARGV[4])
end
return count
"#;

/// Smallest index page fetched per round trip when listing.
const LIST_PAGE_MIN: usize = 32;

pub struct RedisConversationStore {
    pool: RedisPool,
    clock: Arc<dyn Clock>,
    prefix: String,
    ttl: Duration,
    max_messages: Option<usize>,
    create_script: redis::Script,
    append_script: redis::Script,
    truncate_script: redis::Script,
}

fn meta_key(prefix: &str, conv_id: &str) -> String {
    format!("{}:conv:{}:meta", prefix, conv_id)
}

fn storage_err(e: PoolError) -> ConversationError {
    ConversationError::Storage(e.to_string())
}

fn parse_metadata(raw: HashMap<String, String>) -> Result<Option<ConversationMetadata>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let num = |field: &str| raw.get(field).and_then(|v| v.parse::<f64>().ok());
    let extra = match raw.get("extra") {
        Some(s) if !s.is_empty() => serde_json::from_str(s)?,
        _ => HashMap::new(),
    };
    Ok(Some(ConversationMetadata {
        created_at: num("created_at").unwrap_or(0.0),
        updated_at: num("updated_at").unwrap_or(0.0),
        message_count: num("message_count").unwrap_or(0.0) as u64,
        total_tokens: num("total_tokens").unwrap_or(0.0) as u64,
        last_model: raw.get("last_model").cloned(),
        user_id: raw.get("user_id").cloned(),
        extra,
    }))
}

impl RedisConversationStore {
    pub fn new(pool: RedisPool, clock: Arc<dyn Clock>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            pool,
            clock,
            prefix: prefix.into(),
            ttl,
            max_messages: None,
            create_script: redis::Script::new(CREATE_SCRIPT),
            append_script: redis::Script::new(APPEND_SCRIPT),
            truncate_script: redis::Script::new(TRUNCATE_SCRIPT),
        }
    }

    pub fn with_max_messages(mut self, max_messages: Option<usize>) -> Self {
        self.max_messages = max_messages.filter(|m| *m > 0);
        self
    }

    fn messages_key(&self, conv_id: &str) -> String {
        format!("{}:conv:{}:messages", self.prefix, conv_id)
    }

    fn meta_key(&self, conv_id: &str) -> String {
        meta_key(&self.prefix, conv_id)
    }

    fn index_key(&self) -> String {
        format!("{}:conversations", self.prefix)
    }

    fn user_index_key(&self, user_id: &str) -> String {
        format!("{}:user:{}:conversations", self.prefix, user_id)
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    /// One page of the index, newest first, with each entry's raw metadata
    /// hash fetched in a single pipeline.
    async fn fetch_index_page(
        &self,
        index: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, HashMap<String, String>)>> {
        let index = index.to_string();
        let prefix = self.prefix.clone();
        let start = offset as i64;
        let stop = (offset + count) as i64 - 1;
        self.pool
            .run(move |conn| {
                let ids: Vec<String> = redis::cmd("ZREVRANGE")
                    .arg(&index)
                    .arg(start)
                    .arg(stop)
                    .query(conn)?;
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let mut pipe = redis::pipe();
                for id in &ids {
                    pipe.cmd("HGETALL").arg(meta_key(&prefix, id));
                }
                let metas: Vec<HashMap<String, String>> = pipe.query(conn)?;
                Ok(ids.into_iter().zip(metas).collect())
            })
            .await
            .map_err(storage_err)
    }

    async fn fetch_meta(&self, conv_id: &str) -> Result<Option<ConversationMetadata>> {
        let key = self.meta_key(conv_id);
        let raw: HashMap<String, String> = self
            .pool
            .run(move |conn| redis::cmd("HGETALL").arg(&key).query(conn))
            .await
            .map_err(storage_err)?;
        parse_metadata(raw)
    }
}

#[async_trait::async_trait]
impl ConversationStore for RedisConversationStore {
    async fn create_conversation(&self, conv_id: &str, init: &ConversationInit) -> Result<bool> {
        validate_conv_id(conv_id)?;
        let now = self.clock.now();
        let extra = serde_json::to_string(&init.extra)?;
        let user = init.user_id.clone().unwrap_or_default();
        let keys = [
            self.meta_key(conv_id),
            self.index_key(),
            self.user_index_key(&user),
        ];
        let ttl = self.ttl_secs();
        let conv_id = conv_id.to_string();
        let script = self.create_script.clone();
        let created: i64 = self
            .pool
            .run(move |conn| {
                script
                    .key(&keys[0])
                    .key(&keys[1])
                    .key(&keys[2])
                    .arg(now)
                    .arg(ttl)
                    .arg(extra)
                    .arg(user)
                    .arg(conv_id)
                    .invoke(conn)
            })
            .await
            .map_err(storage_err)?;
        Ok(created == 1)
    }

    async fn append_messages(&self, conv_id: &str, messages: &[StoredMessage]) -> Result<()> {
        validate_conv_id(conv_id)?;
        let encoded = messages
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let tokens: u64 = messages.iter().filter_map(|m| m.tokens).sum();
        let last_model = messages
            .iter()
            .rev()
            .find_map(|m| m.model())
            .unwrap_or_default()
            .to_string();
        let keys = [self.messages_key(conv_id), self.meta_key(conv_id), self.index_key()];
        let now = self.clock.now();
        let ttl = self.ttl_secs();
        let max = self.max_messages.unwrap_or(0) as u64;
        let conv_id = conv_id.to_string();
        let prefix = self.prefix.clone();
        let script = self.append_script.clone();

        let count: i64 = self
            .pool
            .run(move |conn| {
                let mut invocation = script.prepare_invoke();
                for k in &keys {
                    invocation.key(k);
                }
                invocation
                    .arg(now)
                    .arg(ttl)
                    .arg(max)
                    .arg(tokens)
                    .arg(last_model)
                    .arg(conv_id)
                    .arg(prefix);
                for m in &encoded {
                    invocation.arg(m);
                }
                invocation.invoke(conn)
            })
            .await
            .map_err(storage_err)?;
        debug!(count, "conversation append");
        Ok(())
    }

    async fn load_messages(
        &self,
        conv_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>> {
        let key = self.messages_key(conv_id);
        let start: i64 = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(n) => -(n as i64),
            None => 0,
        };
        let raw: Vec<String> = self
            .pool
            .run(move |conn| redis::cmd("LRANGE").arg(&key).arg(start).arg(-1).query(conn))
            .await
            .map_err(storage_err)?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(ConversationError::from))
            .collect()
    }

    async fn get_metadata(&self, conv_id: &str) -> Result<Option<ConversationMetadata>> {
        self.fetch_meta(conv_id).await
    }

    async fn truncate_history(&self, conv_id: &str, keep_last_n: usize) -> Result<bool> {
        let keys = [self.messages_key(conv_id), self.meta_key(conv_id), self.index_key()];
        let now = self.clock.now();
        let ttl = self.ttl_secs();
        let conv_id = conv_id.to_string();
        let prefix = self.prefix.clone();
        let script = self.truncate_script.clone();
        let count: i64 = self
            .pool
            .run(move |conn| {
                script
                    .key(&keys[0])
                    .key(&keys[1])
                    .key(&keys[2])
                    .arg(now)
                    .arg(ttl)
                    .arg(keep_last_n as u64)
                    .arg(conv_id)
                    .arg(prefix)
                    .invoke(conn)
            })
            .await
            .map_err(storage_err)?;
        Ok(count >= 0)
    }

    async fn delete_conversation(&self, conv_id: &str) -> Result<bool> {
        let user_index = self
            .fetch_meta(conv_id)
            .await?
            .and_then(|m| m.user_id)
            .map(|u| self.user_index_key(&u));
        let messages_key = self.messages_key(conv_id);
        let meta_key = self.meta_key(conv_id);
        let index_key = self.index_key();
        let conv_id = conv_id.to_string();
        let (deleted,): (i64,) = self
            .pool
            .run(move |conn| {
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .cmd("DEL")
                    .arg(&messages_key)
                    .arg(&meta_key)
                    .cmd("ZREM")
                    .arg(&index_key)
                    .arg(&conv_id)
                    .ignore();
                if let Some(user_index) = &user_index {
                    pipe.cmd("ZREM").arg(user_index).arg(&conv_id).ignore();
                }
                pipe.query(conn)
            })
            .await
            .map_err(storage_err)?;
        Ok(deleted > 0)
    }

    async fn list_conversations(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let index = match user_id {
            Some(u) => self.user_index_key(u),
            None => self.index_key(),
        };
        let page = limit.max(LIST_PAGE_MIN);
        let mut results = Vec::with_capacity(limit);
        let mut offset = 0;

        loop {
            let entries = self.fetch_index_page(&index, offset, page).await?;
            let fetched = entries.len();
            let mut stale = Vec::new();
            for (conv_id, raw) in entries {
                match parse_metadata(raw)? {
                    Some(metadata) => results.push(ConversationSummary { conv_id, metadata }),
                    None => stale.push(conv_id),
                }
            }
            let pruned = stale.len();
            if pruned > 0 {
                debug!(count = pruned, "pruning expired conversation index entries");
                let index = index.clone();
                self.pool
                    .run(move |conn| {
                        redis::cmd("ZREM")
                            .arg(&index)
                            .arg(&stale)
                            .query::<i64>(conn)
                    })
                    .await
                    .map_err(storage_err)?;
            }
            if results.len() >= limit || fetched < page {
                break;
            }
            // pruned entries no longer occupy ranks
            offset += fetched - pruned;
        }

        results.truncate(limit);
        Ok(results)
    }

    async fn health(&self) -> Result<bool> {
        self.pool.ping().await.map_err(storage_err)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::conversation::MessageRole;

    fn live_store() -> Option<RedisConversationStore> {
        let url = std::env::var("KEYRELAY_TEST_REDIS_URL").ok()?;
        let pool = RedisPool::connect(&url, 4).ok()?;
        let prefix = format!("keyrelay-test:{}", uuid::Uuid::new_v4());
        Some(
            RedisConversationStore::new(pool, Arc::new(SystemClock), prefix, Duration::from_secs(60))
                .with_max_messages(Some(3)),
        )
    }

    #[test]
    fn test_parse_metadata() {
        let raw = HashMap::from([
            ("created_at".to_string(), "10.5".to_string()),
            ("updated_at".to_string(), "12".to_string()),
            ("message_count".to_string(), "2".to_string()),
            ("total_tokens".to_string(), "40".to_string()),
            ("last_model".to_string(), "flash".to_string()),
            ("extra".to_string(), r#"{"topic":"rates"}"#.to_string()),
        ]);
        let meta = parse_metadata(raw).unwrap().unwrap();
        assert_eq!(meta.created_at, 10.5);
        assert_eq!(meta.message_count, 2);
        assert_eq!(meta.total_tokens, 40);
        assert_eq!(meta.last_model.as_deref(), Some("flash"));
        assert_eq!(meta.extra.get("topic"), Some(&serde_json::json!("rates")));
        assert!(parse_metadata(HashMap::new()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_append_truncate_delete() {
        let Some(store) = live_store() else {
            return;
        };
        let init = ConversationInit {
            user_id: Some("u1".into()),
            ..Default::default()
        };
        assert!(store.create_conversation("c1", &init).await.unwrap());
        assert!(!store.create_conversation("c1", &init).await.unwrap());

        let turn: Vec<_> = (0..4)
            .map(|i| {
                StoredMessage::new(MessageRole::User, format!("m{i}"), 1.0)
                    .with_tokens(Some(1))
                    .with_meta(Some("flash".into()), None)
            })
            .collect();
        store.append_messages("c1", &turn).await.unwrap();

        let meta = store.get_metadata("c1").await.unwrap().unwrap();
        assert_eq!(meta.message_count, 3);
        assert_eq!(meta.total_tokens, 4);
        assert_eq!(meta.user_id.as_deref(), Some("u1"));
        assert_eq!(meta.last_model.as_deref(), Some("flash"));

        assert!(store.truncate_history("c1", 1).await.unwrap());
        let left = store.load_messages("c1", None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content, "m3");

        let listed = store.list_conversations(Some("u1"), 10).await.unwrap();
        assert_eq!(listed.len(), 1);

        assert!(store.delete_conversation("c1").await.unwrap());
        assert!(store.get_metadata("c1").await.unwrap().is_none());
        assert!(store.list_conversations(None, 10).await.unwrap().is_empty());
    }
}
