#![forbid(unsafe_code)]
#![doc = r#"
Keyrelay

Route LLM requests across a pool of upstream API keys without tripping their
per-key RPM/TPM limits.

Crate highlights
- Quotas: token buckets reserved atomically in a shared store (`quota`, with
  in-memory and Redis backends).
- Selection: per-model round-robin over healthy keys with fallback chains
  (`key_selector`).
- Routing: retry, cooldown, backoff and safety escalation around a pluggable
  provider client (`request_router`, `provider`).
- Conversations: persistent multi-turn history (`conversation_manager`).
- HTTP server (in `server`): admin, routing, conversation and ingress routes.

Modules
- `clock`: injectable time source.
- `quota`, `quota_memory`, `quota_redis`, `redis_pool`: shared bucket state.
- `key_registry`, `secrets`: key metadata and credential lookup.
- `ingress`: per-user and global admission limits.
- `config`, `util`: environment configuration, tracing and HTTP helpers.
"#]

pub mod clock;
pub mod config;
pub mod conversation;
pub mod conversation_manager;
pub mod conversation_memory;
pub mod conversation_redis;
pub mod ingress;
pub mod key_registry;
pub mod key_selector;
pub mod provider;
pub mod quota;
pub mod quota_memory;
pub mod quota_redis;
pub mod redis_pool;
pub mod request_router;
pub mod secrets;
pub mod server;
pub mod util;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::GatewayConfig;
pub use crate::conversation::{
    ConversationError, ConversationMetadata, ConversationStore, HistoryEntry, MessageRole,
    StoredMessage,
};
pub use crate::conversation_manager::{ConversationConfig, ConversationManager};
pub use crate::ingress::{IngressConfig, IngressRateLimiter, RateLimitExceeded};
pub use crate::key_registry::{ApiKeyConfig, KeyFile, KeyRegistry, KeySource, Provider, Workload};
pub use crate::key_selector::{KeySelection, KeySelector};
pub use crate::provider::{OpenAiCompatibleClient, Outcome, ProviderClient};
pub use crate::quota::{QuotaManager, QuotaPolicy, QuotaStore};
pub use crate::request_router::{
    ChatRequest, ErrorType, OneShotRequest, RequestRouter, RouterConfig, RouterError,
    RouterResult,
};
pub use crate::secrets::{EnvSecretStore, SecretStore, StaticSecretStore};
