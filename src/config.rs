//! Gateway configuration assembled from `KEYRELAY_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::conversation_manager::ConversationConfig;
use crate::ingress::IngressConfig;
use crate::quota::QuotaPolicy;
use crate::redis_pool::DEFAULT_POOL_MAX;
use crate::request_router::RouterConfig;
use crate::util::{env_bind_addr, env_parse, env_string, env_truthy};

pub const DEFAULT_KEYS_PATH: &str = "keys.yaml";
pub const DEFAULT_QUOTA_PREFIX: &str = "keyrelay";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Shared store; `None` keeps quotas and conversations in process
    pub redis_url: Option<String>,
    pub redis_pool_max: u32,
    pub keys_path: PathBuf,
    pub quota_prefix: String,
    pub quota_policy: QuotaPolicy,
    pub router: RouterConfig,
    pub ingress: IngressConfig,
    pub conversations: ConversationConfig,
    pub bind_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_pool_max: DEFAULT_POOL_MAX,
            keys_path: PathBuf::from(DEFAULT_KEYS_PATH),
            quota_prefix: DEFAULT_QUOTA_PREFIX.to_string(),
            quota_policy: QuotaPolicy::default(),
            router: RouterConfig::default(),
            ingress: IngressConfig::default(),
            conversations: ConversationConfig::default(),
            bind_addr: "0.0.0.0:8088".to_string(),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(name, default.as_secs()))
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let quota_prefix = env_string("KEYRELAY_QUOTA_PREFIX").unwrap_or(d.quota_prefix);

        let router = RouterConfig {
            max_retries: env_parse("KEYRELAY_MAX_RETRIES", d.router.max_retries),
            base_backoff_ms: env_parse("KEYRELAY_BASE_BACKOFF_MS", d.router.base_backoff_ms),
            max_backoff_ms: env_parse("KEYRELAY_MAX_BACKOFF_MS", d.router.max_backoff_ms),
            dispatch_timeout: env_secs("KEYRELAY_DISPATCH_TIMEOUT_SECONDS", d.router.dispatch_timeout),
            rate_limit_cooldown: env_secs(
                "KEYRELAY_RATE_LIMIT_COOLDOWN_SECONDS",
                d.router.rate_limit_cooldown,
            ),
            transient_cooldown: env_secs(
                "KEYRELAY_TRANSIENT_COOLDOWN_SECONDS",
                d.router.transient_cooldown,
            ),
            safety_cooldown: env_secs("KEYRELAY_SAFETY_COOLDOWN_SECONDS", d.router.safety_cooldown),
            default_completion_tokens: env_parse(
                "KEYRELAY_DEFAULT_COMPLETION_TOKENS",
                d.router.default_completion_tokens,
            ),
            // 0 sends the whole stored history
            history_limit: env_string("KEYRELAY_CHAT_HISTORY_LIMIT")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .map(|n| (n > 0).then_some(n))
                .unwrap_or(d.router.history_limit),
        };

        let ingress = IngressConfig {
            enabled: env_truthy("KEYRELAY_INGRESS_ENABLED", d.ingress.enabled),
            user_rpm: env_parse("KEYRELAY_INGRESS_USER_RPM", d.ingress.user_rpm),
            user_burst: env_parse("KEYRELAY_INGRESS_USER_BURST", d.ingress.user_burst),
            global_rpm: env_parse("KEYRELAY_INGRESS_GLOBAL_RPM", d.ingress.global_rpm),
            global_burst: env_parse("KEYRELAY_INGRESS_GLOBAL_BURST", d.ingress.global_burst),
            prefix: quota_prefix.clone(),
        };

        Self {
            redis_url: env_string("KEYRELAY_REDIS_URL"),
            redis_pool_max: env_parse("KEYRELAY_REDIS_POOL_MAX", d.redis_pool_max),
            keys_path: env_string("KEYRELAY_KEYS_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.keys_path),
            quota_policy: QuotaPolicy {
                reservation_fail_open: env_truthy(
                    "KEYRELAY_RESERVATION_FAIL_OPEN",
                    d.quota_policy.reservation_fail_open,
                ),
            },
            router,
            ingress,
            conversations: ConversationConfig::from_env(),
            bind_addr: env_bind_addr(),
            quota_prefix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("KEYRELAY_MAX_RETRIES", "5");
        std::env::set_var("KEYRELAY_SAFETY_COOLDOWN_SECONDS", "10");
        std::env::set_var("KEYRELAY_INGRESS_USER_BURST", "3");
        std::env::set_var("KEYRELAY_RESERVATION_FAIL_OPEN", "true");
        std::env::set_var("KEYRELAY_CHAT_HISTORY_LIMIT", "40");

        let config = GatewayConfig::from_env();
        assert_eq!(config.router.max_retries, 5);
        assert_eq!(config.router.safety_cooldown, Duration::from_secs(10));
        assert_eq!(config.router.base_backoff_ms, 500);
        assert_eq!(config.ingress.user_burst, 3);
        assert!(config.quota_policy.reservation_fail_open);
        assert_eq!(config.router.history_limit, Some(40));

        std::env::set_var("KEYRELAY_CHAT_HISTORY_LIMIT", "0");
        assert_eq!(GatewayConfig::from_env().router.history_limit, None);

        for var in [
            "KEYRELAY_MAX_RETRIES",
            "KEYRELAY_SAFETY_COOLDOWN_SECONDS",
            "KEYRELAY_INGRESS_USER_BURST",
            "KEYRELAY_RESERVATION_FAIL_OPEN",
            "KEYRELAY_CHAT_HISTORY_LIMIT",
        ] {
            std::env::remove_var(var);
        }
    }
}
