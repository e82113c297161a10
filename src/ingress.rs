//! Ingress rate limiting.
//!
//! Per-user and global token buckets in front of the router, stored in the
//! same [`QuotaStore`] as key quotas under their own namespace. The user
//! bucket is checked first, then the global one. An unreachable store lets
//! traffic through.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::quota::{BucketSpec, QuotaError, QuotaStore};

#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub enabled: bool,
    pub user_rpm: u32,
    pub user_burst: u32,
    pub global_rpm: u32,
    pub global_burst: u32,
    pub prefix: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_rpm: 60,
            user_burst: 10,
            global_rpm: 1_200,
            global_burst: 100,
            prefix: "keyrelay".to_string(),
        }
    }
}

impl IngressConfig {
    fn user_spec(&self) -> BucketSpec {
        BucketSpec::new(self.user_burst.max(1) as f64, self.user_rpm as f64 / 60.0)
    }

    fn global_spec(&self) -> BucketSpec {
        BucketSpec::new(self.global_burst.max(1) as f64, self.global_rpm as f64 / 60.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    User,
    Global,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{scope:?} rate limit exceeded, retry after {retry_after}s")]
pub struct RateLimitExceeded {
    pub scope: LimitScope,
    /// Whole seconds until enough tokens have refilled
    pub retry_after: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngressStatus {
    pub scope: LimitScope,
    pub available: f64,
    pub capacity: f64,
    pub refill_per_sec: f64,
}

pub struct IngressRateLimiter {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    config: IngressConfig,
}

impl IngressRateLimiter {
    pub fn new(store: Arc<dyn QuotaStore>, clock: Arc<dyn Clock>, config: IngressConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &IngressConfig {
        &self.config
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}:ingress:user:{}", self.config.prefix, user_id)
    }

    fn global_key(&self) -> String {
        format!("{}:ingress:global", self.config.prefix)
    }

    async fn take(
        &self,
        key: &str,
        spec: BucketSpec,
        cost: f64,
        scope: LimitScope,
    ) -> Result<(), RateLimitExceeded> {
        let now = self.clock.now();
        match self.store.reserve(key, spec, cost, now).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                let retry_after = match self.store.peek(key, spec, now).await {
                    Ok(w) if spec.refill_per_sec > 0.0 => {
                        ((cost - w.tokens).max(0.0) / spec.refill_per_sec).ceil() as u64
                    }
                    _ => spec.full_refill_secs().ceil() as u64,
                }
                .max(1);
                debug!(key, ?scope, retry_after, "ingress request rejected");
                Err(RateLimitExceeded { scope, retry_after })
            }
            Err(e) => {
                warn!(key, "ingress limiter store unavailable, allowing request: {}", e);
                Ok(())
            }
        }
    }

    /// Admit one request costing `tokens_required` for `user_id`.
    pub async fn check_rate_limit(
        &self,
        user_id: &str,
        tokens_required: u32,
    ) -> Result<(), RateLimitExceeded> {
        if !self.config.enabled {
            return Ok(());
        }
        let cost = tokens_required.max(1) as f64;
        self.take(&self.user_key(user_id), self.config.user_spec(), cost, LimitScope::User)
            .await?;
        self.take(&self.global_key(), self.config.global_spec(), cost, LimitScope::Global)
            .await
    }

    pub async fn get_user_status(&self, user_id: &str) -> Result<IngressStatus, QuotaError> {
        self.status(&self.user_key(user_id), self.config.user_spec(), LimitScope::User)
            .await
    }

    pub async fn get_global_status(&self) -> Result<IngressStatus, QuotaError> {
        self.status(&self.global_key(), self.config.global_spec(), LimitScope::Global)
            .await
    }

    async fn status(
        &self,
        key: &str,
        spec: BucketSpec,
        scope: LimitScope,
    ) -> Result<IngressStatus, QuotaError> {
        let window = self.store.peek(key, spec, self.clock.now()).await?;
        Ok(IngressStatus {
            scope,
            available: window.tokens,
            capacity: spec.capacity,
            refill_per_sec: spec.refill_per_sec,
        })
    }

    pub async fn reset_user_limit(&self, user_id: &str) -> Result<(), QuotaError> {
        self.store.reset(&self.user_key(user_id)).await
    }
}
