//! Quota Store
//!
//! Token-bucket primitives backing per-key RPM/TPM limits, ingress buckets and
//! per-key cooldowns. All mutable state lives in the backing store; the
//! read-refill-decide-write step of a reservation is a single atomic operation
//! on every backend so concurrent callers (across processes) never over-commit.
//!
//! Failure policy lives in [`QuotaManager`]:
//! - availability checks (cooldown lookups) fail open,
//! - reservations fail closed unless `reservation_fail_open` is set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Quota store unavailable: {0}")]
    Unavailable(String),
    #[error("Quota script error: {0}")]
    Script(String),
    #[error("Invalid bucket: {0}")]
    InvalidBucket(String),
}

pub type Result<T> = std::result::Result<T, QuotaError>;

/// Capacity and refill rate of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl BucketSpec {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Bucket holding `limit` tokens that refills completely once a minute.
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit as f64, limit as f64 / 60.0)
    }

    /// Seconds an empty bucket needs to become full again.
    pub fn full_refill_secs(&self) -> f64 {
        if self.refill_per_sec <= 0.0 {
            return 0.0;
        }
        self.capacity / self.refill_per_sec
    }

    fn validate(&self) -> Result<()> {
        if !(self.capacity > 0.0) || !(self.refill_per_sec >= 0.0) {
            return Err(QuotaError::InvalidBucket(format!(
                "capacity={} refill_per_sec={}",
                self.capacity, self.refill_per_sec
            )));
        }
        Ok(())
    }
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaWindow {
    pub tokens: f64,
    pub last_refill: f64,
}

impl QuotaWindow {
    pub fn full(spec: &BucketSpec, now: f64) -> Self {
        Self {
            tokens: spec.capacity,
            last_refill: now,
        }
    }

    /// Level after refilling up to `now`. Elapsed time is never negative.
    pub fn refilled(&self, spec: &BucketSpec, now: f64) -> Self {
        let elapsed = (now - self.last_refill).max(0.0);
        let tokens = (self.tokens + elapsed * spec.refill_per_sec).min(spec.capacity);
        Self {
            tokens,
            last_refill: now.max(self.last_refill),
        }
    }
}

/// One bucket taking part in a reservation.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketReservation {
    pub key: String,
    pub spec: BucketSpec,
    pub cost: f64,
}

impl BucketReservation {
    pub fn new(key: impl Into<String>, spec: BucketSpec, cost: f64) -> Self {
        Self {
            key: key.into(),
            spec,
            cost,
        }
    }
}

/// Apply the all-or-nothing reservation to already-loaded windows.
///
/// Returns the windows to persist and whether the reservation was granted.
/// Shared by the in-memory backend; the Redis backend runs the same logic in Lua.
pub(crate) fn apply_reservation(
    buckets: &[BucketReservation],
    current: &[Option<QuotaWindow>],
    now: f64,
) -> (Vec<QuotaWindow>, bool) {
    let mut refreshed: Vec<QuotaWindow> = buckets
        .iter()
        .zip(current)
        .map(|(b, w)| {
            w.unwrap_or_else(|| QuotaWindow::full(&b.spec, now))
                .refilled(&b.spec, now)
        })
        .collect();

    let granted = buckets
        .iter()
        .zip(&refreshed)
        .all(|(b, w)| w.tokens >= b.cost);

    if granted {
        for (w, b) in refreshed.iter_mut().zip(buckets) {
            w.tokens -= b.cost;
        }
    }
    (refreshed, granted)
}

/// Backing store for buckets and cooldown markers.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Atomically reserve `cost` from every bucket, or from none of them.
    ///
    /// The refill is persisted for every bucket even when the reservation is denied.
    async fn reserve_all(&self, buckets: &[BucketReservation], now: f64) -> Result<bool>;

    /// Single-bucket reservation.
    async fn reserve(&self, key: &str, spec: BucketSpec, cost: f64, now: f64) -> Result<bool> {
        self.reserve_all(&[BucketReservation::new(key, spec, cost)], now)
            .await
    }

    /// Current level refilled to `now`, without persisting anything.
    async fn peek(&self, key: &str, spec: BucketSpec, now: f64) -> Result<QuotaWindow>;

    /// Forget a bucket; the next reservation sees it full.
    async fn reset(&self, key: &str) -> Result<()>;

    async fn set_cooldown(&self, key: &str, ttl: Duration, reason: &str) -> Result<()>;

    /// Remaining cooldown in whole seconds, `None` when not cooling down.
    async fn cooldown_ttl(&self, key: &str) -> Result<Option<u64>>;

    async fn is_in_cooldown(&self, key: &str) -> Result<bool> {
        Ok(self.cooldown_ttl(key).await?.is_some())
    }

    async fn health_check(&self) -> Result<bool>;

    fn backend_name(&self) -> &'static str;
}

/// Failure policy for an unreachable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuotaPolicy {
    /// Treat reservations that cannot be confirmed as granted.
    #[serde(default)]
    pub reservation_fail_open: bool,
}

/// Per-key quota view over a [`QuotaStore`].
pub struct QuotaManager {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    policy: QuotaPolicy,
}

/// Remaining capacity snapshot for one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyQuotaSnapshot {
    pub rpm_available: Option<f64>,
    pub tpm_available: Option<f64>,
    pub cooldown_remaining_secs: Option<u64>,
}

impl QuotaManager {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
        policy: QuotaPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            prefix: prefix.into(),
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    fn rpm_key(&self, key_id: &str) -> String {
        format!("{}:rpm:{}", self.prefix, key_id)
    }

    fn tpm_key(&self, key_id: &str) -> String {
        format!("{}:tpm:{}", self.prefix, key_id)
    }

    fn cooldown_key(&self, key_id: &str) -> String {
        format!("{}:cooldown:{}", self.prefix, key_id)
    }

    /// Reserve one request and `tokens` tokens for a key.
    pub async fn try_reserve_key(&self, key_id: &str, rpm: u32, tpm: u32, tokens: u64) -> bool {
        let buckets = [
            BucketReservation::new(self.rpm_key(key_id), BucketSpec::per_minute(rpm), 1.0),
            BucketReservation::new(
                self.tpm_key(key_id),
                BucketSpec::per_minute(tpm),
                tokens as f64,
            ),
        ];
        let now = self.clock.now();
        match self.store.reserve_all(&buckets, now).await {
            Ok(granted) => {
                if !granted {
                    debug!(key_id, tokens, "quota reservation denied");
                }
                granted
            }
            Err(e) => {
                warn!(
                    key_id,
                    fail_open = self.policy.reservation_fail_open,
                    "quota reservation could not be confirmed: {}",
                    e
                );
                self.policy.reservation_fail_open
            }
        }
    }

    /// Cooldown lookup; an unreachable store reads as "not cooling down".
    pub async fn in_cooldown(&self, key_id: &str) -> bool {
        match self.store.is_in_cooldown(&self.cooldown_key(key_id)).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key_id, "cooldown lookup failed, treating key as usable: {}", e);
                false
            }
        }
    }

    pub async fn set_cooldown(&self, key_id: &str, ttl: Duration, reason: &str) -> Result<()> {
        debug!(key_id, ttl_secs = ttl.as_secs(), reason, "key cooldown set");
        self.store
            .set_cooldown(&self.cooldown_key(key_id), ttl, reason)
            .await
    }

    pub async fn cooldown_ttl(&self, key_id: &str) -> Result<Option<u64>> {
        self.store.cooldown_ttl(&self.cooldown_key(key_id)).await
    }

    /// Best-effort status for introspection; store errors surface as `None`s.
    pub async fn snapshot(&self, key_id: &str, rpm: u32, tpm: u32) -> KeyQuotaSnapshot {
        let now = self.clock.now();
        let rpm_available = self
            .store
            .peek(&self.rpm_key(key_id), BucketSpec::per_minute(rpm), now)
            .await
            .ok()
            .map(|w| w.tokens);
        let tpm_available = self
            .store
            .peek(&self.tpm_key(key_id), BucketSpec::per_minute(tpm), now)
            .await
            .ok()
            .map(|w| w.tokens);
        let cooldown_remaining_secs = self.cooldown_ttl(key_id).await.ok().flatten();
        KeyQuotaSnapshot {
            rpm_available,
            tpm_available,
            cooldown_remaining_secs,
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.store.health_check().await {
            Ok(ok) => ok,
            Err(e) => {
                warn!("quota store health check failed: {}", e);
                false
            }
        }
    }
}

pub(crate) fn validate_buckets(buckets: &[BucketReservation]) -> Result<()> {
    for b in buckets {
        b.spec.validate()?;
        if b.cost < 0.0 {
            return Err(QuotaError::InvalidBucket(format!(
                "negative cost {} for {}",
                b.cost, b.key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quota_memory::MemoryQuotaStore;

    struct DownStore;

    #[async_trait]
    impl QuotaStore for DownStore {
        async fn reserve_all(&self, _: &[BucketReservation], _: f64) -> Result<bool> {
            Err(QuotaError::Unavailable("connection refused".into()))
        }
        async fn peek(&self, _: &str, _: BucketSpec, _: f64) -> Result<QuotaWindow> {
            Err(QuotaError::Unavailable("connection refused".into()))
        }
        async fn reset(&self, _: &str) -> Result<()> {
            Err(QuotaError::Unavailable("connection refused".into()))
        }
        async fn set_cooldown(&self, _: &str, _: Duration, _: &str) -> Result<()> {
            Err(QuotaError::Unavailable("connection refused".into()))
        }
        async fn cooldown_ttl(&self, _: &str) -> Result<Option<u64>> {
            Err(QuotaError::Unavailable("connection refused".into()))
        }
        async fn health_check(&self) -> Result<bool> {
            Err(QuotaError::Unavailable("connection refused".into()))
        }
        fn backend_name(&self) -> &'static str {
            "down"
        }
    }

    #[test]
    fn refill_is_capped_and_ignores_skew() {
        let spec = BucketSpec::per_minute(60);
        let w = QuotaWindow {
            tokens: 10.0,
            last_refill: 100.0,
        };
        assert_eq!(w.refilled(&spec, 110.0).tokens, 20.0);
        assert_eq!(w.refilled(&spec, 1_000.0).tokens, 60.0);
        assert_eq!(w.refilled(&spec, 50.0).tokens, 10.0);
    }

    #[test]
    fn apply_reservation_is_all_or_nothing() {
        let buckets = vec![
            BucketReservation::new("rpm", BucketSpec::per_minute(10), 1.0),
            BucketReservation::new("tpm", BucketSpec::per_minute(100), 150.0),
        ];
        let (windows, granted) = apply_reservation(&buckets, &[None, None], 0.0);
        assert!(!granted);
        assert_eq!(windows[0].tokens, 10.0);
        assert_eq!(windows[1].tokens, 100.0);
    }

    #[tokio::test]
    async fn reservation_fails_closed_by_default() {
        let mgr = QuotaManager::new(
            Arc::new(DownStore),
            ManualClock::shared(0.0),
            "kr",
            QuotaPolicy::default(),
        );
        assert!(!mgr.try_reserve_key("k1", 10, 1000, 5).await);
    }

    #[tokio::test]
    async fn reservation_can_fail_open() {
        let mgr = QuotaManager::new(
            Arc::new(DownStore),
            ManualClock::shared(0.0),
            "kr",
            QuotaPolicy {
                reservation_fail_open: true,
            },
        );
        assert!(mgr.try_reserve_key("k1", 10, 1000, 5).await);
    }

    #[tokio::test]
    async fn cooldown_lookup_fails_open() {
        let mgr = QuotaManager::new(
            Arc::new(DownStore),
            ManualClock::shared(0.0),
            "kr",
            QuotaPolicy::default(),
        );
        assert!(!mgr.in_cooldown("k1").await);
        assert!(!mgr.health_check().await);
    }

    #[tokio::test]
    async fn tpm_denial_does_not_consume_rpm() {
        let clock = ManualClock::shared(0.0);
        let store = Arc::new(MemoryQuotaStore::new(clock.clone()));
        let mgr = QuotaManager::new(store, clock, "kr", QuotaPolicy::default());

        assert!(!mgr.try_reserve_key("k1", 2, 100, 500).await);
        assert!(mgr.try_reserve_key("k1", 2, 100, 10).await);
        assert!(mgr.try_reserve_key("k1", 2, 100, 10).await);
        assert!(!mgr.try_reserve_key("k1", 2, 100, 10).await);

        let snap = mgr.snapshot("k1", 2, 100).await;
        assert_eq!(snap.rpm_available, Some(0.0));
        assert_eq!(snap.tpm_available, Some(80.0));
        assert_eq!(snap.cooldown_remaining_secs, None);
    }
}
