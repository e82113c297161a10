//! In-process quota backend.
//!
//! Single-instance deployments and tests. A reservation holds the map lock for
//! the whole read-refill-decide-write step, which gives the same atomicity the
//! Redis script provides across processes. Buckets back at full capacity and
//! lapsed cooldowns are swept periodically, standing in for Redis key expiry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::quota::{
    apply_reservation, validate_buckets, BucketReservation, BucketSpec, QuotaError, QuotaStore,
    QuotaWindow, Result,
};

/// Minimum clock seconds between sweeps.
const SWEEP_INTERVAL_SECS: f64 = 60.0;

#[derive(Default)]
struct State {
    buckets: HashMap<String, (QuotaWindow, BucketSpec)>,
    cooldowns: HashMap<String, (f64, String)>,
    last_sweep: f64,
}

impl State {
    /// A missing bucket reads as full and a missing cooldown as lapsed, so
    /// dropping those entries changes no answer.
    fn sweep(&mut self, now: f64) {
        if now - self.last_sweep < SWEEP_INTERVAL_SECS {
            return;
        }
        self.last_sweep = now;
        self.buckets
            .retain(|_, (window, spec)| window.refilled(spec, now).tokens < spec.capacity);
        self.cooldowns.retain(|_, (until, _)| *until > now);
    }
}

pub struct MemoryQuotaStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemoryQuotaStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| QuotaError::Unavailable("quota state poisoned".into()))
    }

    /// Reason recorded with an active cooldown.
    pub fn cooldown_reason(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let state = self.lock().ok()?;
        state
            .cooldowns
            .get(key)
            .filter(|(until, _)| *until > now)
            .map(|(_, reason)| reason.clone())
    }

    /// Buckets and cooldowns currently held in memory.
    pub fn tracked_entries(&self) -> (usize, usize) {
        self.lock()
            .map(|s| (s.buckets.len(), s.cooldowns.len()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn reserve_all(&self, buckets: &[BucketReservation], now: f64) -> Result<bool> {
        validate_buckets(buckets)?;
        let mut state = self.lock()?;
        state.sweep(now);
        let current: Vec<Option<QuotaWindow>> = buckets
            .iter()
            .map(|b| state.buckets.get(&b.key).map(|(w, _)| *w))
            .collect();
        let (windows, granted) = apply_reservation(buckets, &current, now);
        for (b, w) in buckets.iter().zip(windows) {
            state.buckets.insert(b.key.clone(), (w, b.spec));
        }
        Ok(granted)
    }

    async fn peek(&self, key: &str, spec: BucketSpec, now: f64) -> Result<QuotaWindow> {
        let state = self.lock()?;
        Ok(state
            .buckets
            .get(key)
            .map(|(w, _)| *w)
            .unwrap_or_else(|| QuotaWindow::full(&spec, now))
            .refilled(&spec, now))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.lock()?.buckets.remove(key);
        Ok(())
    }

    async fn set_cooldown(&self, key: &str, ttl: Duration, reason: &str) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        state.sweep(now);
        state
            .cooldowns
            .insert(key.to_string(), (now + ttl.as_secs_f64(), reason.to_string()));
        Ok(())
    }

    async fn cooldown_ttl(&self, key: &str) -> Result<Option<u64>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        match state.cooldowns.get(key) {
            Some((until, _)) if *until > now => Ok(Some((*until - now).ceil() as u64)),
            Some(_) => {
                state.cooldowns.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        self.lock().map(|_| true)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryQuotaStore) {
        let clock = ManualClock::shared(1_000.0);
        let store = MemoryQuotaStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn bucket_drains_then_refills() {
        let (clock, store) = store();
        let spec = BucketSpec::per_minute(3);
        for _ in 0..3 {
            assert!(store.reserve("b", spec, 1.0, clock.now()).await.unwrap());
        }
        assert!(!store.reserve("b", spec, 1.0, clock.now()).await.unwrap());

        clock.advance(Duration::from_secs(60));
        for _ in 0..3 {
            assert!(store.reserve("b", spec, 1.0, clock.now()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn denied_reservation_persists_refill() {
        let (clock, store) = store();
        let spec = BucketSpec::per_minute(60);
        assert!(store.reserve("b", spec, 60.0, clock.now()).await.unwrap());

        clock.advance(Duration::from_secs(10));
        assert!(!store.reserve("b", spec, 20.0, clock.now()).await.unwrap());
        let w = store.peek("b", spec, clock.now()).await.unwrap();
        assert_eq!(w.tokens, 10.0);
        assert_eq!(w.last_refill, clock.now());
    }

    #[tokio::test]
    async fn never_exceeds_capacity_after_idle() {
        let (clock, store) = store();
        let spec = BucketSpec::per_minute(5);
        clock.advance(Duration::from_secs(3_600));
        let w = store.peek("b", spec, clock.now()).await.unwrap();
        assert_eq!(w.tokens, 5.0);
    }

    #[tokio::test]
    async fn cooldown_expires_with_clock() {
        let (clock, store) = store();
        store
            .set_cooldown("c", Duration::from_secs(30), "rate_limited")
            .await
            .unwrap();
        assert!(store.is_in_cooldown("c").await.unwrap());
        assert_eq!(store.cooldown_ttl("c").await.unwrap(), Some(30));
        assert_eq!(store.cooldown_reason("c").as_deref(), Some("rate_limited"));

        clock.advance(Duration::from_secs(31));
        assert!(!store.is_in_cooldown("c").await.unwrap());
        assert_eq!(store.cooldown_reason("c"), None);
    }

    #[tokio::test]
    async fn concurrent_reservations_respect_capacity() {
        let (clock, store) = store();
        let store = Arc::new(store);
        let spec = BucketSpec::per_minute(10);
        let now = clock.now();
        let calls = (0..50).map(|_| {
            let store = store.clone();
            async move { store.reserve("hot", spec, 1.0, now).await.unwrap() }
        });
        let granted = futures::future::join_all(calls)
            .await
            .into_iter()
            .filter(|g| *g)
            .count();
        assert_eq!(granted, 10);
    }

    #[tokio::test]
    async fn idle_entries_are_swept() {
        let (clock, store) = store();
        let spec = BucketSpec::per_minute(6);
        for user in 0..100 {
            let key = format!("ingress:user:{user}");
            assert!(store.reserve(&key, spec, 1.0, clock.now()).await.unwrap());
        }
        store
            .set_cooldown("k1", Duration::from_secs(30), "transient")
            .await
            .unwrap();
        store
            .set_cooldown("k2", Duration::from_secs(600), "safety_blocked")
            .await
            .unwrap();
        assert_eq!(store.tracked_entries(), (100, 2));

        // idle buckets are full again and k1's cooldown has lapsed
        clock.advance(Duration::from_secs(61));
        assert!(store.reserve("busy", spec, 6.0, clock.now()).await.unwrap());
        assert_eq!(store.tracked_entries(), (1, 1));
        assert!(store.is_in_cooldown("k2").await.unwrap());

        // a bucket still refilling is kept
        let slow = BucketSpec::new(6.0, 0.01);
        assert!(store.reserve("slow", slow, 6.0, clock.now()).await.unwrap());
        clock.advance(Duration::from_secs(61));
        store
            .set_cooldown("k3", Duration::from_secs(5), "rate_limited")
            .await
            .unwrap();
        assert_eq!(store.tracked_entries(), (1, 2));
        assert!(!store.reserve("slow", slow, 1.0, clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn reset_refills_bucket() {
        let (clock, store) = store();
        let spec = BucketSpec::per_minute(2);
        assert!(store.reserve("b", spec, 2.0, clock.now()).await.unwrap());
        store.reset("b").await.unwrap();
        assert!(store.reserve("b", spec, 2.0, clock.now()).await.unwrap());
    }
}
