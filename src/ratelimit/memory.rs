//! In-process bucket backend.
//!
//! Buckets live in a sharded map and expire lazily: a consume that lands
//! after `reset_at` replaces the bucket wholesale. State is lost on restart
//! and is not shared between processes.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{now_ms, BucketBackend, BucketStatus, ConsumeResult};
use super::policy::Policy;
use crate::error::Result;

/// Per-key bucket state. All times are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Remaining permits in the current window
    pub tokens: u32,
    /// Start of the next window
    pub reset_at: u64,
    /// Consumption is denied while `now < blocked_until`; 0 when inactive
    pub blocked_until: u64,
}

impl Bucket {
    /// A full bucket for a window starting at `now`.
    fn fresh(policy: &Policy, now: u64) -> Self {
        Self {
            tokens: policy.points,
            reset_at: now + policy.duration_ms(),
            blocked_until: 0,
        }
    }

    fn is_blocked(&self, now: u64) -> bool {
        self.blocked_until > now
    }

    /// Whether `consume` would throw this bucket away.
    fn is_stale(&self, now: u64) -> bool {
        now >= self.reset_at && !self.is_blocked(now)
    }
}

/// Map-backed bucket backend.
pub struct MemoryBackend {
    buckets: DashMap<String, Bucket>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Take one permit at an explicit point in time.
    ///
    /// The shard lock is held for the whole read-modify-write and nothing in
    /// here awaits, so concurrent callers on the same key are serialized.
    pub fn consume_at(&self, key: &str, policy: &Policy, now: u64) -> ConsumeResult {
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key = %key, points = policy.points, "Creating new bucket");
                Bucket::fresh(policy, now)
            });
        let bucket = entry.value_mut();

        // A running block holds the expired window in place; the next window
        // opens on the first consume after the block lifts.
        if bucket.is_stale(now) {
            *bucket = Bucket::fresh(policy, now);
        }

        let reset_ms = bucket.reset_at.saturating_sub(now);

        if bucket.is_blocked(now) {
            trace!(key = %key, "Bucket is blocked");
            return ConsumeResult::denied(reset_ms, bucket.blocked_until - now);
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            return ConsumeResult::allowed(bucket.tokens, reset_ms);
        }

        if policy.block_ms > 0 {
            bucket.blocked_until = now + policy.block_ms;
            debug!(key = %key, block_ms = policy.block_ms, "Bucket exhausted, blocking");
            return ConsumeResult::denied(reset_ms, policy.block_ms);
        }

        debug!(key = %key, "Bucket exhausted");
        ConsumeResult::denied(reset_ms, reset_ms)
    }

    /// Inspect a bucket at an explicit point in time.
    pub fn status_at(&self, key: &str, now: u64) -> Option<BucketStatus> {
        let bucket = *self.buckets.get(key)?;
        if bucket.is_stale(now) {
            return None;
        }
        let remaining = if now >= bucket.reset_at {
            0
        } else {
            bucket.tokens
        };
        Some(BucketStatus {
            remaining,
            reset_ms: bucket.reset_at.saturating_sub(now),
            blocked_ms: bucket.blocked_until.saturating_sub(now),
        })
    }

    /// Remove up to `budget` stale buckets. Returns how many were removed.
    ///
    /// Only buckets that the next consume would replace anyway are removed.
    pub fn sweep(&self, now: u64, budget: usize) -> usize {
        let stale: Vec<String> = self
            .buckets
            .iter()
            .filter(|entry| entry.value().is_stale(now))
            .map(|entry| entry.key().clone())
            .take(budget)
            .collect();

        stale
            .into_iter()
            .filter(|key| {
                self.buckets
                    .remove_if(key, |_, bucket| bucket.is_stale(now))
                    .is_some()
            })
            .count()
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, budget: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep(now_ms(), budget);
                if removed > 0 {
                    debug!(removed, remaining = self.len(), "Swept stale buckets");
                }
            }
        })
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn consume(&self, key: &str, policy: &Policy) -> Result<ConsumeResult> {
        Ok(self.consume_at(key, policy, now_ms()))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.buckets.remove(key);
        Ok(())
    }

    async fn status(&self, key: &str) -> Result<Option<BucketStatus>> {
        Ok(self.status_at(key, now_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn test_remaining_counts_down_then_denies() {
        let backend = MemoryBackend::new();
        let policy = Policy::new(5, 10, 0);

        for expected in (0..5).rev() {
            let result = backend.consume_at("u:1", &policy, T0);
            assert!(result.allowed);
            assert_eq!(result.remaining, expected);
            assert_eq!(result.retry_after_ms, 0);
        }

        let result = backend.consume_at("u:1", &policy, T0 + 10);
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert!(result.retry_after_ms <= 10_000);
        assert_eq!(result.retry_after_ms, 9_990);
    }

    #[test]
    fn test_window_rollover_resets_fully() {
        let backend = MemoryBackend::new();
        let policy = Policy::new(3, 1, 0);

        for _ in 0..4 {
            backend.consume_at("k", &policy, T0);
        }

        let result = backend.consume_at("k", &policy, T0 + 1_000);
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
        assert_eq!(result.reset_ms, 1_000);
    }

    #[test]
    fn test_block_applied_on_exhaustion() {
        let backend = MemoryBackend::new();
        let policy = Policy::new(1, 10, 3_000);

        assert!(backend.consume_at("k", &policy, T0).allowed);

        let denied = backend.consume_at("k", &policy, T0 + 100);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 3_000);

        let still_blocked = backend.consume_at("k", &policy, T0 + 1_100);
        assert!(!still_blocked.allowed);
        assert_eq!(still_blocked.retry_after_ms, 2_000);
    }

    #[test]
    fn test_block_survives_window_rollover() {
        let backend = MemoryBackend::new();
        let policy = Policy::new(1, 1, 5_000);

        assert!(backend.consume_at("k", &policy, T0).allowed);
        assert!(!backend.consume_at("k", &policy, T0 + 500).allowed);

        // Window ended at T0 + 1000 but the block runs until T0 + 5500.
        let result = backend.consume_at("k", &policy, T0 + 2_000);
        assert!(!result.allowed);
        assert_eq!(result.retry_after_ms, 3_500);
        assert_eq!(result.reset_ms, 0);
        assert_eq!(backend.status_at("k", T0 + 2_000).unwrap().reset_ms, 0);

        let result = backend.consume_at("k", &policy, T0 + 5_500);
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.reset_ms, 1_000);
    }

    #[test]
    fn test_window_after_block_starts_when_block_lifts() {
        let backend = MemoryBackend::new();
        let policy = Policy::new(2, 10, 3_000);

        backend.consume_at("k", &policy, T0);
        backend.consume_at("k", &policy, T0);
        assert!(!backend.consume_at("k", &policy, T0 + 9_000).allowed);

        // Requests during the block must not open a new window.
        assert!(!backend.consume_at("k", &policy, T0 + 11_000).allowed);

        let result = backend.consume_at("k", &policy, T0 + 12_000);
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
        assert_eq!(result.reset_ms, 10_000);
    }

    #[tokio::test]
    async fn test_reset_behaves_like_new_key() {
        let backend = MemoryBackend::new();
        let policy = Policy::new(2, 60, 1_000);

        for _ in 0..3 {
            backend.consume("k", &policy).await.unwrap();
        }
        backend.reset("k").await.unwrap();

        let result = backend.consume("k", &policy).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 1);
    }

    #[test]
    fn test_status_does_not_mutate() {
        let backend = MemoryBackend::new();
        let policy = Policy::new(5, 10, 0);

        assert!(backend.status_at("k", T0).is_none());

        backend.consume_at("k", &policy, T0);
        let status = backend.status_at("k", T0 + 1_000).unwrap();
        assert_eq!(status.remaining, 4);
        assert_eq!(status.reset_ms, 9_000);
        assert_eq!(status.blocked_ms, 0);

        let again = backend.status_at("k", T0 + 1_000).unwrap();
        assert_eq!(status, again);
        assert!(backend.status_at("k", T0 + 10_000).is_none());
    }

    #[test]
    fn test_sweep_removes_only_stale_buckets() {
        let backend = MemoryBackend::new();
        let short = Policy::new(1, 1, 0);
        let long = Policy::new(1, 60, 0);
        let blocking = Policy::new(1, 1, 10_000);

        backend.consume_at("short", &short, T0);
        backend.consume_at("long", &long, T0);
        backend.consume_at("blocked", &blocking, T0);
        backend.consume_at("blocked", &blocking, T0);

        let removed = backend.sweep(T0 + 2_000, 100);
        assert_eq!(removed, 1);
        assert_eq!(backend.len(), 2);
        assert!(backend.status_at("long", T0 + 2_000).is_some());
        assert!(backend.status_at("blocked", T0 + 2_000).is_some());
    }

    #[test]
    fn test_sweep_respects_budget() {
        let backend = MemoryBackend::new();
        let policy = Policy::new(1, 1, 0);
        for i in 0..10 {
            backend.consume_at(&format!("k{}", i), &policy, T0);
        }

        assert_eq!(backend.sweep(T0 + 5_000, 4), 4);
        assert_eq!(backend.len(), 6);
    }

    #[test]
    fn test_concurrent_consumes_never_overgrant() {
        let backend = Arc::new(MemoryBackend::new());
        let policy = Policy::new(50, 60, 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let backend = backend.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| backend.consume_at("shared", &policy, T0).allowed)
                        .count()
                })
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
    }

    #[test]
    fn test_trait_consume_blocking() {
        let backend = MemoryBackend::new();
        let result = tokio_test::block_on(backend.consume("k", &Policy::new(1, 60, 0))).unwrap();
        assert!(result.allowed);
        assert_eq!(backend.name(), "memory");
    }
}
