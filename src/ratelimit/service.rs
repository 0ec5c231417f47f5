//! Backend-selecting rate limit service.
//!
//! The service owns exactly one active [`BucketBackend`]. It tries the
//! requested backend during [`RateLimitService::init`] and substitutes the
//! in-process memory backend if that fails, preferring availability over
//! fleet-wide consistency. Consume-time errors are never swallowed here.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::backend::{BackendKind, BucketBackend, BucketStatus, ConsumeResult};
use super::memory::MemoryBackend;
use super::policy::{Policy, PolicyOverride};
use super::redis::{RedisBackend, RedisOptions};
use crate::error::Result;

/// Periodic cleanup settings for the memory backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOptions {
    pub interval: Duration,
    /// Upper bound on buckets removed per sweep
    pub budget: usize,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            budget: 10_000,
        }
    }
}

/// Options the service is constructed with.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Policy every per-call override is merged onto
    pub default_policy: Policy,
    /// Used when the Redis backend is requested
    pub redis: RedisOptions,
    /// Memory backend sweep; `None` disables it
    pub sweep: Option<SweepOptions>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            default_policy: Policy::default(),
            redis: RedisOptions::new("redis://127.0.0.1:6379"),
            sweep: Some(SweepOptions::default()),
        }
    }
}

/// Facade over the active bucket backend.
pub struct RateLimitService {
    requested: Option<BackendKind>,
    options: ServiceOptions,
    active: Arc<dyn BucketBackend>,
    sweeper: Option<JoinHandle<()>>,
}

impl RateLimitService {
    /// Create a service for one of the built-in backends.
    ///
    /// Until [`init`](Self::init) runs, the memory backend is active.
    pub fn new(requested: BackendKind, options: ServiceOptions) -> Self {
        Self {
            requested: Some(requested),
            options,
            active: Arc::new(MemoryBackend::new()),
            sweeper: None,
        }
    }

    /// Create a service around a caller-provided backend.
    pub fn with_backend(backend: Arc<dyn BucketBackend>, options: ServiceOptions) -> Self {
        Self {
            requested: None,
            options,
            active: backend,
            sweeper: None,
        }
    }

    /// Initialize the requested backend, falling back to memory on failure.
    ///
    /// This never fails: the memory backend's `init` cannot error.
    pub async fn init(&mut self) {
        let candidate: Arc<dyn BucketBackend> = match self.requested {
            Some(BackendKind::Memory) => return self.install_memory(),
            Some(BackendKind::Redis) => Arc::new(RedisBackend::new(self.options.redis.clone())),
            None => self.active.clone(),
        };

        match candidate.init().await {
            Ok(()) => {
                info!(backend = candidate.name(), "Rate limit backend selected");
                self.stop_sweeper();
                self.active = candidate;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    requested = candidate.name(),
                    "Rate limit backend unavailable, falling back to memory"
                );
                self.install_memory();
            }
        }
    }

    fn install_memory(&mut self) {
        let memory = Arc::new(MemoryBackend::new());
        self.stop_sweeper();
        if let Some(sweep) = self.options.sweep {
            if tokio::runtime::Handle::try_current().is_ok() {
                self.sweeper = Some(memory.clone().spawn_sweeper(sweep.interval, sweep.budget));
            }
        }
        self.active = memory;
        info!(backend = "memory", "Rate limit backend selected");
    }

    fn stop_sweeper(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }

    /// Name of the backend actually in use, which may differ from the one
    /// requested.
    pub fn backend(&self) -> &'static str {
        self.active.name()
    }

    /// The backend that was asked for, if it was a built-in one.
    pub fn requested(&self) -> Option<BackendKind> {
        self.requested
    }

    /// The policy overrides are merged onto.
    pub fn default_policy(&self) -> &Policy {
        &self.options.default_policy
    }

    /// Resolve a per-call override against the default policy.
    pub fn resolve(&self, overrides: &PolicyOverride) -> Policy {
        self.options.default_policy.merge(overrides)
    }

    /// Take one permit for `key`.
    ///
    /// Fails with [`QuotaError::Config`](crate::error::QuotaError::Config)
    /// if the merged policy has zero points or a zero duration.
    pub async fn consume(&self, key: &str, overrides: impl Into<PolicyOverride>) -> Result<ConsumeResult> {
        let policy = self.resolve(&overrides.into());
        policy.validate(key)?;
        self.active.consume(key, &policy).await
    }

    /// Drop all state for `key`.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.active.reset(key).await
    }

    /// Inspect the bucket for `key`.
    pub async fn status(&self, key: &str) -> Result<Option<BucketStatus>> {
        self.active.status(key).await
    }
}

impl Drop for RateLimitService {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}
