//! Bucket backend trait for abstracting local and shared enforcement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::policy::Policy;
use crate::error::{QuotaError, Result};

/// Outcome of a single consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResult {
    /// Whether the permit was granted
    pub allowed: bool,
    /// Permits left in the current window
    pub remaining: u32,
    /// Milliseconds until the window rolls over
    pub reset_ms: u64,
    /// Milliseconds the caller should wait; 0 when allowed
    pub retry_after_ms: u64,
}

impl ConsumeResult {
    pub fn allowed(remaining: u32, reset_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_ms,
            retry_after_ms: 0,
        }
    }

    pub fn denied(reset_ms: u64, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_ms,
            retry_after_ms,
        }
    }

    /// `retry_after_ms` rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.retry_after_ms)
    }

    /// `reset_ms` rounded up to whole seconds.
    pub fn reset_secs(&self) -> u64 {
        ceil_secs(self.reset_ms)
    }
}

/// Read-only view of a live bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStatus {
    pub remaining: u32,
    pub reset_ms: u64,
    /// Remaining lockout, 0 when no block is active
    pub blocked_ms: u64,
}

/// Round milliseconds up to whole seconds, never under-estimating.
pub fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

/// Wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// The backends this crate ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process buckets
    #[default]
    Memory,
    /// Buckets shared through Redis
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Redis => "redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "redis" => Ok(BackendKind::Redis),
            other => Err(QuotaError::Config(format!(
                "unknown rate limit backend '{}', expected 'memory' or 'redis'",
                other
            ))),
        }
    }
}

/// Trait for bucket backend implementations.
///
/// Implementations must make `consume` atomic per key: across any set of
/// concurrent calls for one key, the number of granted permits within a
/// window never exceeds `policy.points`. Errors are returned to the caller
/// untouched; deciding whether to fail open is not the backend's job.
#[async_trait]
pub trait BucketBackend: Send + Sync {
    /// Short name reported in headers and logs.
    fn name(&self) -> &'static str;

    /// Prepare the backend for use.
    async fn init(&self) -> Result<()>;

    /// Take one permit from the bucket for `key`.
    async fn consume(&self, key: &str, policy: &Policy) -> Result<ConsumeResult>;

    /// Drop every piece of state held for `key`.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Inspect the bucket for `key` without mutating it.
    async fn status(&self, key: &str) -> Result<Option<BucketStatus>>;
}
