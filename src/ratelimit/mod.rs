//! Rate limiting logic and state management.

mod backend;
mod key;
mod memory;
mod policy;
mod redis;
mod service;

pub use backend::{ceil_secs, now_ms, BackendKind, BucketBackend, BucketStatus, ConsumeResult};
pub use key::{BucketKey, Identity, BURST_SCOPE};
pub use memory::{Bucket, MemoryBackend};
pub use policy::{Policy, PolicyOverride, PolicyTable, RouteRule, DEFAULT_POLICY_NAME};
pub use self::redis::{RedisBackend, RedisOptions, DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
pub use service::{RateLimitService, ServiceOptions, SweepOptions};
