//! Configuration management for Quotaguard.
//!
//! Settings come from an optional YAML file, then the process environment:
//! `RATE_LIMIT_BACKEND`, `RATE_LIMIT_DEFAULT_POINTS`,
//! `RATE_LIMIT_DEFAULT_DURATION`, `RATE_LIMIT_DEFAULT_BLOCK_MS`,
//! `RATE_LIMIT_BURST_POINTS`, `RATE_LIMIT_BURST_DURATION` and `REDIS_URL`.
//! Environment values win over the file.

use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{QuotaError, Result};
use crate::ratelimit::{
    BackendKind, Policy, PolicyTable, RedisOptions, ServiceOptions, SweepOptions,
};

/// Main configuration for the Quotaguard service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Named policies and the routes that select them
    #[serde(default)]
    pub policies: PolicyTable,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requested backend; the memory backend is used if it fails to start
    #[serde(default)]
    pub backend: BackendKind,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Policy applied when a route names no policy of its own
    #[serde(default = "default_policy")]
    pub default_policy: Policy,

    /// Short-window policy checked before the route policy
    #[serde(default = "default_burst_policy")]
    pub burst_policy: Policy,

    /// Redis connect and script load timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Redis per-command timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Memory sweep interval in seconds (0 disables sweeping)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum buckets removed per sweep
    #[serde(default = "default_sweep_budget")]
    pub sweep_budget: usize,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            redis_url: default_redis_url(),
            default_policy: default_policy(),
            burst_policy: default_burst_policy(),
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_budget: default_sweep_budget(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_policy() -> Policy {
    Policy::new(60, 60, 0)
}

fn default_burst_policy() -> Policy {
    Policy::new(10, 5, 0)
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_command_timeout() -> u64 {
    500
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_sweep_budget() -> usize {
    10_000
}

/// Values recognized in the environment; unset ones leave the config alone.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    backend: Option<String>,
    default_points: Option<u32>,
    default_duration: Option<u32>,
    default_block_ms: Option<u64>,
    burst_points: Option<u32>,
    burst_duration: Option<u32>,
    url: Option<String>,
}

impl EnvOverrides {
    fn load(source: Option<HashMap<String, String>>) -> Result<Self> {
        let settings = Config::builder()
            .add_source(
                Environment::with_prefix("RATE_LIMIT")
                    .try_parsing(true)
                    .source(source.clone()),
            )
            .add_source(Environment::with_prefix("REDIS").source(source))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

impl QuotaConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| QuotaError::Config(e.to_string()))
    }

    /// Overlay the process environment.
    pub fn with_env(self) -> Result<Self> {
        self.apply_env(None)
    }

    /// Overlay an explicit variable map instead of the process environment.
    pub fn with_env_map(self, vars: HashMap<String, String>) -> Result<Self> {
        self.apply_env(Some(vars))
    }

    fn apply_env(mut self, source: Option<HashMap<String, String>>) -> Result<Self> {
        let env = EnvOverrides::load(source)?;
        let rl = &mut self.rate_limiting;

        if let Some(backend) = env.backend {
            rl.backend = backend.parse()?;
        }
        if let Some(url) = env.url {
            rl.redis_url = url;
        }
        if let Some(points) = env.default_points {
            rl.default_policy.points = points;
        }
        if let Some(duration) = env.default_duration {
            rl.default_policy.duration = duration;
        }
        if let Some(block_ms) = env.default_block_ms {
            rl.default_policy.block_ms = block_ms;
        }
        if let Some(points) = env.burst_points {
            rl.burst_policy.points = points;
        }
        if let Some(duration) = env.burst_duration {
            rl.burst_policy.duration = duration;
        }
        Ok(self)
    }

    /// Reject numbers that would make a policy unusable.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        rl.default_policy.validate("default")?;
        rl.burst_policy.validate("burst")?;
        self.policies.validate(&rl.default_policy)
    }

    /// Options for constructing the rate limit service.
    pub fn service_options(&self) -> ServiceOptions {
        let rl = &self.rate_limiting;
        let sweep = (rl.sweep_interval_secs > 0).then(|| SweepOptions {
            interval: Duration::from_secs(rl.sweep_interval_secs),
            budget: rl.sweep_budget,
        });
        ServiceOptions {
            default_policy: rl.default_policy,
            redis: RedisOptions {
                url: rl.redis_url.clone(),
                connect_timeout: Duration::from_millis(rl.connect_timeout_ms),
                command_timeout: Duration::from_millis(rl.command_timeout_ms),
            },
            sweep,
        }
    }
}
