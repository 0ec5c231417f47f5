//! Rate limit policies and path-based policy selection.
//!
//! A [`Policy`] is the fully specified set of enforcement parameters. Named
//! entries in a [`PolicyTable`] are stored as [`PolicyOverride`]s so that a
//! table only needs to spell out the fields it changes; the service merges
//! them onto its default policy field by field.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::key::BURST_SCOPE;
use crate::error::{QuotaError, Result};

/// Policy name used when no route prefix matches a request path.
pub const DEFAULT_POLICY_NAME: &str = "public";

/// Enforcement parameters for a single bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Permits granted per window
    pub points: u32,
    /// Window length in seconds
    pub duration: u32,
    /// Lockout applied once the bucket is exhausted (0 disables it)
    #[serde(default)]
    pub block_ms: u64,
}

impl Policy {
    pub const fn new(points: u32, duration: u32, block_ms: u64) -> Self {
        Self {
            points,
            duration,
            block_ms,
        }
    }

    /// Window length in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        u64::from(self.duration) * 1000
    }

    /// Apply every field the override sets, keeping the rest.
    pub fn merge(&self, overrides: &PolicyOverride) -> Policy {
        Policy {
            points: overrides.points.unwrap_or(self.points),
            duration: overrides.duration.unwrap_or(self.duration),
            block_ms: overrides.block_ms.unwrap_or(self.block_ms),
        }
    }

    /// Reject policies that could never grant a permit or never roll over.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.points == 0 {
            return Err(QuotaError::Config(format!(
                "policy '{}': points must be greater than zero",
                name
            )));
        }
        if self.duration == 0 {
            return Err(QuotaError::Config(format!(
                "policy '{}': duration must be greater than zero",
                name
            )));
        }
        Ok(())
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(60, 60, 0)
    }
}

/// A partially specified policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    pub points: Option<u32>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub block_ms: Option<u64>,
}

impl PolicyOverride {
    /// An override that changes nothing.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn points(mut self, points: u32) -> Self {
        self.points = Some(points);
        self
    }

    pub fn duration(mut self, duration: u32) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = Some(block_ms);
        self
    }
}

impl From<Policy> for PolicyOverride {
    fn from(policy: Policy) -> Self {
        Self {
            points: Some(policy.points),
            duration: Some(policy.duration),
            block_ms: Some(policy.block_ms),
        }
    }
}

impl From<&Policy> for PolicyOverride {
    fn from(policy: &Policy) -> Self {
        (*policy).into()
    }
}

/// Maps a path prefix onto a named policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path prefix, matched against the raw request path
    pub prefix: String,
    /// Name of the policy applied to matching paths
    pub policy: String,
}

/// Named policies plus the routes that select them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Policy name to override applied on top of the default policy
    #[serde(default)]
    pub named: HashMap<String, PolicyOverride>,
    /// Prefix routes; order does not matter, the longest match wins
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

impl PolicyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named policy.
    pub fn with_policy(mut self, name: impl Into<String>, policy: impl Into<PolicyOverride>) -> Self {
        self.named.insert(name.into(), policy.into());
        self
    }

    /// Register a route prefix.
    pub fn with_route(mut self, prefix: impl Into<String>, policy: impl Into<String>) -> Self {
        self.routes.push(RouteRule {
            prefix: prefix.into(),
            policy: policy.into(),
        });
        self
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(format!("Failed to parse policy table: {}", e)))
    }

    /// Select the policy name for a path by longest-prefix match.
    pub fn select(&self, path: &str) -> &str {
        self.routes
            .iter()
            .filter(|rule| path.starts_with(rule.prefix.as_str()))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| rule.policy.as_str())
            .unwrap_or(DEFAULT_POLICY_NAME)
    }

    /// Look up the override for a policy name. Unknown names fall back to
    /// the default policy unchanged.
    pub fn overrides(&self, name: &str) -> PolicyOverride {
        self.named.get(name).copied().unwrap_or_default()
    }

    /// Check every named policy against `base` and every route target.
    ///
    /// The burst bucket's scope is reserved and cannot name a policy.
    pub fn validate(&self, base: &Policy) -> Result<()> {
        let reserved = self
            .named
            .keys()
            .map(String::as_str)
            .chain(self.routes.iter().map(|rule| rule.policy.as_str()))
            .find(|name| *name == BURST_SCOPE);
        if let Some(name) = reserved {
            return Err(QuotaError::Config(format!(
                "policy name '{}' is reserved for the burst bucket",
                name
            )));
        }
        for (name, overrides) in &self.named {
            base.merge(overrides).validate(name)?;
        }
        for rule in &self.routes {
            if rule.policy != DEFAULT_POLICY_NAME && !self.named.contains_key(&rule.policy) {
                return Err(QuotaError::Config(format!(
                    "route '{}' refers to unknown policy '{}'",
                    rule.prefix, rule.policy
                )));
            }
        }
        Ok(())
    }
}
