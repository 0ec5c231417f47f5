//! Bucket key generation.

use std::fmt;
use std::net::IpAddr;

/// Scope suffix used for the burst bucket.
pub const BURST_SCOPE: &str = "burst";

/// The caller a bucket is charged to.
///
/// An authenticated user id always wins over a network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Authenticated user id supplied by the host's auth layer
    User(String),
    /// Client network address
    Address(String),
    /// Neither was available
    Unknown,
}

impl Identity {
    /// Build an identity from whatever the request carries.
    pub fn resolve(user_id: Option<&str>, address: Option<IpAddr>) -> Self {
        match (user_id.filter(|id| !id.is_empty()), address) {
            (Some(id), _) => Identity::User(id.to_string()),
            (None, Some(addr)) => Identity::Address(addr.to_string()),
            (None, None) => Identity::Unknown,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(id) => write!(f, "user:{}", id),
            Identity::Address(addr) => write!(f, "ip:{}", addr),
            Identity::Unknown => f.write_str("unknown"),
        }
    }
}

/// A key that uniquely identifies a bucket within a backend.
///
/// Rendered as `{identity}:{scope}`, where scope is a policy name or
/// [`BURST_SCOPE`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The caller identity, already rendered
    pub identity: String,
    /// Policy name or burst marker
    pub scope: String,
}

impl BucketKey {
    /// Key for the sustained bucket of a named policy.
    pub fn policy(identity: &Identity, policy_name: &str) -> Self {
        Self {
            identity: identity.to_string(),
            scope: policy_name.to_string(),
        }
    }

    /// Key for the burst bucket.
    pub fn burst(identity: &Identity) -> Self {
        Self {
            identity: identity.to_string(),
            scope: BURST_SCOPE.to_string(),
        }
    }

    /// Convert the key to the string handed to backends.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.identity, self.scope)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identity, self.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_wins_over_address() {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        let identity = Identity::resolve(Some("42"), Some(addr));
        assert_eq!(identity, Identity::User("42".to_string()));
    }

    #[test]
    fn test_address_fallback() {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            Identity::resolve(None, Some(addr)).to_string(),
            "ip:10.0.0.1"
        );
        assert_eq!(
            Identity::resolve(Some(""), Some(addr)).to_string(),
            "ip:10.0.0.1"
        );
    }

    #[test]
    fn test_missing_identity_is_unknown() {
        assert_eq!(Identity::resolve(None, None), Identity::Unknown);
    }

    #[test]
    fn test_bucket_key_format() {
        let identity = Identity::User("7".to_string());

        assert_eq!(BucketKey::policy(&identity, "public").to_string_key(), "user:7:public");
        assert_eq!(BucketKey::burst(&identity).to_string(), "user:7:burst");
    }

    #[test]
    fn test_burst_and_policy_keys_differ() {
        let identity = Identity::Address("::1".to_string());
        assert_ne!(BucketKey::burst(&identity), BucketKey::policy(&identity, "public"));
    }
}
