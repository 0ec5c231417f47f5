//! Request classification: which policy applies and who is charged.
//!
//! The host application owns both decisions. [`RouteClassifier`] is the
//! stock implementation: longest path prefix from a [`PolicyTable`], and an
//! identity taken from the auth layer before falling back to the client
//! address.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::ratelimit::{Identity, PolicyTable};

/// Authenticated caller id, inserted into request extensions by the host's
/// auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

/// Header consulted for the client address behind a proxy.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Host-supplied classification of inbound requests.
pub trait Classify: Send + Sync + 'static {
    /// Name of the sustained policy that applies to the request.
    fn policy_name(&self, req: &Request<Body>) -> String;

    /// The caller the request is charged to.
    fn identity(&self, req: &Request<Body>) -> Identity;
}

/// Client address: first `X-Forwarded-For` hop, else the peer address.
pub fn client_address(req: &Request<Body>) -> Option<IpAddr> {
    let forwarded = req
        .headers()
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());

    forwarded.or_else(|| {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip())
    })
}

/// Classifier driven by a [`PolicyTable`].
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    table: Arc<PolicyTable>,
}

impl RouteClassifier {
    pub fn new(table: Arc<PolicyTable>) -> Self {
        Self { table }
    }
}

impl Classify for RouteClassifier {
    fn policy_name(&self, req: &Request<Body>) -> String {
        self.table.select(req.uri().path()).to_string()
    }

    fn identity(&self, req: &Request<Body>) -> Identity {
        let user = req
            .extensions()
            .get::<CallerIdentity>()
            .map(|caller| caller.0.as_str());
        Identity::resolve(user, client_address(req))
    }
}
