//! HTTP enforcement layer and the server that hosts it.

mod classify;
mod layer;
mod server;

pub use classify::{client_address, CallerIdentity, Classify, RouteClassifier, FORWARDED_FOR};
pub use layer::{
    Decision, Enforcer, RateLimitInfo, RateLimitLayer, RateLimitMiddleware, X_RATELIMIT_BACKEND,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::{router, HttpServer};
