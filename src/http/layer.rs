//! Tower middleware enforcing the burst and sustained policies.
//!
//! Each request runs burst check, then policy check. A burst denial stops
//! before the sustained bucket is touched. Any backend error fails open:
//! the request is logged and handed to the inner service unannotated.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, trace, warn};

use super::classify::{Classify, RouteClassifier};
use crate::error::Result;
use crate::ratelimit::{
    BucketKey, ConsumeResult, Identity, Policy, PolicyTable, RateLimitService,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_BACKEND: HeaderName = HeaderName::from_static("x-ratelimit-backend");

const BURST_MESSAGE: &str = "Too Many Requests (burst)";
const POLICY_MESSAGE: &str = "Too Many Requests";

/// The sustained-policy decision, also available to downstream handlers
/// through request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Policy name the request was charged against
    pub policy: String,
    /// Points per window of that policy
    pub limit: u32,
    /// Backend that made the decision
    pub backend: &'static str,
    pub result: ConsumeResult,
}

impl RateLimitInfo {
    /// Write the observability headers.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.result.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.result.reset_secs()));
        match HeaderValue::from_str(self.backend) {
            Ok(backend) => {
                headers.insert(X_RATELIMIT_BACKEND, backend);
            }
            Err(_) => trace!(backend = self.backend, "Backend name is not a valid header value"),
        }
    }
}

/// JSON body of a 429 response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DenialBody {
    ok: bool,
    error: &'static str,
    retry_after_ms: u64,
}

/// Outcome of running both checks for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Both buckets granted a permit
    Allowed(RateLimitInfo),
    /// The burst bucket refused; the sustained bucket was not charged
    BurstDenied(ConsumeResult),
    /// The sustained bucket refused
    PolicyDenied(RateLimitInfo),
}

impl IntoResponse for Decision {
    /// Allowed decisions render as an empty 200; denials as the 429 body.
    fn into_response(self) -> Response {
        let (message, result, info) = match self {
            Decision::Allowed(info) => {
                let mut response = StatusCode::OK.into_response();
                info.apply(response.headers_mut());
                return response;
            }
            Decision::BurstDenied(result) => (BURST_MESSAGE, result, None),
            Decision::PolicyDenied(info) => (POLICY_MESSAGE, info.result, Some(info)),
        };

        let body = DenialBody {
            ok: false,
            error: message,
            retry_after_ms: result.retry_after_ms,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(result.retry_after_secs()));
        if let Some(info) = info {
            info.apply(headers);
        }
        response
    }
}

/// Shared per-request orchestration.
pub struct Enforcer {
    service: Arc<RateLimitService>,
    table: Arc<PolicyTable>,
    classifier: Arc<dyn Classify>,
    burst: Policy,
}

impl Enforcer {
    /// Derive the policy name and the identity charged for a request.
    pub fn classify(&self, req: &Request<Body>) -> (String, Identity) {
        (self.classifier.policy_name(req), self.classifier.identity(req))
    }

    /// Run the burst check, then the sustained-policy check.
    pub async fn decide(&self, policy_name: String, identity: Identity) -> Result<Decision> {
        let burst_key = BucketKey::burst(&identity).to_string_key();
        let burst = self.service.consume(&burst_key, self.burst).await?;
        if !burst.allowed {
            debug!(key = %burst_key, retry_after_ms = burst.retry_after_ms, "Burst limit exceeded");
            return Ok(Decision::BurstDenied(burst));
        }

        let overrides = self.table.overrides(&policy_name);
        let policy = self.service.resolve(&overrides);
        let key = BucketKey::policy(&identity, &policy_name).to_string_key();
        let result = self.service.consume(&key, policy).await?;
        trace!(key = %key, allowed = result.allowed, remaining = result.remaining, "Policy checked");

        let info = RateLimitInfo {
            policy: policy_name,
            limit: policy.points,
            backend: self.service.backend(),
            result,
        };
        if result.allowed {
            Ok(Decision::Allowed(info))
        } else {
            debug!(key = %key, retry_after_ms = result.retry_after_ms, "Rate limit exceeded");
            Ok(Decision::PolicyDenied(info))
        }
    }
}

/// Layer that applies rate limiting to an inner service.
#[derive(Clone)]
pub struct RateLimitLayer {
    enforcer: Arc<Enforcer>,
}

impl RateLimitLayer {
    /// Create a layer classifying requests with the policy table's routes.
    pub fn new(service: Arc<RateLimitService>, table: Arc<PolicyTable>, burst: Policy) -> Self {
        let classifier = Arc::new(RouteClassifier::new(table.clone()));
        Self {
            enforcer: Arc::new(Enforcer {
                service,
                table,
                classifier,
                burst,
            }),
        }
    }

    /// Replace the classifier with a host-supplied one.
    pub fn with_classifier(self, classifier: impl Classify) -> Self {
        let enforcer = Enforcer {
            service: self.enforcer.service.clone(),
            table: self.enforcer.table.clone(),
            classifier: Arc::new(classifier),
            burst: self.enforcer.burst,
        };
        Self {
            enforcer: Arc::new(enforcer),
        }
    }

    pub fn enforcer(&self) -> &Arc<Enforcer> {
        &self.enforcer
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            enforcer: self.enforcer.clone(),
        }
    }
}

/// Rate limiting service wrapping `S`.
#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    enforcer: Arc<Enforcer>,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let enforcer = self.enforcer.clone();
        // The clone in `self` may not be ready; use the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            // The body is not `Sync`, so no borrow of the request may live
            // across an await.
            let (policy_name, identity) = enforcer.classify(&request);
            let decision = match enforcer.decide(policy_name, identity).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %request.uri().path(),
                        "Rate limiter failed, allowing request"
                    );
                    return inner.call(request).await;
                }
            };

            let info = match decision {
                Decision::Allowed(info) => info,
                denied => return Ok(denied.into_response()),
            };

            request.extensions_mut().insert(info.clone());
            let mut response = inner.call(request).await?;
            info.apply(response.headers_mut());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QuotaError;
    use crate::http::classify::{CallerIdentity, FORWARDED_FOR};
    use crate::ratelimit::{
        BackendKind, BucketBackend, BucketStatus, PolicyOverride, ServiceOptions,
    };
    use async_trait::async_trait;
    use axum::extract::Extension;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    async fn memory_service(points: u32, duration: u32) -> Arc<RateLimitService> {
        let options = ServiceOptions {
            default_policy: Policy::new(points, duration, 0),
            sweep: None,
            ..ServiceOptions::default()
        };
        let mut service = RateLimitService::new(BackendKind::Memory, options);
        service.init().await;
        Arc::new(service)
    }

    fn app(service: Arc<RateLimitService>, table: PolicyTable, burst: Policy) -> Router {
        Router::new()
            .route("/api/markets", get(|| async { "markets" }))
            .route("/api/orders", get(|| async { "orders" }))
            .route(
                "/api/whoami",
                get(|Extension(info): Extension<RateLimitInfo>| async move { info.policy }),
            )
            .layer(RateLimitLayer::new(service, Arc::new(table), burst))
    }

    fn request(path: &str, client: &str) -> Request<Body> {
        Request::get(path)
            .header(FORWARDED_FOR, client)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_burst_denial_after_three_requests() {
        let service = memory_service(100, 60).await;
        let app = app(service.clone(), PolicyTable::new(), Policy::new(3, 1, 0));

        for _ in 0..3 {
            let response = app.clone().oneshot(request("/api/markets", "198.51.100.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(request("/api/markets", "198.51.100.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        assert!(response.headers().get(X_RATELIMIT_REMAINING).is_none());

        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("(burst)"));
        assert!(body["retryAfterMs"].as_u64().unwrap() <= 1000);

        // The sustained bucket was charged three times, not four.
        let status = service.status("ip:198.51.100.1:public").await.unwrap().unwrap();
        assert_eq!(status.remaining, 97);
    }

    #[tokio::test]
    async fn test_policy_denial_sets_headers() {
        let service = memory_service(2, 10).await;
        let app = app(service, PolicyTable::new(), Policy::new(100, 1, 0));

        let response = app.clone().oneshot(request("/api/markets", "198.51.100.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "1");
        assert_eq!(response.headers()[X_RATELIMIT_LIMIT], "2");
        assert_eq!(response.headers()[X_RATELIMIT_RESET], "10");
        assert_eq!(response.headers()[X_RATELIMIT_BACKEND], "memory");

        app.clone().oneshot(request("/api/markets", "198.51.100.2")).await.unwrap();
        let response = app.clone().oneshot(request("/api/markets", "198.51.100.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        assert_eq!(response.headers()[X_RATELIMIT_BACKEND], "memory");
        let retry: u64 = response.headers()[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!((1..=10).contains(&retry));

        let body = body_json(response).await;
        assert_eq!(body["error"], "Too Many Requests");
    }

    #[tokio::test]
    async fn test_named_policy_and_separate_buckets() {
        let service = memory_service(100, 60).await;
        let table = PolicyTable::new()
            .with_policy("orders", PolicyOverride::none().points(1))
            .with_route("/api/orders", "orders");
        let app = app(service, table, Policy::new(100, 1, 0));

        let response = app.clone().oneshot(request("/api/orders", "198.51.100.3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(request("/api/orders", "198.51.100.3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // Other policies keep their own bucket.
        let response = app.clone().oneshot(request("/api/markets", "198.51.100.3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "99");
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let service = memory_service(1, 60).await;
        let app = app(service, PolicyTable::new(), Policy::new(100, 1, 0));

        assert_eq!(app.clone().oneshot(request("/api/markets", "198.51.100.4")).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.clone().oneshot(request("/api/markets", "198.51.100.5")).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_info_visible_to_handler() {
        let service = memory_service(10, 60).await;
        let app = app(service.clone(), PolicyTable::new(), Policy::new(100, 1, 0));

        let mut req = request("/api/whoami", "198.51.100.6");
        req.extensions_mut().insert(CallerIdentity("alice".to_string()));
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"public");

        let key = BucketKey::policy(&Identity::User("alice".to_string()), "public");
        let status = service.status(&key.to_string_key()).await.unwrap().unwrap();
        assert_eq!(status.remaining, 9);
    }

    struct FailingBackend;

    #[async_trait]
    impl BucketBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn consume(&self, _key: &str, _policy: &Policy) -> Result<ConsumeResult> {
            Err(QuotaError::Timeout {
                operation: "consume",
                after: std::time::Duration::from_millis(1),
            })
        }

        async fn reset(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn status(&self, _key: &str) -> Result<Option<BucketStatus>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_backend_error_fails_open() {
        let service = Arc::new(RateLimitService::with_backend(
            Arc::new(FailingBackend),
            ServiceOptions::default(),
        ));
        let app = app(service, PolicyTable::new(), Policy::new(1, 1, 0));

        for _ in 0..3 {
            let response = app.clone().oneshot(request("/api/markets", "198.51.100.7")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(X_RATELIMIT_REMAINING).is_none());
        }
    }

    #[test]
    fn test_unrepresentable_backend_name_skips_header() {
        let info = RateLimitInfo {
            policy: "public".to_string(),
            limit: 10,
            backend: "bad\nname",
            result: ConsumeResult::allowed(9, 1_000),
        };
        let mut headers = HeaderMap::new();
        info.apply(&mut headers);

        assert!(headers.get(X_RATELIMIT_BACKEND).is_none());
        assert_eq!(headers[X_RATELIMIT_REMAINING], "9");
        assert_eq!(headers[X_RATELIMIT_LIMIT], "10");
    }

    struct FixedClassifier;

    impl Classify for FixedClassifier {
        fn policy_name(&self, _req: &Request<Body>) -> String {
            "fixed".to_string()
        }

        fn identity(&self, _req: &Request<Body>) -> Identity {
            Identity::User("everyone".to_string())
        }
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let service = memory_service(5, 60).await;
        let layer = RateLimitLayer::new(service.clone(), Arc::new(PolicyTable::new()), Policy::new(100, 1, 0))
            .with_classifier(FixedClassifier);

        let enforcer = layer.enforcer();
        let (policy_name, identity) = enforcer.classify(&request("/anything", "198.51.100.8"));
        let decision = enforcer.decide(policy_name, identity).await.unwrap();
        match decision {
            Decision::Allowed(info) => {
                assert_eq!(info.policy, "fixed");
                assert_eq!(info.result.remaining, 4);
            }
            other => panic!("unexpected decision: {:?}", other),
        }
        assert!(service.status("user:everyone:fixed").await.unwrap().is_some());
    }
}
