//! HTTP server hosting rate-limited routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::layer::{RateLimitInfo, RateLimitLayer};
use crate::error::Result;
use crate::ratelimit::{Policy, PolicyTable, RateLimitService};

type ApiResult = std::result::Result<Json<Value>, (StatusCode, Json<Value>)>;

fn internal_error(e: crate::error::QuotaError) -> (StatusCode, Json<Value>) {
    warn!(error = %e, "Admin request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": e.to_string() })),
    )
}

async fn health(State(service): State<Arc<RateLimitService>>) -> Json<Value> {
    Json(json!({ "ok": true, "backend": service.backend() }))
}

async fn echo(Path(rest): Path<String>, info: Option<axum::Extension<RateLimitInfo>>) -> Json<Value> {
    let policy = info.map(|axum::Extension(info)| info.policy);
    Json(json!({ "ok": true, "path": rest, "policy": policy }))
}

async fn bucket_status(
    State(service): State<Arc<RateLimitService>>,
    Path(key): Path<String>,
) -> ApiResult {
    let status = service.status(&key).await.map_err(internal_error)?;
    Ok(Json(json!({ "ok": true, "key": key, "status": status })))
}

async fn bucket_reset(
    State(service): State<Arc<RateLimitService>>,
    Path(key): Path<String>,
) -> ApiResult {
    service.reset(&key).await.map_err(internal_error)?;
    info!(key = %key, "Bucket reset");
    Ok(Json(json!({ "ok": true, "key": key })))
}

/// Build the application router.
///
/// `/health` and `/api/*` run behind the rate limiter; the
/// `/admin/ratelimit/:key` routes inspect and reset buckets and are not
/// limited.
pub fn router(service: Arc<RateLimitService>, table: Arc<PolicyTable>, burst: Policy) -> Router {
    let limited = Router::new()
        .route("/health", get(health))
        .route("/api/*rest", get(echo).post(echo))
        .layer(RateLimitLayer::new(service.clone(), table, burst));

    let admin = Router::new().route(
        "/admin/ratelimit/:key",
        get(bucket_status).delete(bucket_reset),
    );

    limited.merge(admin).with_state(service)
}

/// HTTP server for the rate limited application.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}
