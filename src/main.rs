use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotaguard::config::QuotaConfig;
use quotaguard::http::{router, HttpServer};
use quotaguard::ratelimit::RateLimitService;

/// Rate limited HTTP service with memory or Redis backed buckets.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Quotaguard Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => QuotaConfig::from_file(path)?,
        None => QuotaConfig::default(),
    }
    .with_env()?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        backend = %config.rate_limiting.backend,
        "Configuration loaded"
    );

    // Initialize the rate limit service once and hand it to the router
    let mut service = RateLimitService::new(config.rate_limiting.backend, config.service_options());
    service.init().await;
    info!(
        requested = %config.rate_limiting.backend,
        active = service.backend(),
        "Rate limit service initialized"
    );

    let app = router(
        Arc::new(service),
        Arc::new(config.policies.clone()),
        config.rate_limiting.burst_policy,
    );
    let server = HttpServer::new(config.server.listen_addr, app);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Quotaguard Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
