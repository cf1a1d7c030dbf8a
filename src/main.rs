//! Binary entrypoint: load configuration, wire the middleware stack, serve HTTP.

use std::sync::Arc;

use aviation_gateway::breaker::CircuitBreaker;
use aviation_gateway::cache::Cache;
use aviation_gateway::config::Config;
use aviation_gateway::metrics::Metrics;
use aviation_gateway::quota::QuotaLedger;
use aviation_gateway::router::{build_router, AppState};
use aviation_gateway::store::Store;
use aviation_gateway::upstream::{AviationClient, UpstreamCaller};
use anyhow::Context;
use axum::http::StatusCode;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // A missing required secret is a config-validation failure, not a startup I/O error: it
    // gets its own clear message and exit code before anything else runs.
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("refusing to start: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(config).await {
        tracing::error!(error = ?e, "gateway exited with an error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(
        Store::open(&config.store_path)
            .with_context(|| format!("opening store at {}", config.store_path.display()))?,
    );
    store.clone().spawn_cache_reaper(std::time::Duration::from_secs(60));

    let cache = Cache::new(store.clone(), config.cache_ttl);
    let breaker = CircuitBreaker::new(
        config.breaker_failure_threshold,
        config.breaker_recovery,
        config.breaker_half_open_probes,
    );
    let quota = Arc::new(QuotaLedger::new(store.clone(), config.quota_ceiling));
    let metrics = Arc::new(Metrics::new());
    let client = AviationClient::new(
        config.upstream_base_url.clone(),
        config.upstream_api_key.clone(),
        config.request_timeout,
    );
    let upstream = Arc::new(UpstreamCaller::new(
        client,
        cache,
        breaker,
        quota,
        metrics,
        store,
    ));

    let app = build_router(AppState { upstream }).layer(
        ServiceBuilder::new().layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        )),
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
