//! Items API server.
//!
//! Run with: `cargo run --bin items-api`
//!
//! Environment:
//! - `BIND_ADDR` (default `127.0.0.1:3000`)
//! - `PERSISTENCE_GUARD_SAFE_METHODS`, `PERSISTENCE_GUARD_ERROR_STATUS`,
//!   `PERSISTENCE_GUARD_CHECK_EVERY_FRAME`
//! - `RUST_LOG`
//!
//! Metrics: `GET /metrics` (outside the guard)

use anyhow::Context;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use safe_persist_core::GuardConfig;
use safe_persist_testing::InMemoryStore;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    let config = GuardConfig::from_env().context("Invalid persistence guard configuration")?;
    info!(
        safe_methods = config.safe_methods.len(),
        check_every_frame = config.check_every_frame,
        "Persistence guard configured"
    );

    let app = items_api::app(InMemoryStore::new(), config)
        .route("/metrics", get(move || std::future::ready(prometheus.render())));

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Items API listening on http://{addr}");
    info!("  GET  /items        - List items");
    info!("  POST /items        - Create item");
    info!("  GET  /items/:id    - Get item");
    info!("  GET  /items/touch  - Persist on a safe request (blocked)");
    info!("  POST /items/draft  - Stage without persisting (rejected)");
    info!("  GET  /metrics      - Prometheus metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "items_api=info,safe_persist_web=info,safe_persist_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => error!("Unable to listen for shutdown signal: {err}"),
    }
}
