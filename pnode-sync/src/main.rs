/**
 * PNODE SYNC - entry point of the pNode statistics sync service
 *
 * ROLE: builds every component from configuration (store backend, pRPC client,
 * orchestrator), starts the in-process scheduler and serves the HTTP API.
 *
 * ARCHITECTURE: periodic roster fan-out -> aggregation -> snapshot store,
 * with a REST surface for triggers and dashboard reads.
 */

mod aggregate;
mod collector;
mod config;
mod health;
mod http;
mod models;
mod prpc;
mod retention;
mod state;
mod store;
mod sync;

use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::prpc::PrpcClient;
use crate::retention::RetentionPolicy;
use crate::store::open_store;
use crate::sync::{spawn_sync_scheduler, SyncService};

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pnode_sync=info")))
        .init();

    let cfg = load_config().await;
    info!(nodes = cfg.roster.len(), backend = ?cfg.store.backend, "configuration loaded");

    let store = open_store(&cfg.store).context("failed to open snapshot store")?;
    let client = PrpcClient::new(&cfg.prpc).context("failed to build pRPC client")?;

    let sync = Arc::new(SyncService::new(
        cfg.roster.clone(),
        Arc::new(client),
        store,
        RetentionPolicy::from(&cfg.retention),
        cfg.estimates.average_latency_ms,
    ));

    if cfg.schedule.interval_secs > 0 {
        spawn_sync_scheduler(sync.clone(), Duration::from_secs(cfg.schedule.interval_secs));
    } else {
        info!("in-process scheduler disabled, waiting for external triggers");
    }

    let api_key = std::env::var("SYNC_API_KEY").ok().filter(|k| !k.is_empty());
    if api_key.is_none() {
        warn!("SYNC_API_KEY not set, POST /sync will answer 401");
    }

    let app_state = AppState { sync, health_tracker: HealthTracker::new(), api_key };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(cfg.http.bind.as_str())
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!("listening on http://{}", cfg.http.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown requested");
        })
        .await
        .context("http server failed")?;
    Ok(())
}
