/**
 * FLEETDECK KERNEL - entry point of the fleet-control dashboard server
 *
 * Loads the boot config, builds the immutable registry, picks one backend for
 * the configured control mode and serves the REST API and live channel.
 */

mod aggregator;
mod backend;
mod cache;
mod clock;
mod cluster;
mod config;
mod dispatcher;
mod execution;
mod host;
mod http;
mod live;
mod models;
mod processes;
mod registry;
mod state;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::StatusAggregator;
use crate::backend::{Backend, ClusterBackend, LocalBackend};
use crate::cluster::ProxyClient;
use crate::config::load_config;
use crate::dispatcher::ControlDispatcher;
use crate::execution::SystemRunner;
use crate::host::HostSampler;
use crate::http::AppState;
use crate::models::ControlMode;
use crate::processes::SysinfoTable;
use crate::registry::EnvironmentRegistry;
use crate::state::LastErrors;

const CACHE_SWEEP: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fleetdeck_kernel=info")),
        )
        .init();

    let cfg = load_config().await.context("loading configuration")?;
    let registry = Arc::new(EnvironmentRegistry::from_config(&cfg).context("building registry")?);
    info!(
        mode = %registry.mode(),
        services = registry.services().len(),
        environments = registry.environments().len(),
        "registry loaded"
    );

    let errors = LastErrors::new();
    let mut proxy_url = None;
    let backend: Arc<dyn Backend> = match registry.mode() {
        ControlMode::Orchestrated => {
            let proxy = Arc::new(ProxyClient::from_config(&cfg.proxy, &cfg.cache_ttl));
            proxy_url = Some(proxy.base_url().to_string());
            spawn_cache_sweeper(proxy.clone());
            Arc::new(ClusterBackend::new(proxy, registry.clone()))
        }
        ControlMode::Local => {
            tokio::fs::create_dir_all(&cfg.log_dir)
                .await
                .with_context(|| format!("creating log dir {}", cfg.log_dir.display()))?;
            Arc::new(LocalBackend::new(
                Arc::new(SystemRunner),
                Arc::new(SysinfoTable::new()),
                registry.clone(),
                cfg.log_dir.clone(),
            ))
        }
    };

    let mut aggregator = StatusAggregator::new(
        backend.clone(),
        registry.clone(),
        Arc::new(HostSampler::new()),
        errors.clone(),
    );
    if let Some(url) = proxy_url {
        aggregator = aggregator.with_proxy_url(url);
    }
    let dispatcher = ControlDispatcher::new(backend, registry.clone(), errors);

    if cfg.api_key.is_none() {
        warn!("no API key configured, every route except /health will answer 401");
    }

    let app_state = AppState {
        aggregator: Arc::new(aggregator),
        dispatcher: Arc::new(dispatcher),
        registry,
        api_key: cfg.api_key.as_deref().map(Arc::from),
        tick: Duration::from_secs(cfg.tick_secs.max(1)),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    info!("listening on http://{}", cfg.listen);
    axum::serve(listener, app).await.context("serving http")?;
    Ok(())
}

/// Drops expired proxy cache entries so unused namespaces do not pile up.
fn spawn_cache_sweeper(proxy: Arc<ProxyClient>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_SWEEP);
        loop {
            ticker.tick().await;
            let removed = proxy.cleanup();
            if removed > 0 {
                debug!(removed, "expired cache entries dropped");
            }
        }
    });
}
