// ABOUTME: Drydock server binary: config, tracing, engine assembly and HTTP serve
// ABOUTME: Wires sqlite storage, port pool, log store and the docker runtime together

use axum::http::Method;
use drydock_api::{create_router, AppState};
use drydock_cache::ArtifactCache;
use drydock_cases::{CaseEngine, CaseStorage, EngineConfig, ReadinessPolicy};
use drydock_logs::CaseLogStore;
use drydock_ports::PortPool;
use drydock_runtime::DockerRuntime;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod fetcher;

use config::Config;
use fetcher::GitFetcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!("Starting drydock server on port {}", config.port);

    tokio::fs::create_dir_all(&config.workdir).await?;

    let storage = Arc::new(CaseStorage::connect(&config.database_url).await?);
    let ports = Arc::new(PortPool::new(
        config.port_range_start,
        config.port_range_end,
    )?);
    let logs = Arc::new(CaseLogStore::new(config.log_retention_lines));

    let runtime = Arc::new(DockerRuntime::new()?);
    if !runtime.is_available().await {
        warn!("Docker daemon is not responding; case pipelines will fail until it is");
    }

    let fetcher = Arc::new(GitFetcher::new(config.workdir.clone()));

    let engine_config = EngineConfig {
        workers: config.workers,
        workdir: config.workdir.clone(),
        dockerfile_search_depth: config.dockerfile_search_depth,
        default_container_port: config.default_container_port,
        build_network: config.build_network.clone(),
        readiness: ReadinessPolicy {
            grace: config.readiness_grace,
            probe_tcp: config.readiness_probe,
            require_probe: false,
            poll_interval: Duration::from_millis(250),
        },
        monitor_interval: Duration::from_secs(1),
        stop_grace: config.stop_grace,
        access_host: config.access_host.clone(),
    };

    let engine = Arc::new(CaseEngine::new(
        storage,
        runtime,
        fetcher,
        ports,
        logs,
        engine_config,
    ));
    engine.start();

    let cors = CorsLayer::new()
        .allow_origin(config.cors_origin.parse::<axum::http::HeaderValue>()?)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = create_router(AppState {
        engine: Arc::clone(&engine),
        artifacts: Arc::new(ArtifactCache::new()),
    })
    .layer(cors);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
