mod agent;
mod api;
mod config;
mod defaults;
mod error;
mod flow;
mod form;
mod http;
mod jobs;
mod marketplace;
mod media;
mod metrics;
mod models;
mod observer;
mod persisted;
mod poll;
mod scan;
mod store;

use agent::Agent;
use config::AgentConfig;
use eyre::WrapErr;
use http::ReqwestTransport;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::Arc};
use store::{KeyValueStore, MemoryStore, RedisStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AgentConfig::from_env().wrap_err("loading configuration")?;
    let store: Arc<dyn KeyValueStore> = match &config.redis_url {
        Some(url) => match RedisStore::open(url) {
            Ok(redis) => Arc::new(redis),
            Err(err) => {
                warn!(target = "agent.api", error = %err, "redis_unavailable_using_memory");
                Arc::new(MemoryStore::new())
            }
        },
        None => Arc::new(MemoryStore::new()),
    };

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let agent = Agent::new(&config, Arc::new(ReqwestTransport::new()), store.clone());
    let (queue, _worker) = jobs::JobQueue::spawn(agent.clone());

    let state = api::AppState {
        agent,
        queue,
        store,
        metrics: Some(prometheus_handle),
        idempotency_ttl: config.idempotency_ttl_secs,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = api::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(config.request_max_bytes));

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(
        target = "agent.api",
        marketplaces = ?config.profiles.marketplaces.keys().collect::<Vec<_>>(),
        "listening on {addr}"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
