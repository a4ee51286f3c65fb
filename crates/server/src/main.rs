use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cdm_server::app::{build_router, AppState};
use cdm_server::config::{LogFormat, ServerConfig};
use cdm_server::db::{
    migrations::run_migrations,
    pool::{check_pool_health, create_pg_pool, PoolConfig},
};
use cdm_server::store::GraphStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    init_tracing(&config);

    let store = open_store(&config).await?;
    let state = AppState::new(store, &config);
    let app = build_router(state, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting cdm server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("cdm server exited unexpectedly")
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn open_store(config: &ServerConfig) -> anyhow::Result<GraphStore> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("CDM_DATABASE_URL is not set; using the in-memory store, nothing will be persisted");
        return Ok(GraphStore::in_memory());
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env(config.db_require_tls))
        .await
        .context("failed to initialize PostgreSQL pool")?;
    check_pool_health(&pool).await.context("PostgreSQL health check failed")?;
    run_migrations(&pool).await?;
    info!("connected to PostgreSQL");

    Ok(GraphStore::Postgres(pool))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
