//! Mailcast - Campaign delivery service entry point

use anyhow::Result;
use mailcast_api::{create_router, AppState};
use mailcast_common::config::{Config, LoggingConfig};
use mailcast_core::{build_mailer, Pipeline, Stores};
use mailcast_storage::DatabasePool;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    init_logging(&config.logging);
    info!("Starting Mailcast...");

    let stores = match config.database.url {
        Some(_) => {
            let db_pool = DatabasePool::new(&config.database).await?;
            db_pool.migrate().await?;
            Stores::database(db_pool)
        }
        None => {
            warn!("No database configured; campaigns and jobs are kept in memory only");
            Stores::in_memory()
        }
    };

    let mailer = build_mailer(&config.provider)?;
    info!(provider = ?config.provider.kind, "Mail provider configured");

    let pipeline = Pipeline::start(&config, stores, mailer).await?;

    let app = create_router(AppState::from_pipeline(&pipeline));
    let addr = config.server.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Starting API server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("API server stopped, draining delivery pipeline");

    pipeline.shutdown().await?;
    info!("Mailcast shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info,mailcast=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.is_json() {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
