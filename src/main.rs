use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netwarden::api::{self, AppState};
use netwarden::config::Config;
use netwarden::queue::{MemoryQueue, MessageSource};
use netwarden::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_or_default()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.clone()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    info!(
        host = %config.general.monitored_host,
        queue = %config.queue.name,
        "starting netwarden"
    );

    let engine = Engine::new(config)?;
    let queue = MemoryQueue::new();
    let consumer = engine.consumer(queue.clone() as Arc<dyn MessageSource>);
    tokio::spawn(consumer.run());

    let state = Arc::new(AppState {
        stats: engine.stats.clone(),
        broadcaster: engine.broadcaster.clone(),
        store: engine.store.clone(),
        queue,
    });
    let app = api::router(state);

    let listen = engine.config.api.listen.clone();
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("API listening on {}", listen);
    axum::serve(listener, app).await?;

    Ok(())
}
