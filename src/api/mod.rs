//! HTTP/WebSocket surface
//!
//! Read endpoints expose the aggregator and the store; the two websocket
//! endpoints attach observers to the broadcaster. A local ingest endpoint
//! feeds the in-memory queue for setups without an external broker.

mod routes;
mod ws;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::broadcast::Broadcaster;
use crate::queue::MemoryQueue;
use crate::stats::StatsAggregator;
use crate::store::StatisticsStore;

pub struct AppState {
    pub stats: Arc<StatsAggregator>,
    pub broadcaster: Arc<Broadcaster>,
    pub store: Arc<dyn StatisticsStore>,
    pub queue: Arc<MemoryQueue>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(routes::health))
        .route("/api/statistics", get(routes::get_statistics))
        .route("/api/statistics/reset", post(routes::reset_statistics))
        .route("/api/statistics/cumulative", get(routes::cumulative_statistics))
        .route("/api/events", get(routes::list_events))
        .route("/api/ingest", post(routes::ingest))
        .route("/ws/alerts", get(ws::ws_alerts))
        .route("/ws/traffic", get(ws::ws_traffic))
        .layer(cors)
        .with_state(state)
}
