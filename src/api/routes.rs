use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::AppState;
use crate::stats::StatsSnapshot;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Current (unflushed) aggregation window
pub async fn get_statistics(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

pub async fn reset_statistics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.stats.reset();
    Json(json!({ "status": "reset" }))
}

/// Cumulative statistics document accumulated across flushes
pub async fn cumulative_statistics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.store.cumulative_statistics().await {
        Ok(Some(doc)) => Ok(Json(doc)),
        Ok(None) => Ok(Json(json!({}))),
        Err(e) => {
            warn!(error = %e, "failed to read cumulative statistics");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Lookback window in minutes
    minutes: Option<i64>,
}

/// One year; `Duration::minutes` panics on values past its bounds, so the
/// query parameter is clamped before the subtraction
const MAX_LOOKBACK_MINUTES: i64 = 527_040;

fn lookback_since(minutes: Option<i64>) -> (i64, DateTime<Utc>) {
    let minutes = minutes.unwrap_or(60).clamp(0, MAX_LOOKBACK_MINUTES);
    (minutes, Utc::now() - Duration::minutes(minutes))
}

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let (minutes, since) = lookback_since(params.minutes);

    match state.store.recent_events(since).await {
        Ok(events) => {
            let total = events.len();
            Ok(Json(json!({
                "events": events,
                "total": total,
                "minutes": minutes,
            })))
        }
        Err(e) => {
            warn!(error = %e, "failed to read recent events");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Push one raw event message onto the in-memory queue
pub async fn ingest(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    state.queue.publish(body.to_vec());
    StatusCode::ACCEPTED
}
