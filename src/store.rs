//! Persistence seam between the aggregator and the document store
//!
//! The store keeps one cumulative statistics document merged additively
//! across flushes and an append-only collection of non-normal events.
//! Map keys are escaped on write (document-key grammars commonly reject
//! dots, and IP addresses are full of them) and unescaped on read.

pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::event::ClassificationEvent;
use crate::stats::{StatsAggregator, StatsSnapshot};

/// Fixed document id for the cumulative statistics document
pub const STATS_DOC_ID: &str = "cumulative_network_stats";

/// Escape a map key for storage. '%' must be escaped first so the
/// transform round-trips.
pub fn escape_key(key: &str) -> String {
    key.replace('%', "%25").replace('.', "%2E")
}

/// Reverse of `escape_key`
pub fn unescape_key(key: &str) -> String {
    key.replace("%2E", ".").replace("%25", "%")
}

/// Operations the pipeline needs from the document store
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    /// Additively merge a flushed snapshot into the cumulative document,
    /// creating it if absent. Counters add; map entries increment per key.
    async fn merge_statistics(&self, delta: &StatsSnapshot) -> anyhow::Result<()>;

    /// Append a batch of non-normal events
    async fn insert_events(&self, events: &[ClassificationEvent]) -> anyhow::Result<()>;

    /// Events recorded at or after `since`, newest first
    async fn recent_events(
        &self,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ClassificationEvent>>;

    /// The cumulative statistics document, keys unescaped, or `None`
    /// before the first flush
    async fn cumulative_statistics(&self) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Drains the aggregator into the store when the flush threshold fires.
///
/// Store failures are logged and left for the next flush attempt; they
/// never fail the batch that triggered the flush.
pub struct PersistenceBridge {
    stats: Arc<StatsAggregator>,
    store: Arc<dyn StatisticsStore>,
}

impl PersistenceBridge {
    pub fn new(stats: Arc<StatsAggregator>, store: Arc<dyn StatisticsStore>) -> Self {
        Self { stats, store }
    }

    /// Atomically drain the window and push it to the store
    pub async fn flush(&self) {
        let (snapshot, non_normal) = self.stats.flush_and_reset();
        if snapshot.is_empty() && non_normal.is_empty() {
            return;
        }

        if let Err(e) = self.store.merge_statistics(&snapshot).await {
            warn!(error = %e, "failed to merge statistics into store");
        }
        if !non_normal.is_empty() {
            if let Err(e) = self.store.insert_events(&non_normal).await {
                warn!(
                    error = %e,
                    count = non_normal.len(),
                    "failed to persist non-normal events"
                );
            }
        }
        info!(
            alerts = non_normal.len(),
            "flushed statistics window to store"
        );
    }
}
