pub mod api;
pub mod broadcast;
pub mod classify;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod queue;
pub mod stats;
pub mod store;

use std::sync::Arc;

use anyhow::Result;

use broadcast::Broadcaster;
use classify::{Classifier, HttpClassifier};
use config::Config;
use consumer::BatchConsumer;
use queue::MessageSource;
use stats::StatsAggregator;
use store::sqlite::SqliteStore;
use store::{PersistenceBridge, StatisticsStore};

/// Wires the aggregator, broadcaster, classifier and store together.
/// One instance per process; the consumer and the API layer both hang
/// off it.
pub struct Engine {
    pub config: Config,
    pub stats: Arc<StatsAggregator>,
    pub broadcaster: Arc<Broadcaster>,
    pub store: Arc<dyn StatisticsStore>,
    pub classifier: Arc<dyn Classifier>,
}

impl Engine {
    /// Create an engine from configuration, opening the store at the
    /// configured path
    pub fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn StatisticsStore> = Arc::new(SqliteStore::open(config.db_path())?);
        let classifier: Arc<dyn Classifier> = Arc::new(HttpClassifier::new(
            config.classifier.url.clone(),
            config.classifier.timeout(),
        ));
        Ok(Self::with_parts(config, store, classifier))
    }

    /// Create an engine with explicit collaborators (used by tests)
    pub fn with_parts(
        config: Config,
        store: Arc<dyn StatisticsStore>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let stats = Arc::new(StatsAggregator::new(
            config.general.monitored_host.clone(),
            config.stats.flush_threshold,
        ));
        let broadcaster = Broadcaster::new(stats.clone(), config.broadcast.interval());
        Self {
            config,
            stats,
            broadcaster,
            store,
            classifier,
        }
    }

    /// Build the batch consumer for a message source
    pub fn consumer(&self, source: Arc<dyn MessageSource>) -> Arc<BatchConsumer> {
        Arc::new(BatchConsumer::new(
            source,
            self.classifier.clone(),
            self.stats.clone(),
            self.broadcaster.clone(),
            PersistenceBridge::new(self.stats.clone(), self.store.clone()),
            self.config.queue.batch_size,
            self.config.queue.batch_timeout(),
        ))
    }
}
