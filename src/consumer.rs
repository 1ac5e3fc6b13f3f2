//! Batch consumer
//!
//! Pulls raw event messages off the queue, buffers them into fixed-size
//! batches (with a time bound so a trickle of traffic still flows),
//! classifies each batch in one call, and feeds the results to the
//! aggregator and the broadcaster. A batch is acknowledged or rejected
//! as a unit; rejection requeues every message for redelivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broadcast::Broadcaster;
use crate::classify::{Classifier, Prediction};
use crate::error::ConsumeError;
use crate::event::{ClassificationEvent, FeatureRecord, RawEvent};
use crate::queue::{Delivery, MessageSource};
use crate::stats::StatsAggregator;
use crate::store::PersistenceBridge;

pub const DEFAULT_BATCH_SIZE: usize = 10;

pub struct BatchConsumer {
    source: Arc<dyn MessageSource>,
    classifier: Arc<dyn Classifier>,
    stats: Arc<StatsAggregator>,
    broadcaster: Arc<Broadcaster>,
    bridge: PersistenceBridge,
    batch_size: usize,
    batch_timeout: Duration,
    /// Pending deliveries; the lock is held only to append or to swap
    /// the buffer out, never across classification
    pending: Mutex<Vec<Delivery>>,
}

impl BatchConsumer {
    pub fn new(
        source: Arc<dyn MessageSource>,
        classifier: Arc<dyn Classifier>,
        stats: Arc<StatsAggregator>,
        broadcaster: Arc<Broadcaster>,
        bridge: PersistenceBridge,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            source,
            classifier,
            stats,
            broadcaster,
            bridge,
            batch_size: batch_size.max(1),
            batch_timeout,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Consume until the source closes. Detached batches are processed
    /// on their own tasks so buffering never stalls behind inference.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.batch_timeout);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                delivery = self.source.recv() => {
                    let Some(delivery) = delivery else { break };
                    let full = {
                        let mut pending = self.pending.lock().await;
                        pending.push(delivery);
                        if pending.len() >= self.batch_size {
                            Some(std::mem::take(&mut *pending))
                        } else {
                            None
                        }
                    };
                    if let Some(batch) = full {
                        spawn_process(Arc::clone(&self), batch);
                    }
                }
                _ = ticker.tick() => {
                    let batch = std::mem::take(&mut *self.pending.lock().await);
                    if !batch.is_empty() {
                        spawn_process(Arc::clone(&self), batch);
                    }
                }
            }
        }

        // Source closed; drain whatever is still buffered
        let batch = std::mem::take(&mut *self.pending.lock().await);
        if !batch.is_empty() {
            if let Err(e) = self.process_batch(batch).await {
                warn!(error = %e, "final batch rejected, requeueing");
            }
        }
    }

    /// Process a single delivery outside the batching loop, sharing the
    /// batch path (the classifier tolerates batch size 1)
    pub async fn process_one(&self, delivery: Delivery) -> Result<(), ConsumeError> {
        self.process_batch(vec![delivery]).await.map(|_| ())
    }

    /// Process one detached batch end to end. Returns the number of
    /// events acknowledged; any error means the whole batch was rejected.
    pub async fn process_batch(&self, batch: Vec<Delivery>) -> Result<usize, ConsumeError> {
        let mut raws = Vec::with_capacity(batch.len());
        for delivery in &batch {
            match RawEvent::parse(delivery.body()) {
                Ok(raw) => raws.push(raw),
                Err(e) => {
                    nack_all(batch);
                    return Err(ConsumeError::Malformed(e));
                }
            }
        }

        // Only traffic destined to the monitored host goes through the
        // model; everything else is synthetically normal
        let host = self.stats.monitored_host();
        let eligible: Vec<usize> = raws
            .iter()
            .enumerate()
            .filter(|(_, raw)| raw.additional_data.ipdst == host)
            .map(|(i, _)| i)
            .collect();
        let features: Vec<FeatureRecord> = eligible
            .iter()
            .map(|&i| raws[i].features.clone())
            .collect();

        let predictions = if features.is_empty() {
            Vec::new()
        } else {
            match self.classifier.classify(&features).await {
                Ok(predictions) => predictions,
                Err(e) => {
                    nack_all(batch);
                    return Err(ConsumeError::Classifier(e));
                }
            }
        };
        if predictions.len() != eligible.len() {
            let (expected, got) = (eligible.len(), predictions.len());
            nack_all(batch);
            return Err(ConsumeError::PredictionMismatch { expected, got });
        }

        // Pair predictions back to their events by position
        let mut by_index: HashMap<usize, Prediction> =
            eligible.into_iter().zip(predictions).collect();
        let events: Vec<ClassificationEvent> = raws
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let p = by_index.remove(&i).unwrap_or_else(Prediction::auto_normal);
                ClassificationEvent::merge(raw, p.predicted_class, p.confidence)
            })
            .collect();

        let flush_due = self.stats.update_batch(&events);

        let mut dispatches = Vec::new();
        for event in events.iter().filter(|e| !e.is_normal()) {
            warn!(
                class = %event.predicted_class,
                src = %event.packet.ipsrc,
                dst = %event.packet.ipdst,
                confidence = event.confidence,
                "[ALERT] suspicious traffic detected"
            );
            let broadcaster = Arc::clone(&self.broadcaster);
            let event = event.clone();
            dispatches.push(tokio::spawn(async move {
                broadcaster.publish_alert(&event).await;
            }));
        }
        for dispatch in dispatches {
            if let Err(e) = dispatch.await {
                warn!(error = %e, "alert dispatch task panicked");
            }
        }

        // Store failures are the bridge's concern and never fail the batch
        if flush_due {
            self.bridge.flush().await;
        }

        let count = batch.len();
        for delivery in batch {
            delivery.ack();
        }
        debug!(count, "batch acknowledged");
        Ok(count)
    }
}

fn spawn_process(consumer: Arc<BatchConsumer>, batch: Vec<Delivery>) {
    tokio::spawn(async move {
        if let Err(e) = consumer.process_batch(batch).await {
            warn!(error = %e, "batch rejected, requeueing");
        }
    });
}

fn nack_all(batch: Vec<Delivery>) {
    for delivery in batch {
        delivery.nack_requeue();
    }
}
