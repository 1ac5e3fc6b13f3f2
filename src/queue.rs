//! Queue collaborator contract
//!
//! The consumer pulls raw event messages from an at-least-once queue with
//! manual acknowledgment. The broker itself is external; this module
//! defines the seam (`MessageSource` + `Delivery`) and an in-memory queue
//! that honors the same redelivery contract for local ingest and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

/// Final disposition of one delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    NackRequeue,
}

/// One in-flight message. Dropping a delivery without acknowledging it
/// counts as a rejection, so an aborted consumer never loses messages.
#[derive(Debug)]
pub struct Delivery {
    body: Vec<u8>,
    outcome: Option<oneshot::Sender<Disposition>>,
}

impl Delivery {
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Acknowledge the message; it will not be redelivered
    pub fn ack(mut self) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(Disposition::Ack);
        }
    }

    /// Reject the message and request redelivery
    pub fn nack_requeue(mut self) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(Disposition::NackRequeue);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(Disposition::NackRequeue);
        }
    }
}

/// Source of raw queue messages. `recv` resolves to `None` once the
/// queue is closed and fully drained.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn recv(&self) -> Option<Delivery>;
}

/// In-memory at-least-once queue. Messages stay owned by the queue until
/// acknowledged; a nack (or a dropped, unacknowledged delivery) puts the
/// message back at the tail.
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    published: AtomicU64,
    acked: Arc<AtomicU64>,
    nacked: Arc<AtomicU64>,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            published: AtomicU64::new(0),
            acked: Arc::new(AtomicU64::new(0)),
            nacked: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Enqueue a raw message body
    pub fn publish(&self, body: Vec<u8>) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(body);
    }

    /// Messages published so far; redeliveries are not counted
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn nacked(&self) -> u64 {
        self.nacked.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageSource for MemoryQueue {
    async fn recv(&self) -> Option<Delivery> {
        let body = self.rx.lock().await.recv().await?;
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let requeue_tx = self.tx.clone();
        let requeue_body = body.clone();
        let acked = Arc::clone(&self.acked);
        let nacked = Arc::clone(&self.nacked);
        tokio::spawn(async move {
            // A closed sender means the delivery was dropped unhandled,
            // which the Drop impl already reported as a nack.
            let disposition = outcome_rx.await.unwrap_or(Disposition::NackRequeue);
            match disposition {
                Disposition::Ack => {
                    acked.fetch_add(1, Ordering::Relaxed);
                }
                Disposition::NackRequeue => {
                    nacked.fetch_add(1, Ordering::Relaxed);
                    debug!("message rejected, requeueing for redelivery");
                    let _ = requeue_tx.send(requeue_body);
                }
            }
        });

        Some(Delivery {
            body,
            outcome: Some(outcome_tx),
        })
    }
}
