//! Fan-out of classified events and periodic statistics to observers
//!
//! Two subscription classes exist: alert observers receive every
//! non-normal event as it is classified, and all-traffic observers
//! receive an aggregated snapshot on a fixed interval. A misbehaving
//! observer is dropped from the registry without disturbing the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::ClassificationEvent;
use crate::stats::StatsAggregator;

/// What a registered observer wants to receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionClass {
    /// Only individual non-normal events
    AlertsOnly,
    /// Periodic aggregated snapshots of all traffic
    AllTraffic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// An observer endpoint the broadcaster can push JSON payloads to.
/// Implementations wrap a websocket, a channel, or a test recorder.
#[async_trait]
pub trait ObserverConnection: Send + Sync {
    async fn send(&self, payload: &Value) -> anyhow::Result<()>;
}

struct Registered {
    conn: Arc<dyn ObserverConnection>,
    class: SubscriptionClass,
    state: ConnectionState,
}

/// Connection registry plus the periodic snapshot task.
///
/// The periodic task starts when the first all-traffic observer
/// registers and stops when the last one leaves. It holds only a weak
/// reference to the broadcaster so it cannot keep the engine alive.
pub struct Broadcaster {
    stats: Arc<StatsAggregator>,
    interval: Duration,
    connections: RwLock<HashMap<Uuid, Registered>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    last_sent_total: AtomicU64,
    /// Self-reference handed to the periodic task
    weak: Weak<Broadcaster>,
}

impl Broadcaster {
    pub fn new(stats: Arc<StatsAggregator>, interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            stats,
            interval,
            connections: RwLock::new(HashMap::new()),
            periodic: Mutex::new(None),
            last_sent_total: AtomicU64::new(0),
            weak: weak.clone(),
        })
    }

    /// Register an observer and return its connection id
    pub async fn register(
        &self,
        conn: Arc<dyn ObserverConnection>,
        class: SubscriptionClass,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.connections.write().await.insert(
            id,
            Registered {
                conn,
                class,
                state: ConnectionState::Open,
            },
        );
        debug!(%id, ?class, "observer registered");

        if class == SubscriptionClass::AllTraffic {
            self.ensure_periodic_task().await;
        }
        id
    }

    /// Remove an observer. Stops the periodic task when the last
    /// all-traffic observer is gone.
    pub async fn deregister(&self, id: Uuid) {
        let remaining = {
            let mut conns = self.connections.write().await;
            conns.remove(&id);
            conns
                .values()
                .filter(|r| r.class == SubscriptionClass::AllTraffic)
                .count()
        };
        debug!(%id, "observer deregistered");

        if remaining == 0 {
            let mut slot = self.periodic.lock().await;
            if let Some(handle) = slot.take() {
                handle.abort();
                debug!("periodic broadcast task stopped");
            }
        }
    }

    async fn ensure_periodic_task(&self) {
        let mut slot = self.periodic.lock().await;
        if slot.is_some() {
            return;
        }
        let weak = self.weak.clone();
        let interval = self.interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(broadcaster) = weak.upgrade() else {
                    break;
                };
                broadcaster.broadcast_snapshot().await;
            }
        }));
        debug!("periodic broadcast task started");
    }

    /// Whether the periodic snapshot task is currently running
    pub async fn periodic_task_running(&self) -> bool {
        self.periodic.lock().await.is_some()
    }

    pub async fn connection_count(&self, class: SubscriptionClass) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|r| r.class == class)
            .count()
    }

    /// Push one non-normal event to every alert observer. Failures close
    /// and remove the offending connection; they never propagate.
    pub async fn publish_alert(&self, event: &ClassificationEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to serialize alert payload");
                return;
            }
        };
        self.send_to_class(SubscriptionClass::AlertsOnly, payload)
            .await;
    }

    /// Send the current aggregation snapshot to every all-traffic
    /// observer, skipping the tick entirely when nothing new has been
    /// ingested since the last send.
    pub async fn broadcast_snapshot(&self) {
        let total = self.stats.total_events();
        if total == self.last_sent_total.load(Ordering::Acquire) {
            return;
        }

        let snapshot = self.stats.snapshot();
        let payload = match serde_json::to_value(&snapshot) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to serialize statistics snapshot");
                return;
            }
        };
        self.last_sent_total.store(total, Ordering::Release);
        self.send_to_class(SubscriptionClass::AllTraffic, payload)
            .await;
    }

    async fn send_to_class(&self, class: SubscriptionClass, payload: Value) {
        let targets: Vec<(Uuid, Arc<dyn ObserverConnection>)> = {
            let conns = self.connections.read().await;
            conns
                .iter()
                .filter(|(_, r)| r.class == class && r.state == ConnectionState::Open)
                .map(|(id, r)| (*id, Arc::clone(&r.conn)))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let payload = Arc::new(payload);
        let mut handles = Vec::with_capacity(targets.len());
        for (id, conn) in targets {
            let payload = Arc::clone(&payload);
            handles.push(tokio::spawn(async move {
                (id, conn.send(&payload).await)
            }));
        }

        let mut failed = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    warn!(%id, error = %e, "observer send failed, closing connection");
                    failed.push(id);
                }
                Err(e) => {
                    warn!(error = %e, "observer send task panicked");
                }
            }
        }

        if !failed.is_empty() {
            let remaining = {
                let mut conns = self.connections.write().await;
                for id in failed {
                    if let Some(reg) = conns.get_mut(&id) {
                        reg.state = ConnectionState::Closed;
                    }
                    conns.remove(&id);
                }
                conns
                    .values()
                    .filter(|r| r.class == SubscriptionClass::AllTraffic)
                    .count()
            };
            // A dropped connection may have been the last all-traffic one
            if remaining == 0 {
                let mut slot = self.periodic.lock().await;
                if let Some(handle) = slot.take() {
                    handle.abort();
                    debug!("periodic broadcast task stopped");
                }
            }
        }
    }
}
