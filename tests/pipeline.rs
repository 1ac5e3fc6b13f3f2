//! End-to-end pipeline tests: in-memory queue through the consumer,
//! classifier, aggregator, broadcaster and store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use netwarden::broadcast::{ObserverConnection, SubscriptionClass};
use netwarden::classify::{Classifier, Prediction};
use netwarden::config::Config;
use netwarden::event::{FeatureRecord, Label};
use netwarden::queue::{MemoryQueue, MessageSource};
use netwarden::store::sqlite::SqliteStore;
use netwarden::store::StatisticsStore;
use netwarden::Engine;

const HOST: &str = "192.168.1.1";

struct ScriptedClassifier {
    labels: Vec<Label>,
    fail: bool,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    fn with_labels(labels: Vec<Label>) -> Arc<Self> {
        Arc::new(Self {
            labels,
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            labels: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, batch: &[FeatureRecord]) -> anyhow::Result<Vec<Prediction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("inference backend unavailable");
        }
        Ok(batch
            .iter()
            .enumerate()
            .map(|(i, _)| Prediction {
                predicted_class: *self.labels.get(i).unwrap_or(&Label::Normal),
                confidence: 0.9,
            })
            .collect())
    }
}

struct RecordingObserver {
    received: parking_lot::Mutex<Vec<Value>>,
    fail: bool,
}

impl RecordingObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            received: parking_lot::Mutex::new(Vec::new()),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            received: parking_lot::Mutex::new(Vec::new()),
            fail: true,
        })
    }
}

#[async_trait]
impl ObserverConnection for RecordingObserver {
    async fn send(&self, payload: &Value) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("connection reset by peer");
        }
        self.received.lock().push(payload.clone());
        Ok(())
    }
}

fn message(ipsrc: &str, ipdst: &str, dport: u16, len: u64) -> Vec<u8> {
    json!({
        "duration": 0,
        "src_bytes": len,
        "additional_data": {
            "timestamp": 1718000000.0,
            "ipsrc": ipsrc,
            "ipdst": ipdst,
            "sport": 40000,
            "dport": dport,
            "protocol_type": "tcp",
            "service": "http",
            "flag": "SF",
            "len": len,
            "ttl": 64,
            "chksum": 0,
            "chksum_transport": 0
        }
    })
    .to_string()
    .into_bytes()
}

fn engine(classifier: Arc<dyn Classifier>, flush_threshold: u64) -> Engine {
    let mut config = Config::default();
    config.general.monitored_host = HOST.to_string();
    config.stats.flush_threshold = flush_threshold;
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    Engine::with_parts(config, store, classifier)
}

#[tokio::test]
async fn full_batch_flows_through_pipeline() {
    let mut labels = vec![Label::Normal; 10];
    labels[0] = Label::Dos;
    labels[3] = Label::Probe;
    let classifier = ScriptedClassifier::with_labels(labels);
    let engine = engine(classifier.clone(), 75);

    let alerts = RecordingObserver::new();
    engine
        .broadcaster
        .register(alerts.clone(), SubscriptionClass::AlertsOnly)
        .await;

    let queue = MemoryQueue::new();
    for i in 0..10u64 {
        queue.publish(message(&format!("10.0.0.{}", i + 2), HOST, 80, 100 + i));
    }
    let consumer = engine.consumer(queue.clone() as Arc<dyn MessageSource>);
    let worker = tokio::spawn(consumer.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    worker.abort();

    // One inference call covered the whole batch
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats.total_events(), 10);

    let snap = engine.stats.snapshot();
    assert_eq!(snap.med_count, 1);
    assert_eq!(snap.low_count, 1);
    assert_eq!(snap.attack_type_count["Dos"], 1);
    assert_eq!(snap.attack_type_count["Probe"], 1);

    // Both non-normal events were pushed to the alert observer
    let received = alerts.received.lock();
    assert_eq!(received.len(), 2);
    let classes: Vec<&str> = received
        .iter()
        .map(|v| v["predicted_class"].as_str().unwrap())
        .collect();
    assert!(classes.contains(&"Dos"));
    assert!(classes.contains(&"Probe"));

    assert_eq!(queue.acked(), 10);
    assert_eq!(queue.nacked(), 0);
}

#[tokio::test]
async fn traffic_not_destined_to_host_is_auto_normal() {
    let classifier = ScriptedClassifier::with_labels(vec![Label::Dos]);
    let engine = engine(classifier.clone(), 75);

    let queue = MemoryQueue::new();
    queue.publish(message("10.0.0.5", HOST, 80, 500));
    queue.publish(message("10.0.0.5", "10.0.0.99", 80, 300));

    let consumer = engine.consumer(queue.clone() as Arc<dyn MessageSource>);
    let worker = tokio::spawn(consumer.run());
    tokio::time::sleep(Duration::from_millis(1200)).await;
    worker.abort();

    // Distributions count both events, attack attribution only the
    // classified one
    let snap = engine.stats.snapshot();
    assert_eq!(snap.protocols_count["tcp"], 2);
    assert_eq!(snap.med_count, 1);
    assert_eq!(snap.attack_type_count.len(), 1);
    assert_eq!(engine.stats.total_events(), 2);
}

#[tokio::test]
async fn classifier_failure_requeues_batch_without_side_effects() {
    let classifier = ScriptedClassifier::failing();
    let engine = engine(classifier, 75);

    let alerts = RecordingObserver::new();
    engine
        .broadcaster
        .register(alerts.clone(), SubscriptionClass::AlertsOnly)
        .await;

    let queue = MemoryQueue::new();
    for _ in 0..10 {
        queue.publish(message("10.0.0.5", HOST, 80, 100));
    }
    let consumer = engine.consumer(queue.clone() as Arc<dyn MessageSource>);
    let worker = tokio::spawn(consumer.run());
    tokio::time::sleep(Duration::from_millis(200)).await;
    worker.abort();

    // No aggregator mutation, no alerts, nothing acknowledged
    assert_eq!(engine.stats.total_events(), 0);
    assert!(alerts.received.lock().is_empty());
    assert_eq!(queue.acked(), 0);
    assert!(queue.nacked() >= 10);
}

#[tokio::test]
async fn failing_observer_does_not_disturb_others() {
    let classifier = ScriptedClassifier::with_labels(vec![Label::Dos]);
    let engine = engine(classifier, 75);

    let good = RecordingObserver::new();
    engine
        .broadcaster
        .register(good.clone(), SubscriptionClass::AlertsOnly)
        .await;
    engine
        .broadcaster
        .register(RecordingObserver::failing(), SubscriptionClass::AlertsOnly)
        .await;

    let queue = MemoryQueue::new();
    queue.publish(message("10.0.0.5", HOST, 80, 500));
    let consumer = engine.consumer(queue.clone() as Arc<dyn MessageSource>);
    let worker = tokio::spawn(consumer.run());
    tokio::time::sleep(Duration::from_millis(1200)).await;
    worker.abort();

    assert_eq!(good.received.lock().len(), 1);
    assert_eq!(
        engine
            .broadcaster
            .connection_count(SubscriptionClass::AlertsOnly)
            .await,
        1
    );
    // The batch still completed despite the broken connection
    assert_eq!(queue.acked(), 1);
}

#[tokio::test]
async fn periodic_broadcast_follows_registrations() {
    let engine = engine(ScriptedClassifier::with_labels(Vec::new()), 75);

    assert!(!engine.broadcaster.periodic_task_running().await);
    let traffic = RecordingObserver::new();
    let id = engine
        .broadcaster
        .register(traffic.clone(), SubscriptionClass::AllTraffic)
        .await;
    assert!(engine.broadcaster.periodic_task_running().await);

    engine.broadcaster.deregister(id).await;
    assert!(!engine.broadcaster.periodic_task_running().await);
}

#[tokio::test]
async fn flush_threshold_persists_and_resets_window() {
    let classifier = ScriptedClassifier::with_labels(vec![Label::Dos; 10]);
    let engine = engine(classifier, 10);

    let queue = MemoryQueue::new();
    for _ in 0..10 {
        queue.publish(message("10.0.0.5", HOST, 80, 100));
    }
    let consumer = engine.consumer(queue.clone() as Arc<dyn MessageSource>);
    let worker = tokio::spawn(consumer.run());
    tokio::time::sleep(Duration::from_millis(300)).await;
    worker.abort();

    // The window drained into the store
    assert_eq!(engine.stats.events_since_flush(), 0);
    let doc = engine.store.cumulative_statistics().await.unwrap().unwrap();
    assert_eq!(doc["med_count"], 10);
    assert_eq!(doc["top_attackers"]["10.0.0.5"], 10);

    let events = engine
        .store
        .recent_events(chrono::DateTime::from_timestamp(0, 0).unwrap())
        .await
        .unwrap();
    assert_eq!(events.len(), 10);
}
