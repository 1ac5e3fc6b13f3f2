//! Rolling network statistics
//!
//! Accumulates severity tallies, byte totals, distribution counters and
//! top-K rankings from the classification event stream. The window covers
//! the interval since the last flush; `flush_and_reset` reads and clears it
//! in one critical section so no event is lost or double-counted across a
//! flush boundary.

pub mod topk;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::event::{ClassificationEvent, Severity};
use topk::TopKTracker;

/// Entries kept per top-K ranking in snapshots
pub const TOP_K: usize = 10;

/// Default number of events between persistence flushes
pub const DEFAULT_FLUSH_THRESHOLD: u64 = 75;

/// Mutable accumulator for the interval since the last flush
#[derive(Debug)]
struct AggregationWindow {
    low_count: u64,
    med_count: u64,
    high_count: u64,
    pkt_in: u64,
    pkt_out: u64,
    protocols_count: HashMap<String, u64>,
    services_count: HashMap<String, u64>,
    attack_type_count: HashMap<String, u64>,
    top_talkers: TopKTracker<String>,
    top_ports: TopKTracker<u16>,
    top_attacked_ports: TopKTracker<u16>,
    top_attackers: TopKTracker<String>,
    /// Events counted since the last flush, drives the flush threshold
    events_since_flush: u64,
    /// Non-normal events retained until the next persistence flush
    non_normal: Vec<ClassificationEvent>,
}

impl AggregationWindow {
    fn new() -> Self {
        Self {
            low_count: 0,
            med_count: 0,
            high_count: 0,
            pkt_in: 0,
            pkt_out: 0,
            protocols_count: HashMap::new(),
            services_count: HashMap::new(),
            attack_type_count: HashMap::new(),
            top_talkers: TopKTracker::new(TOP_K),
            top_ports: TopKTracker::new(TOP_K),
            top_attacked_ports: TopKTracker::new(TOP_K),
            top_attackers: TopKTracker::new(TOP_K),
            events_since_flush: 0,
            non_normal: Vec::new(),
        }
    }

    fn apply(&mut self, event: &ClassificationEvent, host: &str) {
        match event.severity() {
            Some(Severity::Low) => self.low_count += 1,
            Some(Severity::Medium) => self.med_count += 1,
            Some(Severity::High) => self.high_count += 1,
            None => {}
        }

        // Directionality is a fixed contract: pkt_in counts traffic whose
        // source is the monitored host, pkt_out traffic destined to it.
        let pkt = &event.packet;
        if pkt.ipsrc == host {
            self.pkt_in += pkt.len;
        } else if pkt.ipdst == host {
            self.pkt_out += pkt.len;
        }

        *self
            .protocols_count
            .entry(pkt.protocol_type.clone())
            .or_insert(0) += 1;
        *self.services_count.entry(pkt.service.clone()).or_insert(0) += 1;

        // Top-K attribution applies only to traffic destined to the host
        if pkt.ipdst == host {
            self.top_talkers.add(pkt.ipsrc.clone(), pkt.len);
            self.top_ports.add(pkt.dport, 1);

            if !event.is_normal() {
                self.top_attacked_ports.add(pkt.dport, 1);
                self.top_attackers.add(pkt.ipsrc.clone(), 1);
                *self
                    .attack_type_count
                    .entry(event.predicted_class.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        if !event.is_normal() {
            self.non_normal.push(event.clone());
        }

        self.events_since_flush += 1;
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            kind: "batch_update".to_string(),
            pkt_in: self.pkt_in,
            pkt_out: self.pkt_out,
            low_count: self.low_count,
            med_count: self.med_count,
            high_count: self.high_count,
            protocols_count: self.protocols_count.clone(),
            services_count: self.services_count.clone(),
            attack_type_count: self.attack_type_count.clone(),
            top_talkers: self.top_talkers.to_map(),
            top_ports: self.top_ports.to_map(),
            top_attacked_ports: self.top_attacked_ports.to_map(),
            top_attackers: self.top_attackers.to_map(),
        }
    }

    fn clear(&mut self) {
        self.low_count = 0;
        self.med_count = 0;
        self.high_count = 0;
        self.pkt_in = 0;
        self.pkt_out = 0;
        self.protocols_count.clear();
        self.services_count.clear();
        self.attack_type_count.clear();
        self.top_talkers.clear();
        self.top_ports.clear();
        self.top_attacked_ports.clear();
        self.top_attackers.clear();
        self.events_since_flush = 0;
    }
}

/// Immutable copy of the window's counters with trimmed rankings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(rename = "type")]
    pub kind: String,
    pub pkt_in: u64,
    pub pkt_out: u64,
    pub low_count: u64,
    pub med_count: u64,
    pub high_count: u64,
    pub protocols_count: HashMap<String, u64>,
    pub services_count: HashMap<String, u64>,
    pub attack_type_count: HashMap<String, u64>,
    pub top_talkers: serde_json::Map<String, serde_json::Value>,
    pub top_ports: serde_json::Map<String, serde_json::Value>,
    pub top_attacked_ports: serde_json::Map<String, serde_json::Value>,
    pub top_attackers: serde_json::Map<String, serde_json::Value>,
}

impl StatsSnapshot {
    /// True when every counter and map is zero/empty
    pub fn is_empty(&self) -> bool {
        self.pkt_in == 0
            && self.pkt_out == 0
            && self.low_count == 0
            && self.med_count == 0
            && self.high_count == 0
            && self.protocols_count.is_empty()
            && self.services_count.is_empty()
            && self.attack_type_count.is_empty()
            && self.top_talkers.is_empty()
            && self.top_ports.is_empty()
            && self.top_attacked_ports.is_empty()
            && self.top_attackers.is_empty()
    }
}

/// Thread-safe statistics service shared by the consumer, the broadcaster
/// and the API layer. Constructed once at startup and passed explicitly.
pub struct StatsAggregator {
    monitored_host: String,
    flush_threshold: u64,
    window: Mutex<AggregationWindow>,
    /// Monotone event total, never reset; lets the periodic broadcaster
    /// detect whether anything arrived since its last send
    total_events: AtomicU64,
}

impl StatsAggregator {
    pub fn new(monitored_host: impl Into<String>, flush_threshold: u64) -> Self {
        Self {
            monitored_host: monitored_host.into(),
            flush_threshold,
            window: Mutex::new(AggregationWindow::new()),
            total_events: AtomicU64::new(0),
        }
    }

    pub fn monitored_host(&self) -> &str {
        &self.monitored_host
    }

    /// Apply one event to the window
    pub fn update(&self, event: &ClassificationEvent) {
        let mut window = self.window.lock();
        window.apply(event, &self.monitored_host);
        self.total_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Apply a batch under one lock acquisition. Returns true when the
    /// flush threshold has been reached or passed.
    pub fn update_batch(&self, events: &[ClassificationEvent]) -> bool {
        let mut window = self.window.lock();
        for event in events {
            window.apply(event, &self.monitored_host);
        }
        self.total_events
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        window.events_since_flush >= self.flush_threshold
    }

    /// Immutable copy of the current window without mutating it
    pub fn snapshot(&self) -> StatsSnapshot {
        self.window.lock().snapshot()
    }

    /// Atomically snapshot the window, drain the non-normal buffer and
    /// reset all transient state. Events applied after this call land in
    /// the fresh window.
    pub fn flush_and_reset(&self) -> (StatsSnapshot, Vec<ClassificationEvent>) {
        let mut window = self.window.lock();
        let snapshot = window.snapshot();
        let non_normal = std::mem::take(&mut window.non_normal);
        window.clear();
        (snapshot, non_normal)
    }

    /// Clear the window without producing a snapshot (query-surface reset)
    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.non_normal.clear();
        window.clear();
    }

    pub fn events_since_flush(&self) -> u64 {
        self.window.lock().events_since_flush
    }

    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Label, PacketInfo};

    const HOST: &str = "192.168.1.1";

    fn event(ipsrc: &str, ipdst: &str, dport: u16, len: u64, label: Label) -> ClassificationEvent {
        let packet = PacketInfo {
            timestamp: 1718000000.0,
            ipsrc: ipsrc.to_string(),
            ipdst: ipdst.to_string(),
            sport: 54321,
            dport,
            protocol_type: "tcp".to_string(),
            service: "http".to_string(),
            flag: "SF".to_string(),
            len,
            ttl: 64,
            chksum: 0,
            chksum_transport: 0,
        };
        let formatted_timestamp = packet.formatted_timestamp();
        ClassificationEvent {
            packet,
            predicted_class: label,
            confidence: if label.is_normal() { 0.0 } else { 0.9 },
            formatted_timestamp,
        }
    }

    #[test]
    fn test_worked_example() {
        // Two inbound events, one Dos and one normal, same source and port
        let stats = StatsAggregator::new(HOST, DEFAULT_FLUSH_THRESHOLD);
        stats.update(&event("10.0.0.5", HOST, 80, 500, Label::Dos));
        stats.update(&event("10.0.0.5", HOST, 80, 300, Label::Normal));

        let snap = stats.snapshot();
        assert_eq!(snap.med_count, 1);
        assert_eq!(snap.low_count, 0);
        assert_eq!(snap.high_count, 0);
        // ipdst == host counts toward pkt_out under the fixed contract
        assert_eq!(snap.pkt_out, 800);
        assert_eq!(snap.pkt_in, 0);
        assert_eq!(snap.top_ports["80"], 2);
        assert_eq!(snap.top_attacked_ports["80"], 1);
        assert_eq!(snap.top_attackers["10.0.0.5"], 1);
        assert_eq!(snap.attack_type_count["Dos"], 1);
        assert_eq!(snap.top_talkers["10.0.0.5"], 800);
    }

    #[test]
    fn test_directionality_src_is_host() {
        let stats = StatsAggregator::new(HOST, DEFAULT_FLUSH_THRESHOLD);
        stats.update(&event(HOST, "10.0.0.5", 80, 256, Label::Normal));

        let snap = stats.snapshot();
        assert_eq!(snap.pkt_in, 256);
        assert_eq!(snap.pkt_out, 0);
        // Outbound traffic never feeds the rankings
        assert!(snap.top_talkers.is_empty());
        assert!(snap.top_ports.is_empty());
    }

    #[test]
    fn test_unrelated_traffic_counts_distributions_only() {
        let stats = StatsAggregator::new(HOST, DEFAULT_FLUSH_THRESHOLD);
        stats.update(&event("10.0.0.5", "10.0.0.6", 22, 100, Label::Probe));

        let snap = stats.snapshot();
        assert_eq!(snap.pkt_in, 0);
        assert_eq!(snap.pkt_out, 0);
        assert_eq!(snap.low_count, 1);
        assert_eq!(snap.protocols_count["tcp"], 1);
        assert_eq!(snap.services_count["http"], 1);
        assert!(snap.top_attackers.is_empty());
        assert!(snap.attack_type_count.is_empty());
    }

    #[test]
    fn test_byte_totals_additive() {
        let stats = StatsAggregator::new(HOST, DEFAULT_FLUSH_THRESHOLD);
        let mut expected = 0u64;
        for i in 0..50u64 {
            let len = 100 + i;
            expected += len;
            if i % 2 == 0 {
                stats.update(&event(HOST, "10.0.0.5", 80, len, Label::Normal));
            } else {
                stats.update(&event("10.0.0.5", HOST, 80, len, Label::Normal));
            }
        }
        let snap = stats.snapshot();
        assert_eq!(snap.pkt_in + snap.pkt_out, expected);
    }

    #[test]
    fn test_flush_and_reset_is_idempotent() {
        let stats = StatsAggregator::new(HOST, DEFAULT_FLUSH_THRESHOLD);
        stats.update(&event("10.0.0.5", HOST, 80, 500, Label::Dos));
        stats.update(&event("10.0.0.6", HOST, 443, 300, Label::Probe));

        let (snap, non_normal) = stats.flush_and_reset();
        assert_eq!(snap.med_count, 1);
        assert_eq!(snap.low_count, 1);
        assert_eq!(non_normal.len(), 2);

        let after = stats.snapshot();
        assert!(after.is_empty());
        assert_eq!(stats.events_since_flush(), 0);

        let (second, buffer) = stats.flush_and_reset();
        assert!(second.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flush_threshold_reported_by_update_batch() {
        let stats = StatsAggregator::new(HOST, 5);
        let batch: Vec<_> = (0..4)
            .map(|_| event("10.0.0.5", HOST, 80, 100, Label::Normal))
            .collect();
        assert!(!stats.update_batch(&batch));

        let more = vec![event("10.0.0.5", HOST, 80, 100, Label::Normal)];
        assert!(stats.update_batch(&more));

        stats.flush_and_reset();
        assert!(!stats.update_batch(&more));
    }

    #[test]
    fn test_snapshot_rankings_capped_and_sorted() {
        let stats = StatsAggregator::new(HOST, DEFAULT_FLUSH_THRESHOLD);
        for i in 0..30u16 {
            let src = format!("10.0.0.{}", i);
            for _ in 0..=i {
                stats.update(&event(&src, HOST, 1000 + i, 10, Label::Probe));
            }
        }

        let snap = stats.snapshot();
        assert_eq!(snap.top_attackers.len(), 10);
        assert_eq!(snap.top_ports.len(), 10);

        let counts: Vec<u64> = snap
            .top_attackers
            .values()
            .map(|v| v.as_u64().unwrap())
            .collect();
        let mut sorted = counts.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(counts, sorted);
        assert_eq!(counts[0], 30);
    }

    #[test]
    fn test_total_events_is_monotone() {
        let stats = StatsAggregator::new(HOST, 2);
        stats.update(&event("10.0.0.5", HOST, 80, 10, Label::Normal));
        stats.flush_and_reset();
        stats.update(&event("10.0.0.5", HOST, 80, 10, Label::Normal));
        assert_eq!(stats.total_events(), 2);
    }
}
