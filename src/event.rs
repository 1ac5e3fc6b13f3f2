//! Classification events
//!
//! Typed event format shared by the consumer, aggregator and broadcaster.
//! Raw queue messages are converted at the boundary; unknown fields are
//! dropped rather than threaded through untyped maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity buckets for classified traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
        }
    }
}

/// Closed set of classification outcomes produced by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "Probe")]
    Probe,
    #[serde(rename = "Dos")]
    Dos,
    #[serde(rename = "U2R")]
    U2r,
    #[serde(rename = "R2L")]
    R2l,
}

impl Label {
    /// Severity bucket for this label. `normal` maps to no bucket.
    pub fn severity(&self) -> Option<Severity> {
        match self {
            Label::Normal => None,
            Label::Probe => Some(Severity::Low),
            Label::Dos => Some(Severity::Medium),
            Label::U2r | Label::R2l => Some(Severity::High),
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, Label::Normal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Normal => "normal",
            Label::Probe => "Probe",
            Label::Dos => "Dos",
            Label::U2r => "U2R",
            Label::R2l => "R2L",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Packet fields pre-computed by the capture side and carried in the
/// message's `additional_data` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketInfo {
    /// Seconds since epoch, sub-second precision preserved for formatting
    pub timestamp: f64,
    pub ipsrc: String,
    pub ipdst: String,
    #[serde(default)]
    pub sport: u16,
    #[serde(default)]
    pub dport: u16,
    pub protocol_type: String,
    pub service: String,
    pub flag: String,
    /// IP total length in bytes
    pub len: u64,
    #[serde(default)]
    pub ttl: u8,
    #[serde(default)]
    pub chksum: u32,
    #[serde(default)]
    pub chksum_transport: u32,
}

impl PacketInfo {
    /// Human-readable timestamp matching the dashboard format
    pub fn formatted_timestamp(&self) -> String {
        let secs = self.timestamp.trunc() as i64;
        let micros = ((self.timestamp.fract()) * 1_000_000.0).round() as u32;
        DateTime::<Utc>::from_timestamp(secs, micros * 1_000)
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d, %H:%M:%S%.6f")
            .to_string()
    }

    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        let secs = self.timestamp.trunc() as i64;
        let nanos = ((self.timestamp.fract()) * 1e9) as u32;
        DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_else(Utc::now)
    }
}

/// Feature map handed to the external classifier, opaque to the core
pub type FeatureRecord = serde_json::Map<String, serde_json::Value>;

/// A raw queue message: the classifier's feature map plus the typed
/// packet fields. Extra fields in the body are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub additional_data: PacketInfo,
    #[serde(flatten)]
    pub features: FeatureRecord,
}

impl RawEvent {
    /// Parse a message body. Any malformed or field-incomplete body is an
    /// error; the surrounding batch is rejected as a whole.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// One packet enriched with its predicted label and confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationEvent {
    #[serde(flatten)]
    pub packet: PacketInfo,
    pub predicted_class: Label,
    /// Model confidence in [0, 1]; 0 for normal or auto-normal events
    pub confidence: f32,
    pub formatted_timestamp: String,
}

impl ClassificationEvent {
    /// Merge a raw event's packet fields with a classifier prediction
    pub fn merge(raw: RawEvent, predicted_class: Label, confidence: f32) -> Self {
        let packet = raw.additional_data;
        let formatted_timestamp = packet.formatted_timestamp();
        Self {
            packet,
            predicted_class,
            confidence,
            formatted_timestamp,
        }
    }

    pub fn is_normal(&self) -> bool {
        self.predicted_class.is_normal()
    }

    pub fn severity(&self) -> Option<Severity> {
        self.predicted_class.severity()
    }
}
