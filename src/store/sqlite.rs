//! SQLite-backed statistics store
//!
//! Keeps the cumulative statistics document as a JSON blob under a fixed
//! id and non-normal events in an append-only table indexed by their
//! packet timestamp. The additive merge runs inside a transaction so a
//! crash mid-flush never leaves a half-applied document.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};

use super::{escape_key, unescape_key, StatisticsStore, STATS_DOC_ID};
use crate::event::ClassificationEvent;
use crate::stats::StatsSnapshot;

const COUNTER_FIELDS: [&str; 5] = ["pkt_in", "pkt_out", "low_count", "med_count", "high_count"];
const MAP_FIELDS: [&str; 7] = [
    "protocols_count",
    "services_count",
    "attack_type_count",
    "top_talkers",
    "top_ports",
    "top_attacked_ports",
    "top_attackers",
];

/// Thread-safe store wrapper
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open store: {}", path.as_ref().display()))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS statistics (
                id TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                last_updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp REAL NOT NULL,
                predicted_class TEXT NOT NULL,
                doc TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
            "#,
        )?;
        Ok(())
    }
}

/// Add `amount` to a numeric field, creating it at zero if absent
fn merge_counter(doc: &mut Map<String, Value>, field: &str, amount: u64) {
    let current = doc.get(field).and_then(Value::as_u64).unwrap_or(0);
    doc.insert(field.to_string(), json!(current + amount));
}

/// Increment per-key counts inside a nested map field, escaping keys
fn merge_map<'a, I>(doc: &mut Map<String, Value>, field: &str, entries: I)
where
    I: IntoIterator<Item = (&'a String, u64)>,
{
    let nested = doc
        .entry(field.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(nested) = nested.as_object_mut() else {
        return;
    };
    for (key, amount) in entries {
        let key = escape_key(key);
        let current = nested.get(&key).and_then(Value::as_u64).unwrap_or(0);
        nested.insert(key, json!(current + amount));
    }
}

/// Apply one flushed snapshot delta to the cumulative document
fn apply_delta(doc: &mut Map<String, Value>, delta: &StatsSnapshot) {
    doc.insert("type".to_string(), json!("batch_update"));

    let delta = match serde_json::to_value(delta) {
        Ok(Value::Object(map)) => map,
        _ => return,
    };
    for field in COUNTER_FIELDS {
        let amount = delta.get(field).and_then(Value::as_u64).unwrap_or(0);
        merge_counter(doc, field, amount);
    }
    for field in MAP_FIELDS {
        let Some(Value::Object(entries)) = delta.get(field) else {
            continue;
        };
        merge_map(
            doc,
            field,
            entries
                .iter()
                .map(|(k, v)| (k, v.as_u64().unwrap_or(0))),
        );
    }
}

/// Undo the key escaping inside every nested map field
fn unescape_doc(doc: &mut Map<String, Value>) {
    for field in MAP_FIELDS {
        let Some(Value::Object(entries)) = doc.get_mut(field) else {
            continue;
        };
        *entries = entries
            .iter()
            .map(|(k, v)| (unescape_key(k), v.clone()))
            .collect();
    }
}

#[async_trait]
impl StatisticsStore for SqliteStore {
    async fn merge_statistics(&self, delta: &StatsSnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT doc FROM statistics WHERE id = ?1",
                params![STATS_DOC_ID],
                |row| row.get(0),
            )
            .optional()?;

        let mut doc: Map<String, Value> = match existing {
            Some(raw) => serde_json::from_str(&raw).context("Corrupt statistics document")?,
            None => Map::new(),
        };
        apply_delta(&mut doc, delta);

        tx.execute(
            "INSERT OR REPLACE INTO statistics (id, doc, last_updated) VALUES (?1, ?2, ?3)",
            params![
                STATS_DOC_ID,
                serde_json::to_string(&Value::Object(doc))?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn insert_events(&self, events: &[ClassificationEvent]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO events (timestamp, predicted_class, doc) VALUES (?1, ?2, ?3)",
            )?;
            for event in events {
                stmt.execute(params![
                    event.packet.timestamp,
                    event.predicted_class.as_str(),
                    serde_json::to_string(event)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn recent_events(&self, since: DateTime<Utc>) -> Result<Vec<ClassificationEvent>> {
        let conn = self.conn.lock().unwrap();
        let since_secs =
            since.timestamp() as f64 + f64::from(since.timestamp_subsec_micros()) / 1_000_000.0;

        let mut stmt = conn.prepare(
            "SELECT doc FROM events WHERE timestamp >= ?1 ORDER BY timestamp DESC",
        )?;
        let rows = stmt.query_map(params![since_secs], |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for raw in rows {
            let raw = raw?;
            let event =
                serde_json::from_str(&raw).context("Corrupt event document in store")?;
            events.push(event);
        }
        Ok(events)
    }

    async fn cumulative_statistics(&self) -> Result<Option<Value>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT doc FROM statistics WHERE id = ?1",
                params![STATS_DOC_ID],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => {
                let mut doc: Map<String, Value> =
                    serde_json::from_str(&raw).context("Corrupt statistics document")?;
                unescape_doc(&mut doc);
                Ok(Some(Value::Object(doc)))
            }
            None => Ok(None),
        }
    }
}
