//! Import command for loading JSONL lifecycle events into the local `SQLite` store.

use std::io::BufRead;

use anyhow::{Context, Result};
use chrono::DateTime;
use serde::Deserialize;

use ut_core::{LifecycleEvent, LifecycleKind};
use ut_db::{Database, EventRecord};

pub fn run<R: BufRead>(db: &mut Database, reader: R) -> Result<usize> {
    let events = parse_events(reader)?;
    let inserted = db.insert_events(&events)?;
    tracing::info!(read = events.len(), inserted, "imported events");
    Ok(inserted)
}

pub fn parse_events<R: BufRead>(reader: R) -> Result<Vec<EventRecord>> {
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let parsed: ImportEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON on line {}", idx + 1))?;
        let record = parsed
            .into_record()
            .with_context(|| format!("invalid event on line {}", idx + 1))?;
        events.push(record);
    }
    Ok(events)
}

#[derive(Debug, Deserialize)]
struct ImportEvent {
    #[serde(default)]
    id: Option<String>,
    timestamp: Timestamp,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    component_id: Option<String>,
}

/// Either epoch milliseconds or an RFC 3339 string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Timestamp {
    Millis(i64),
    Text(String),
}

impl Timestamp {
    fn to_millis(&self) -> Result<i64> {
        match self {
            Self::Millis(ms) => Ok(*ms),
            Self::Text(text) => {
                if let Ok(ms) = text.trim().parse::<i64>() {
                    return Ok(ms);
                }
                let dt = DateTime::parse_from_rfc3339(text.trim())
                    .with_context(|| format!("invalid timestamp: {text}"))?;
                Ok(dt.timestamp_millis())
            }
        }
    }
}

impl ImportEvent {
    fn into_record(self) -> Result<EventRecord> {
        let kind: LifecycleKind = self.kind.parse()?;
        let timestamp_ms = self.timestamp.to_millis()?;
        let event = if kind.is_system_wide() {
            LifecycleEvent {
                entity_id: String::new(),
                component_id: None,
                timestamp_ms,
                kind,
            }
        } else {
            LifecycleEvent {
                entity_id: self.entity_id.unwrap_or_default(),
                component_id: self.component_id,
                timestamp_ms,
                kind,
            }
        };
        event.validate()?;

        let mut record = EventRecord::from_event(&event);
        if let Some(id) = self.id.filter(|id| !id.trim().is_empty()) {
            record.id = id;
        }
        Ok(record)
    }
}
