//! Storage layer for the usage tracker.
//!
//! Provides persistence for lifecycle events, the entity registry, hour
//! buckets and the sync checkpoint using `rusqlite`. [`Database`] is both the
//! [`EventSource`] and the [`AggregateStore`] the sync coordinator runs
//! against.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! This means a `Database` instance can be moved between threads but cannot be shared
//! across threads without external synchronization.
//!
//! For multi-threaded access, either:
//! - Use a `Mutex<Database>` to serialize access
//! - Use separate `Database` instances per thread
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Event times, bucket starts and the checkpoint are INTEGER epoch
//! milliseconds (UTC) so range queries and bucket arithmetic stay numeric.
//! Bookkeeping columns (`created_at`, `updated_at`, `started_at`) are TEXT in
//! RFC 3339 format with millisecond precision.
//!
//! ## Buckets
//!
//! `usage_buckets` is keyed by `(entity_id, bucket_start_ms)`. Sync passes
//! overwrite rows rather than adding to them, so a row always holds the
//! most recent full recomputation of its hour.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;
use uuid::Uuid;

use ut_core::{
    AggregateStore, BucketAggregate, EventSource, LifecycleEvent, LifecycleKind, SyncError,
    SyncResult,
};

/// Key of the checkpoint row in `sync_state`.
const CHECKPOINT_KEY: &str = "last_sync_ms";

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// An event could not be stored.
    #[error("invalid event {event_id}: {message}")]
    InvalidEvent { event_id: String, message: String },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// A raw lifecycle event as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub id: String,
    pub timestamp_ms: i64,
    pub kind: String,
    pub entity_id: Option<String>,
    pub component_id: Option<String>,
}

impl EventRecord {
    /// Builds a record with a deterministic ID, so recording the same
    /// transition twice is a no-op.
    pub fn from_event(event: &LifecycleEvent) -> Self {
        let entity_id = Some(event.entity_id.clone()).filter(|id| !id.is_empty());
        let id = format!(
            "{}:{}:{}:{}",
            event.kind,
            event.timestamp_ms,
            entity_id.as_deref().unwrap_or(""),
            event.component_id.as_deref().unwrap_or(""),
        );
        Self {
            id,
            timestamp_ms: event.timestamp_ms,
            kind: event.kind.as_str().to_string(),
            entity_id,
            component_id: event.component_id.clone(),
        }
    }

    /// Converts to a domain event; `None` if the kind is not recognized.
    pub fn to_event(&self) -> Option<LifecycleEvent> {
        let kind: LifecycleKind = self.kind.parse().ok()?;
        Some(LifecycleEvent {
            entity_id: self.entity_id.clone().unwrap_or_default(),
            component_id: self.component_id.clone(),
            timestamp_ms: self.timestamp_ms,
            kind,
        })
    }
}

/// Outcome label of a recorded sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Succeeded,
    Partial,
    Aborted,
}

impl SyncOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Partial => "partial",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit row describing one sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRunRecord {
    pub id: String,
    pub started_at: String,
    pub window_start_ms: Option<i64>,
    pub window_end_ms: i64,
    pub buckets_written: i64,
    pub buckets_skipped: i64,
    pub malformed_events: i64,
    pub outcome: String,
    pub error: Option<String>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            -- Raw lifecycle transitions
            -- entity_id/component_id are NULL for system-wide kinds
            -- seq is the recording order; it breaks ties within a millisecond
            CREATE TABLE IF NOT EXISTS lifecycle_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp_ms INTEGER NOT NULL,
                kind TEXT NOT NULL,
                entity_id TEXT,
                component_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_lifecycle_events_timestamp
                ON lifecycle_events(timestamp_ms);
            CREATE INDEX IF NOT EXISTS idx_lifecycle_events_pair
                ON lifecycle_events(entity_id, component_id, timestamp_ms);

            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS usage_buckets (
                entity_id TEXT NOT NULL,
                bucket_start_ms INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                occurrence_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (entity_id, bucket_start_ms)
            );

            CREATE INDEX IF NOT EXISTS idx_usage_buckets_start
                ON usage_buckets(bucket_start_ms);

            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_runs (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                window_start_ms INTEGER,
                window_end_ms INTEGER NOT NULL,
                buckets_written INTEGER NOT NULL DEFAULT 0,
                buckets_skipped INTEGER NOT NULL DEFAULT 0,
                malformed_events INTEGER NOT NULL DEFAULT 0,
                outcome TEXT NOT NULL,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_sync_runs_started ON sync_runs(started_at);
            ",
        )?;
        Ok(())
    }

    /// Inserts a batch of events, ignoring duplicates by ID.
    pub fn insert_events(&mut self, events: &[EventRecord]) -> Result<usize, DbError> {
        if events.is_empty() {
            return Ok(0);
        }
        for event in events {
            validate_record(event)?;
        }
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO lifecycle_events
                (id, timestamp_ms, kind, entity_id, component_id)
                VALUES (?, ?, ?, ?, ?)
                ",
            )?;
            for event in events {
                inserted += stmt.execute(params![
                    event.id,
                    event.timestamp_ms,
                    event.kind,
                    event.entity_id,
                    event.component_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Lists events within a time range, ordered by timestamp then by the
    /// order they were recorded.
    ///
    /// The range is inclusive of `start_ms` and exclusive of `end_ms`.
    pub fn list_events_in_range(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<EventRecord>, DbError> {
        if end_ms <= start_ms {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "
            SELECT id, timestamp_ms, kind, entity_id, component_id
            FROM lifecycle_events
            WHERE timestamp_ms >= ? AND timestamp_ms < ?
            ORDER BY timestamp_ms ASC, seq ASC
            ",
        )?;
        let rows = stmt.query_map([start_ms, end_ms], event_from_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Total number of stored events.
    pub fn event_count(&self) -> Result<i64, DbError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM lifecycle_events", [], |row| row.get(0))?)
    }

    /// Total number of registered entities.
    pub fn entity_count(&self) -> Result<i64, DbError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?)
    }

    /// Records the outcome of a sync pass and returns the run ID.
    pub fn record_sync_run(
        &self,
        started_at: DateTime<Utc>,
        now_ms: i64,
        outcome: &Result<SyncResult, SyncError>,
    ) -> Result<String, DbError> {
        let id = Uuid::new_v4().to_string();
        let (label, window_start_ms, written, skipped, malformed, error) = match outcome {
            Ok(result) => (
                if result.buckets_skipped == 0 {
                    SyncOutcome::Succeeded
                } else {
                    SyncOutcome::Partial
                },
                Some(result.window_start_ms),
                result.buckets_written,
                result.buckets_skipped,
                result.malformed_events,
                None,
            ),
            Err(e) => (SyncOutcome::Aborted, None, 0, 0, 0, Some(e.to_string())),
        };
        self.conn.execute(
            "
            INSERT INTO sync_runs
            (id, started_at, window_start_ms, window_end_ms, buckets_written,
             buckets_skipped, malformed_events, outcome, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                id,
                format_timestamp(started_at),
                window_start_ms,
                now_ms,
                to_i64(written),
                to_i64(skipped),
                to_i64(malformed),
                label.as_str(),
                error,
            ],
        )?;
        Ok(id)
    }

    /// Returns the most recently started sync run.
    pub fn last_sync_run(&self) -> Result<Option<SyncRunRecord>, DbError> {
        Ok(self
            .conn
            .query_row(
                "
                SELECT id, started_at, window_start_ms, window_end_ms, buckets_written,
                       buckets_skipped, malformed_events, outcome, error
                FROM sync_runs
                ORDER BY started_at DESC, rowid DESC
                LIMIT 1
                ",
                [],
                |row| {
                    Ok(SyncRunRecord {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        window_start_ms: row.get(2)?,
                        window_end_ms: row.get(3)?,
                        buckets_written: row.get(4)?,
                        buckets_skipped: row.get(5)?,
                        malformed_events: row.get(6)?,
                        outcome: row.get(7)?,
                        error: row.get(8)?,
                    })
                },
            )
            .optional()?)
    }

    fn query_bucket_rows(
        &self,
        entity_id: Option<&str>,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<BucketAggregate>, DbError> {
        if end_ms <= start_ms {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "
            SELECT entity_id, bucket_start_ms, duration_ms, occurrence_count
            FROM usage_buckets
            WHERE bucket_start_ms >= ?1 AND bucket_start_ms < ?2
              AND (?3 IS NULL OR entity_id = ?3)
            ORDER BY bucket_start_ms ASC, entity_id ASC
            ",
        )?;
        let rows = stmt.query_map(params![start_ms, end_ms, entity_id], |row| {
            Ok(BucketAggregate {
                entity_id: row.get(0)?,
                bucket_start_ms: row.get(1)?,
                duration_ms: row.get(2)?,
                occurrence_count: row.get(3)?,
            })
        })?;
        let mut buckets = Vec::new();
        for row in rows {
            buckets.push(row?);
        }
        Ok(buckets)
    }
}

impl EventSource for Database {
    type Error = DbError;

    fn fetch_events(&self, start_ms: i64, end_ms: i64) -> Result<Vec<LifecycleEvent>, DbError> {
        let records = self.list_events_in_range(start_ms, end_ms)?;
        let mut events = Vec::with_capacity(records.len());
        for record in &records {
            match record.to_event() {
                Some(event) => events.push(event),
                None => {
                    tracing::warn!(event_id = %record.id, kind = %record.kind, "skipping event of unknown kind");
                }
            }
        }
        Ok(events)
    }

    /// An entity is live when one of its components was last activated
    /// after the most recent suspend/resume marker. Events sharing a
    /// millisecond are ordered by `seq`.
    fn live_entities_now(&self) -> Result<HashSet<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT DISTINCT e.entity_id
            FROM lifecycle_events e
            WHERE e.kind = 'entity_activated'
              AND e.entity_id IS NOT NULL
              AND e.component_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM lifecycle_events marker
                  WHERE marker.kind IN ('system_suspended', 'system_resumed')
                    AND (marker.timestamp_ms > e.timestamp_ms
                         OR (marker.timestamp_ms = e.timestamp_ms AND marker.seq > e.seq))
              )
              AND NOT EXISTS (
                  SELECT 1 FROM lifecycle_events later
                  WHERE later.entity_id = e.entity_id
                    AND later.component_id = e.component_id
                    AND later.kind IN ('entity_activated', 'entity_deactivated')
                    AND (later.timestamp_ms > e.timestamp_ms
                         OR (later.timestamp_ms = e.timestamp_ms AND later.seq > e.seq))
              )
            ",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut live = HashSet::new();
        for row in rows {
            live.insert(row?);
        }
        Ok(live)
    }
}

impl AggregateStore for Database {
    type Error = DbError;

    fn checkpoint(&self) -> Result<Option<i64>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?",
                [CHECKPOINT_KEY],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_checkpoint(&self, checkpoint_ms: i64) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO sync_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
            params![CHECKPOINT_KEY, checkpoint_ms],
        )?;
        Ok(())
    }

    fn upsert_bucket(
        &self,
        entity_id: &str,
        bucket_start_ms: i64,
        duration_ms: i64,
        occurrence_count: i64,
    ) -> Result<(), DbError> {
        self.conn.execute(
            "
            INSERT INTO usage_buckets
            (entity_id, bucket_start_ms, duration_ms, occurrence_count, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity_id, bucket_start_ms) DO UPDATE SET
                duration_ms = excluded.duration_ms,
                occurrence_count = excluded.occurrence_count,
                updated_at = excluded.updated_at
            ",
            params![
                entity_id,
                bucket_start_ms,
                duration_ms,
                occurrence_count,
                format_timestamp(Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn query_buckets(&self, start_ms: i64, end_ms: i64) -> Result<Vec<BucketAggregate>, DbError> {
        self.query_bucket_rows(None, start_ms, end_ms)
    }

    fn query_buckets_for_entity(
        &self,
        entity_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<BucketAggregate>, DbError> {
        self.query_bucket_rows(Some(entity_id), start_ms, end_ms)
    }

    fn find_entity(&self, entity_id: &str) -> Result<Option<i64>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM entities WHERE entity_id = ?",
                [entity_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn ensure_entity(&self, entity_id: &str, display_name: &str) -> Result<i64, DbError> {
        self.conn.execute(
            "
            INSERT OR IGNORE INTO entities (entity_id, display_name, created_at)
            VALUES (?, ?, ?)
            ",
            params![entity_id, display_name, format_timestamp(Utc::now())],
        )?;
        Ok(self.conn.query_row(
            "SELECT id FROM entities WHERE entity_id = ?",
            [entity_id],
            |row| row.get(0),
        )?)
    }

    fn display_names(&self) -> Result<HashMap<String, String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_id, display_name FROM entities")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut names = HashMap::new();
        for row in rows {
            let (entity_id, display_name): (String, String) = row?;
            names.insert(entity_id, display_name);
        }
        Ok(names)
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        timestamp_ms: row.get(1)?,
        kind: row.get(2)?,
        entity_id: row.get(3)?,
        component_id: row.get(4)?,
    })
}

fn validate_record(event: &EventRecord) -> Result<(), DbError> {
    let invalid = |message: &str| DbError::InvalidEvent {
        event_id: event.id.clone(),
        message: message.to_string(),
    };
    if event.id.trim().is_empty() {
        return Err(invalid("missing id"));
    }
    if event.kind.trim().is_empty() {
        return Err(invalid("missing kind"));
    }
    Ok(())
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
