//! Memory Store — append-only episodic memory with integrity verification.
//!
//! Persists [`MemoryEvent`] rows to a local SQLite database. Every write is
//! followed by a read-back of the inserted row so callers (notably the
//! affective self-regulator's cognitive actions) can detect partial
//! failures immediately rather than discovering them on the next restart.
//!
//! # Storage layout
//!
//! A single table `memory_events` is created (if it does not already
//! exist) with the following columns:
//!
//! | column          | type    | description                               |
//! |-----------------|---------|-------------------------------------------|
//! | id              | INTEGER | autoincrement primary key                 |
//! | timestamp       | TEXT    | RFC-3339 creation time (UTC)              |
//! | event_type      | TEXT    | event type label                          |
//! | content         | TEXT    | free-text event content                   |
//! | metadata        | TEXT    | JSON-encoded metadata object               |
//! | conversation_id | TEXT    | optional conversation grouping key         |
//! | confidence      | REAL    | 0..1 confidence score                      |

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use synapse_types::{MemoryErrorKind, MemoryEvent};

use std::sync::{Arc, Mutex};

/// A filter applied by [`MemoryStore::get_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub conversation_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// Counts of integrity problems found by [`MemoryStore::consistency_check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub orphaned_metadata: u64,
    pub missing_timestamps: u64,
    pub invalid_event_types: u64,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_metadata == 0 && self.missing_timestamps == 0 && self.invalid_event_types == 0
    }
}

/// Event types this store recognizes as well-formed. Anything else is
/// counted by [`MemoryStore::consistency_check`] but never rejected on
/// write — the store must remain append-only even for malformed input.
const KNOWN_EVENT_TYPES: &[&str] = &[
    "observation",
    "hypothesis",
    "investigation",
    "action",
    "episodic_summary",
    "analysis",
];

/// SQLite-backed append-only memory store.
#[derive(Clone)]
pub struct MemoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl MemoryStore {
    /// Open (or create) a persistent SQLite database at `path`.
    ///
    /// Enables WAL mode so concurrent readers are never blocked by the
    /// single writer.
    pub fn open(path: &str) -> Result<Self, MemoryErrorKind> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(sqlite_err)?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, MemoryErrorKind> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), MemoryErrorKind> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_events (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp       TEXT NOT NULL,
                event_type      TEXT NOT NULL,
                content         TEXT NOT NULL,
                metadata        TEXT NOT NULL,
                conversation_id TEXT,
                confidence      REAL NOT NULL
            );",
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    /// Insert one event and return its assigned id.
    ///
    /// The row is durable on return: `spawn_blocking` completes only after
    /// the underlying `INSERT` has been executed against the connection.
    pub async fn store_event(&self, event: &MemoryEvent) -> Result<i64, MemoryErrorKind> {
        let conn = Arc::clone(&self.conn);
        let ts = event.timestamp.to_rfc3339();
        let event_type = event.event_type.clone();
        let content = event.content.clone();
        let metadata = serde_json::to_string(&event.metadata).map_err(|e| {
            MemoryErrorKind::Sqlite(format!("metadata serialization failed: {e}"))
        })?;
        let conversation_id = event.conversation_id.clone();
        let confidence = event.confidence as f64;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.execute(
                "INSERT INTO memory_events
                     (timestamp, event_type, content, metadata, conversation_id, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![ts, event_type, content, metadata, conversation_id, confidence],
            )
            .map_err(sqlite_err)?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| MemoryErrorKind::Sqlite(format!("blocking task panicked: {e}")))?
    }

    /// Store `event` and immediately read it back by id, surfacing
    /// [`MemoryErrorKind::Consistency`] if the row cannot be retrieved.
    ///
    /// Used by the self-regulator's cognitive actions to detect partial
    /// write failures rather than discovering a gap on the next restart.
    pub async fn store_and_verify(&self, event: &MemoryEvent) -> Result<MemoryEvent, MemoryErrorKind> {
        let id = self.store_event(event).await?;
        self.get_by_id(id)
            .await?
            .ok_or_else(|| MemoryErrorKind::Consistency(format!("event {id} not retrievable after write")))
    }

    /// Fetch a single event by id.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<MemoryEvent>, MemoryErrorKind> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row(
                "SELECT id, timestamp, event_type, content, metadata, conversation_id, confidence
                 FROM memory_events WHERE id = ?1",
                params![id],
                row_to_event,
            )
            .optional()
            .map_err(sqlite_err)
        })
        .await
        .map_err(|e| MemoryErrorKind::Sqlite(format!("blocking task panicked: {e}")))?
    }

    /// Query events matching `filter`, newest first, capped at `limit` rows.
    pub async fn get_events(&self, filter: EventFilter, limit: usize) -> Result<Vec<MemoryEvent>, MemoryErrorKind> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut sql = String::from(
                "SELECT id, timestamp, event_type, content, metadata, conversation_id, confidence
                 FROM memory_events WHERE 1=1",
            );
            let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(t) = &filter.event_type {
                sql.push_str(" AND event_type = ?");
                bind.push(Box::new(t.clone()));
            }
            if let Some(c) = &filter.conversation_id {
                sql.push_str(" AND conversation_id = ?");
                bind.push(Box::new(c.clone()));
            }
            if let Some(since) = &filter.since {
                sql.push_str(" AND timestamp >= ?");
                bind.push(Box::new(since.to_rfc3339()));
            }
            sql.push_str(" ORDER BY id DESC LIMIT ?");
            bind.push(Box::new(limit as i64));

            let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
            let params_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(params_refs.as_slice(), row_to_event).map_err(sqlite_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(sqlite_err)
        })
        .await
        .map_err(|e| MemoryErrorKind::Sqlite(format!("blocking task panicked: {e}")))?
    }

    /// Report integrity problems across the whole event table.
    ///
    /// Never halts the system — callers surface a non-zero report as a
    /// high-priority curiosity question rather than treating it as fatal.
    pub async fn consistency_check(&self) -> Result<ConsistencyReport, MemoryErrorKind> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());

            let missing_timestamps: u64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM memory_events WHERE timestamp IS NULL OR timestamp = ''",
                    [],
                    |r| r.get(0),
                )
                .map_err(sqlite_err)?;

            let orphaned_metadata: u64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM memory_events WHERE metadata IS NULL OR metadata = ''",
                    [],
                    |r| r.get(0),
                )
                .map_err(sqlite_err)?;

            let placeholders = KNOWN_EVENT_TYPES
                .iter()
                .map(|_| "?")
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT COUNT(*) FROM memory_events WHERE event_type NOT IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
            let bind: Vec<&dyn rusqlite::ToSql> =
                KNOWN_EVENT_TYPES.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
            let invalid_event_types: u64 = stmt.query_row(bind.as_slice(), |r| r.get(0)).map_err(sqlite_err)?;

            Ok(ConsistencyReport {
                orphaned_metadata,
                missing_timestamps,
                invalid_event_types,
            })
        })
        .await
        .map_err(|e| MemoryErrorKind::Sqlite(format!("blocking task panicked: {e}")))?
    }
}

fn sqlite_err(e: rusqlite::Error) -> MemoryErrorKind {
    MemoryErrorKind::Sqlite(e.to_string())
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEvent> {
    let id: i64 = row.get(0)?;
    let ts_str: String = row.get(1)?;
    let event_type: String = row.get(2)?;
    let content: String = row.get(3)?;
    let metadata_str: String = row.get(4)?;
    let conversation_id: Option<String> = row.get(5)?;
    let confidence: f64 = row.get(6)?;

    let timestamp = ts_str.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::InvalidColumnType(1, e.to_string(), rusqlite::types::Type::Text)
    })?;
    let metadata = serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null);

    Ok(MemoryEvent {
        id,
        timestamp,
        event_type,
        content,
        metadata,
        conversation_id,
        confidence: confidence as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_get_by_id_roundtrips() {
        let store = MemoryStore::open_in_memory().unwrap();
        let event = MemoryEvent::new("observation", "cpu spiked");
        let id = store.store_event(&event).await.unwrap();
        let fetched = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "cpu spiked");
        assert_eq!(fetched.event_type, "observation");
    }

    #[tokio::test]
    async fn store_and_verify_succeeds_for_durable_write() {
        let store = MemoryStore::open_in_memory().unwrap();
        let event = MemoryEvent::new("hypothesis", "maybe a leak");
        let verified = store.store_and_verify(&event).await.unwrap();
        assert_eq!(verified.content, "maybe a leak");
    }

    #[tokio::test]
    async fn get_events_filters_by_type() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.store_event(&MemoryEvent::new("observation", "a")).await.unwrap();
        store.store_event(&MemoryEvent::new("action", "b")).await.unwrap();

        let filter = EventFilter { event_type: Some("action".into()), ..Default::default() };
        let rows = store.get_events(filter, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "b");
    }

    #[tokio::test]
    async fn get_events_filters_by_conversation_id() {
        let store = MemoryStore::open_in_memory().unwrap();
        let mut e1 = MemoryEvent::new("observation", "turn 1");
        e1.conversation_id = Some("conv-1".into());
        let mut e2 = MemoryEvent::new("observation", "turn 2");
        e2.conversation_id = Some("conv-2".into());
        store.store_event(&e1).await.unwrap();
        store.store_event(&e2).await.unwrap();

        let filter = EventFilter { conversation_id: Some("conv-1".into()), ..Default::default() };
        let rows = store.get_events(filter, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "turn 1");
    }

    #[tokio::test]
    async fn get_events_respects_limit() {
        let store = MemoryStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.store_event(&MemoryEvent::new("observation", format!("e{i}"))).await.unwrap();
        }
        let rows = store.get_events(EventFilter::default(), 2).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn consistency_check_flags_unknown_event_type() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.store_event(&MemoryEvent::new("not_a_real_type", "x")).await.unwrap();
        let report = store.consistency_check().await.unwrap();
        assert_eq!(report.invalid_event_types, 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn consistency_check_clean_store_reports_zero() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.store_event(&MemoryEvent::new("observation", "fine")).await.unwrap();
        let report = store.consistency_check().await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn get_by_id_unknown_returns_none() {
        let store = MemoryStore::open_in_memory().unwrap();
        let found = store.get_by_id(9999).await.unwrap();
        assert!(found.is_none());
    }
}
