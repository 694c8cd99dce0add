//! Vector Index Adapter — indexed semantic recall.
//!
//! Reuses a single SQLite connection per process (no per-call connect/close
//! overhead) and exposes idempotent-by-id upserts plus top-k cosine-similarity
//! queries scoped to a named collection.
//!
//! # Storage layout
//!
//! A single table `vector_docs` is created (if it does not already exist):
//!
//! | column        | type | description                                    |
//! |---------------|------|------------------------------------------------|
//! | collection    | TEXT | logical namespace (part of the primary key)    |
//! | id            | TEXT | caller-assigned document id (part of the key)  |
//! | payload       | TEXT | JSON-encoded arbitrary payload                 |
//! | embedding     | BLOB | little-endian f32 vector (4 × N bytes)         |
//! | content_hash  | TEXT | hash of the indexed content, for change detection |
//! | mtime         | TEXT | RFC-3339 source mtime at index time            |
//! | source_path   | TEXT | originating filesystem path, if any            |

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use synapse_types::{MemoryErrorKind, VectorDoc};

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (dot, norm_a_sq, norm_b_sq) = a.iter().zip(b).fold(
        (0.0f32, 0.0f32, 0.0f32),
        |(dot, norm_a_sq, norm_b_sq), (&x, &y)| (dot + x * y, norm_a_sq + x * x, norm_b_sq + y * y),
    );
    let norm_a = norm_a_sq.sqrt();
    let norm_b = norm_b_sq.sqrt();
    if norm_a == 0.0 || norm_b == 0.0 { 0.0 } else { dot / (norm_a * norm_b) }
}

/// Wraps a `(VectorDoc, similarity)` pair for use in a min-heap so top-k
/// queries run in O(N log K) rather than sorting all N rows.
struct HeapEntry(VectorDoc, f32);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.1.total_cmp(&other.1) == CmpOrdering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse natural float order: lowest similarity sorts greatest, so
        // `BinaryHeap`'s default max-heap evicts the worst candidate first.
        other.1.total_cmp(&self.1)
    }
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

/// A filter restricting [`VectorIndex::query`] to payloads whose
/// `source_path` is present (used by scanners that only care about
/// file-backed documents).
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub require_source_path: bool,
}

/// SQLite-backed vector index shared across collections.
#[derive(Clone)]
pub struct VectorIndex {
    conn: Arc<Mutex<Connection>>,
}

impl VectorIndex {
    pub fn open(path: &str) -> Result<Self, MemoryErrorKind> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(sqlite_err)?;
        let index = Self { conn: Arc::new(Mutex::new(conn)) };
        index.init_schema()?;
        Ok(index)
    }

    pub fn open_in_memory() -> Result<Self, MemoryErrorKind> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        let index = Self { conn: Arc::new(Mutex::new(conn)) };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<(), MemoryErrorKind> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vector_docs (
                collection   TEXT NOT NULL,
                id           TEXT NOT NULL,
                payload      TEXT NOT NULL,
                embedding    BLOB NOT NULL,
                content_hash TEXT NOT NULL,
                mtime        TEXT NOT NULL,
                source_path  TEXT,
                PRIMARY KEY (collection, id)
            );",
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    /// Insert or replace `docs` in `collection`. Idempotent keyed by each
    /// doc's `id` — re-upserting the same id overwrites in place.
    pub async fn upsert(&self, collection: &str, docs: Vec<VectorDoc>) -> Result<(), MemoryErrorKind> {
        if docs.iter().any(|d| d.embedding.is_empty()) {
            return Err(MemoryErrorKind::DimensionMismatch { expected: 1, got: 0 });
        }
        let conn = Arc::clone(&self.conn);
        let collection = collection.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let tx = conn.transaction().map_err(sqlite_err)?;
            for doc in &docs {
                let blob = embedding_to_bytes(&doc.embedding);
                let payload = serde_json::to_string(&doc.payload)
                    .map_err(|e| MemoryErrorKind::Sqlite(format!("payload serialization failed: {e}")))?;
                tx.execute(
                    "INSERT INTO vector_docs (collection, id, payload, embedding, content_hash, mtime, source_path)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(collection, id) DO UPDATE SET
                         payload = excluded.payload,
                         embedding = excluded.embedding,
                         content_hash = excluded.content_hash,
                         mtime = excluded.mtime,
                         source_path = excluded.source_path",
                    params![
                        collection,
                        doc.id,
                        payload,
                        blob,
                        doc.content_hash,
                        doc.mtime.to_rfc3339(),
                        doc.source_path,
                    ],
                )
                .map_err(sqlite_err)?;
            }
            tx.commit().map_err(sqlite_err)?;
            Ok(())
        })
        .await
        .map_err(|e| MemoryErrorKind::Sqlite(format!("blocking task panicked: {e}")))?
    }

    /// Return the `k` most similar docs in `collection` to `embedding`,
    /// ranked by cosine similarity (highest first), as `(doc, score)` pairs.
    pub async fn query(
        &self,
        collection: &str,
        embedding: Vec<f32>,
        k: usize,
        filter: QueryFilter,
    ) -> Result<Vec<(VectorDoc, f32)>, MemoryErrorKind> {
        if embedding.is_empty() {
            return Err(MemoryErrorKind::DimensionMismatch { expected: 1, got: 0 });
        }
        if k == 0 {
            return Ok(vec![]);
        }
        let docs = self.all_in_collection(collection).await?;
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k + 1);

        for doc in docs {
            if filter.require_source_path && doc.source_path.is_none() {
                continue;
            }
            if doc.embedding.len() != embedding.len() {
                continue;
            }
            let score = cosine_similarity(&doc.embedding, &embedding);
            if heap.len() < k {
                heap.push(HeapEntry(doc, score));
            } else if let Some(worst) = heap.peek()
                && score > worst.1
            {
                heap.pop();
                heap.push(HeapEntry(doc, score));
            }
        }

        let mut result: Vec<(VectorDoc, f32)> = heap.into_iter().map(|e| (e.0, e.1)).collect();
        result.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(result)
    }

    /// All docs currently stored in `collection`, unordered.
    pub async fn all_in_collection(&self, collection: &str) -> Result<Vec<VectorDoc>, MemoryErrorKind> {
        let conn = Arc::clone(&self.conn);
        let collection = collection.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare(
                    "SELECT id, payload, embedding, content_hash, mtime, source_path
                     FROM vector_docs WHERE collection = ?1",
                )
                .map_err(sqlite_err)?;
            let collection_for_rows = collection.clone();
            let rows = stmt
                .query_map(params![collection], move |row| row_to_doc(row, &collection_for_rows))
                .map_err(sqlite_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(sqlite_err)
        })
        .await
        .map_err(|e| MemoryErrorKind::Sqlite(format!("blocking task panicked: {e}")))?
    }

    /// `true` iff `path`'s on-disk mtime is newer than the `indexed_mtime`
    /// stored for the doc whose `source_path` equals `path`, or if `path`
    /// has no indexed doc at all.
    pub async fn is_stale(&self, collection: &str, path: &str) -> Result<bool, MemoryErrorKind> {
        let disk_mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .ok();
        let Some(disk_mtime) = disk_mtime else {
            return Ok(true);
        };

        let conn = Arc::clone(&self.conn);
        let collection = collection.to_string();
        let path = path.to_string();
        let indexed_mtime: Option<String> = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row(
                "SELECT mtime FROM vector_docs WHERE collection = ?1 AND source_path = ?2",
                params![collection, path],
                |r| r.get(0),
            )
            .optional()
            .map_err(sqlite_err)
        })
        .await
        .map_err(|e| MemoryErrorKind::Sqlite(format!("blocking task panicked: {e}")))??;

        match indexed_mtime {
            None => Ok(true),
            Some(stored) => {
                let stored = stored
                    .parse::<DateTime<Utc>>()
                    .map_err(|e| MemoryErrorKind::Consistency(format!("unparseable mtime: {e}")))?;
                Ok(disk_mtime > stored)
            }
        }
    }

    /// All distinct `source_path` values currently indexed in `collection`.
    pub async fn get_indexed_files(&self, collection: &str) -> Result<HashSet<String>, MemoryErrorKind> {
        let conn = Arc::clone(&self.conn);
        let collection = collection.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare("SELECT source_path FROM vector_docs WHERE collection = ?1 AND source_path IS NOT NULL")
                .map_err(sqlite_err)?;
            let rows = stmt.query_map(params![collection], |r| r.get::<_, String>(0)).map_err(sqlite_err)?;
            rows.collect::<Result<HashSet<_>, _>>().map_err(sqlite_err)
        })
        .await
        .map_err(|e| MemoryErrorKind::Sqlite(format!("blocking task panicked: {e}")))?
    }
}

fn sqlite_err(e: rusqlite::Error) -> MemoryErrorKind {
    MemoryErrorKind::Sqlite(e.to_string())
}

fn row_to_doc(row: &rusqlite::Row<'_>, collection: &str) -> rusqlite::Result<VectorDoc> {
    let id: String = row.get(0)?;
    let payload_str: String = row.get(1)?;
    let blob: Vec<u8> = row.get(2)?;
    let content_hash: String = row.get(3)?;
    let mtime_str: String = row.get(4)?;
    let source_path: Option<String> = row.get(5)?;

    let payload = serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null);
    let mtime = mtime_str
        .parse::<DateTime<Utc>>()
        .map_err(|e| rusqlite::Error::InvalidColumnType(4, e.to_string(), rusqlite::types::Type::Text))?;

    Ok(VectorDoc {
        collection: collection.to_string(),
        id,
        payload,
        embedding: bytes_to_embedding(&blob),
        content_hash,
        mtime,
        source_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, embedding: Vec<f32>, source_path: Option<&str>) -> VectorDoc {
        VectorDoc {
            collection: "knowledge".to_string(),
            id: id.to_string(),
            payload: serde_json::json!({"id": id}),
            embedding,
            content_hash: format!("hash-{id}"),
            mtime: Utc::now(),
            source_path: source_path.map(str::to_string),
        }
    }

    #[test]
    fn cosine_identical_vectors_is_one() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn upsert_then_query_returns_closest() {
        let index = VectorIndex::open_in_memory().unwrap();
        index
            .upsert(
                "knowledge",
                vec![doc("near", vec![1.0, 0.0, 0.0], None), doc("far", vec![0.0, 0.0, 1.0], None)],
            )
            .await
            .unwrap();

        let results = index.query("knowledge", vec![1.0, 0.0, 0.0], 1, QueryFilter::default()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, "near");
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn upsert_same_id_is_idempotent() {
        let index = VectorIndex::open_in_memory().unwrap();
        index.upsert("knowledge", vec![doc("a", vec![1.0, 0.0], None)]).await.unwrap();
        let mut updated = doc("a", vec![0.0, 1.0], None);
        updated.content_hash = "hash-updated".to_string();
        index.upsert("knowledge", vec![updated]).await.unwrap();

        let all = index.all_in_collection("knowledge").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content_hash, "hash-updated");
    }

    #[tokio::test]
    async fn query_skips_dimension_mismatched_docs() {
        let index = VectorIndex::open_in_memory().unwrap();
        index.upsert("knowledge", vec![doc("a", vec![1.0, 0.0, 0.0], None)]).await.unwrap();
        let results = index.query("knowledge", vec![1.0, 0.0], 5, QueryFilter::default()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn is_stale_true_for_unindexed_path() {
        let index = VectorIndex::open_in_memory().unwrap();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert!(index.is_stale("knowledge", tmp.path().to_str().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn is_stale_false_when_indexed_mtime_is_newer() {
        let index = VectorIndex::open_in_memory().unwrap();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        let future_mtime = Utc::now() + chrono::Duration::days(1);
        let mut d = doc("a", vec![1.0, 0.0], Some(&path));
        d.mtime = future_mtime;
        index.upsert("knowledge", vec![d]).await.unwrap();
        assert!(!index.is_stale("knowledge", &path).await.unwrap());
    }

    #[tokio::test]
    async fn get_indexed_files_returns_source_paths() {
        let index = VectorIndex::open_in_memory().unwrap();
        index
            .upsert(
                "knowledge",
                vec![doc("a", vec![1.0], Some("/etc/conf.toml")), doc("b", vec![0.0], None)],
            )
            .await
            .unwrap();
        let files = index.get_indexed_files("knowledge").await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains("/etc/conf.toml"));
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let index = VectorIndex::open_in_memory().unwrap();
        index.upsert("a", vec![doc("x", vec![1.0, 0.0], None)]).await.unwrap();
        index.upsert("b", vec![doc("x", vec![0.0, 1.0], None)]).await.unwrap();
        let a_docs = index.all_in_collection("a").await.unwrap();
        assert_eq!(a_docs.len(), 1);
        assert_eq!(a_docs[0].embedding, vec![1.0, 0.0]);
    }
}
