//! Processed-questions log and investigation log — append-only JSONL files
//! written with an atomic rename (`*.tmp` then `rename`) so a crash mid-write
//! never leaves a torn line for a reader to trip over.
//!
//! Each log rebuilds an in-memory index from the file at startup (the
//! filesystem is the database; the index is just a cache over it) so
//! membership and dedup checks stay O(1) without re-reading the file on
//! every lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use synapse_types::{InvestigationRecord, MemoryErrorKind, ProcessedQuestion};

fn atomic_append_line(path: &Path, line: &str) -> Result<(), MemoryErrorKind> {
    use std::io::Write;

    let existing = std::fs::read(path).unwrap_or_default();
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = std::fs::File::create(&tmp_path)
            .map_err(|e| MemoryErrorKind::Consistency(format!("create tmp log file: {e}")))?;
        tmp.write_all(&existing)
            .map_err(|e| MemoryErrorKind::Consistency(format!("write tmp log file: {e}")))?;
        tmp.write_all(line.as_bytes())
            .map_err(|e| MemoryErrorKind::Consistency(format!("write tmp log file: {e}")))?;
        tmp.write_all(b"\n").map_err(|e| MemoryErrorKind::Consistency(format!("write tmp log file: {e}")))?;
        tmp.sync_all().map_err(|e| MemoryErrorKind::Consistency(format!("fsync tmp log file: {e}")))?;
    }
    std::fs::rename(&tmp_path, path)
        .map_err(|e| MemoryErrorKind::Consistency(format!("rename tmp log file: {e}")))?;
    Ok(())
}

fn read_lines(path: &Path) -> Result<Vec<String>, MemoryErrorKind> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents.lines().filter(|l| !l.trim().is_empty()).map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(MemoryErrorKind::Consistency(format!("read log file: {e}"))),
    }
}

/// Append-only log of [`ProcessedQuestion`] markers, keyed by `question_id`.
///
/// Used by the investigation worker pool to decide whether a curiosity
/// question has already been handled (including meta-skipped and
/// queue-full-skipped markers) without re-investigating it.
pub struct ProcessedQuestionLog {
    path: PathBuf,
    // question_id -> most recent ProcessedQuestion seen for it.
    index: Arc<Mutex<HashMap<String, ProcessedQuestion>>>,
}

impl ProcessedQuestionLog {
    /// Open (or create) the log at `path`, rebuilding its in-memory index
    /// from whatever lines already exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MemoryErrorKind> {
        let path = path.into();
        let mut index = HashMap::new();
        for line in read_lines(&path)? {
            let entry: ProcessedQuestion = serde_json::from_str(&line)
                .map_err(|e| MemoryErrorKind::Consistency(format!("corrupt processed-questions line: {e}")))?;
            index.insert(entry.question_id.clone(), entry);
        }
        Ok(Self { path, index: Arc::new(Mutex::new(index)) })
    }

    /// Record that `question_id` has been processed with outcome
    /// `intent_sha` (an opaque marker — `"investigated"`, `"meta_skipped"`,
    /// `"queue_full"`, `"not_relevant_skipped"`).
    pub async fn record(&self, entry: ProcessedQuestion) -> Result<(), MemoryErrorKind> {
        let path = self.path.clone();
        let line = serde_json::to_string(&entry)
            .map_err(|e| MemoryErrorKind::Consistency(format!("serialize processed question: {e}")))?;
        tokio::task::spawn_blocking(move || atomic_append_line(&path, &line))
            .await
            .map_err(|e| MemoryErrorKind::Consistency(format!("blocking task panicked: {e}")))??;
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index.insert(entry.question_id.clone(), entry);
        Ok(())
    }

    /// `true` iff `question_id` has already been processed.
    pub fn is_processed(&self, question_id: &str) -> bool {
        self.index.lock().unwrap_or_else(|e| e.into_inner()).contains_key(question_id)
    }

    /// The evidence hash recorded for `question_id`'s most recent attempt,
    /// if any — used to detect a repeated no-progress investigation.
    pub fn previous_evidence_hash(&self, question_id: &str) -> Option<String> {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(question_id)
            .and_then(|e| e.evidence_hash.clone())
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only log of [`InvestigationRecord`]s, one JSON object per line.
///
/// Cheaply [`Clone`]: the in-memory index is `Arc`-shared, so a cloned
/// handle given to a read-only consumer observes every append made through
/// the writer's own handle without re-reading the file.
#[derive(Clone)]
pub struct InvestigationLog {
    path: PathBuf,
    records: Arc<Mutex<Vec<InvestigationRecord>>>,
}

impl InvestigationLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MemoryErrorKind> {
        let path = path.into();
        let mut records = Vec::new();
        for line in read_lines(&path)? {
            let record: InvestigationRecord = serde_json::from_str(&line)
                .map_err(|e| MemoryErrorKind::Consistency(format!("corrupt investigations line: {e}")))?;
            records.push(record);
        }
        Ok(Self { path, records: Arc::new(Mutex::new(records)) })
    }

    /// Append one investigation outcome.
    pub async fn append(&self, record: InvestigationRecord) -> Result<(), MemoryErrorKind> {
        let path = self.path.clone();
        let line = serde_json::to_string(&record)
            .map_err(|e| MemoryErrorKind::Consistency(format!("serialize investigation record: {e}")))?;
        tokio::task::spawn_blocking(move || atomic_append_line(&path, &line))
            .await
            .map_err(|e| MemoryErrorKind::Consistency(format!("blocking task panicked: {e}")))??;
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
        Ok(())
    }

    /// All records for `question_id`, oldest first.
    pub fn for_question(&self, question_id: &str) -> Vec<InvestigationRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.question_id == question_id)
            .cloned()
            .collect()
    }

    /// Up to `limit` most recently appended records across all questions,
    /// newest first.
    pub fn recent(&self, limit: usize) -> Vec<InvestigationRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dead-letter queue for signals the bus could not deliver. A separate
/// monitor may turn accumulated dead letters into a critical event.
pub struct DeadLetterQueue {
    path: PathBuf,
}

impl DeadLetterQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append a failed-delivery record: `topic`, free-text `reason`.
    pub async fn record(&self, topic: &str, reason: &str) -> Result<(), MemoryErrorKind> {
        let entry = serde_json::json!({
            "topic": topic,
            "reason": reason,
            "recorded_at": chrono::Utc::now().to_rfc3339(),
        });
        let path = self.path.clone();
        let line = serde_json::to_string(&entry)
            .map_err(|e| MemoryErrorKind::Consistency(format!("serialize dead letter: {e}")))?;
        tokio::task::spawn_blocking(move || atomic_append_line(&path, &line))
            .await
            .map_err(|e| MemoryErrorKind::Consistency(format!("blocking task panicked: {e}")))?
    }

    pub fn count(&self) -> usize {
        read_lines(&self.path).map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("synapse-memory-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[tokio::test]
    async fn processed_log_records_and_checks_membership() {
        let path = tmp_path("processed-1.jsonl");
        let log = ProcessedQuestionLog::open(&path).unwrap();
        assert!(!log.is_processed("discover.module.x"));

        log.record(ProcessedQuestion::new("discover.module.x", "investigated")).await.unwrap();
        assert!(log.is_processed("discover.module.x"));
        assert_eq!(log.len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn processed_log_rebuilds_index_from_disk() {
        let path = tmp_path("processed-2.jsonl");
        {
            let log = ProcessedQuestionLog::open(&path).unwrap();
            log.record(ProcessedQuestion::new("q1", "meta_skipped")).await.unwrap();
        }
        let reopened = ProcessedQuestionLog::open(&path).unwrap();
        assert!(reopened.is_processed("q1"));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn processed_log_tracks_previous_evidence_hash() {
        let path = tmp_path("processed-3.jsonl");
        let log = ProcessedQuestionLog::open(&path).unwrap();
        let entry = ProcessedQuestion::new("q2", "investigated").with_evidence_hash("abc123");
        log.record(entry).await.unwrap();
        assert_eq!(log.previous_evidence_hash("q2").as_deref(), Some("abc123"));
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn investigation_log_appends_and_filters_by_question() {
        use synapse_types::InvestigationStatus;

        let path = tmp_path("investigations-1.jsonl");
        let log = InvestigationLog::open(&path).unwrap();
        let record = InvestigationRecord {
            question_id: "q3".to_string(),
            status: InvestigationStatus::Completed,
            evidence: vec!["log line".to_string()],
            evidence_hash: "hash1".to_string(),
            tags: vec![],
            model_used: "local-7b".to_string(),
            tokens_used: 120,
            duration_ms: 450,
            failure_reason: None,
        };
        log.append(record.clone()).await.unwrap();
        let for_q3 = log.for_question("q3");
        assert_eq!(for_q3.len(), 1);
        assert_eq!(for_q3[0].evidence_hash, "hash1");
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn investigation_log_recent_returns_newest_first_across_questions() {
        use synapse_types::InvestigationStatus;

        let path = tmp_path("investigations-2.jsonl");
        let log = InvestigationLog::open(&path).unwrap();
        for i in 0..3 {
            log.append(InvestigationRecord {
                question_id: format!("q{i}"),
                status: InvestigationStatus::Completed,
                evidence: vec![],
                evidence_hash: format!("hash{i}"),
                tags: vec![],
                model_used: "local-7b".to_string(),
                tokens_used: 0,
                duration_ms: 0,
                failure_reason: None,
            })
            .await
            .unwrap();
        }
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].question_id, "q2");
        assert_eq!(recent[1].question_id, "q1");
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn dead_letter_queue_counts_entries() {
        let path = tmp_path("dead-letters-1.jsonl");
        let dlq = DeadLetterQueue::new(&path);
        assert_eq!(dlq.count(), 0);
        dlq.record("AFFECT_MEMORY_PRESSURE", "no active subscribers").await.unwrap();
        assert_eq!(dlq.count(), 1);
        std::fs::remove_file(&path).ok();
    }
}
