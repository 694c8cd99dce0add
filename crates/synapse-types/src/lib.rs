//! Shared data model for the introspection/self-healing core.
//!
//! Every other crate in the workspace depends on this one: it defines the
//! wire/record types that flow from the Event Observer through the Rule
//! Engine, the Intent Router, the ChemBus, the Investigation Worker Pool,
//! the Affective Self-Regulator, and into the Memory Store / Vector Index.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use std::collections::BTreeMap;

/// Arbitrary JSON-ish scalar used inside `data`/`facts`/`payload` maps.
pub type DataMap = BTreeMap<String, serde_json::Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// A normalized observation produced by an Event Observer source and
/// consumed by the Rule Engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub source: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: DataMap,
}

impl Event {
    pub fn new(source: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind: kind.into(),
            timestamp: Utc::now(),
            data: DataMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Deduplication / rate-limit key: `"source:kind[:path][:unit]"`.
    pub fn hash_key(&self) -> String {
        let mut key = format!("{}:{}", self.source, self.kind);
        if let Some(path) = self.data.get("path").and_then(|v| v.as_str()) {
            key.push(':');
            key.push_str(path);
        }
        if let Some(unit) = self.data.get("unit").and_then(|v| v.as_str()) {
            key.push(':');
            key.push_str(unit);
        }
        key
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(|v| v.as_f64())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Intent
// ─────────────────────────────────────────────────────────────────────────────

/// An action hint produced by a matching Rule Engine rule.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Intent {
    pub intent_type: String,
    pub priority: u8,
    pub reason: String,
    #[serde(default)]
    pub data: DataMap,
    pub generated_at: DateTime<Utc>,
    /// SHA-256 checksum over the canonical (serialized) payload, populated
    /// by the intent writer when the file is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Intent {
    pub fn new(intent_type: impl Into<String>, priority: u8, reason: impl Into<String>) -> Self {
        Self {
            intent_type: intent_type.into(),
            priority,
            reason: reason.into(),
            data: DataMap::new(),
            generated_at: Utc::now(),
            checksum: None,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Canonical checksum of this intent's `intent_type`/`priority`/`reason`/
    /// `data` fields (excludes `checksum` and `generated_at`, which are not
    /// part of the content being protected).
    pub fn compute_checksum(&self) -> String {
        let canonical = serde_json::json!({
            "intent_type": self.intent_type,
            "priority": self.priority,
            "reason": self.reason,
            "data": self.data,
        });
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signal (ChemBus envelope)
// ─────────────────────────────────────────────────────────────────────────────

/// A message carried over the Chemical Signal Bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub topic: String,
    #[serde(default)]
    pub ecosystem: String,
    #[serde(default = "default_intensity")]
    pub intensity: f64,
    #[serde(default)]
    pub facts: DataMap,
    #[serde(default)]
    pub incident_id: Option<String>,
    pub issued_at: DateTime<Utc>,
}

fn default_intensity() -> f64 {
    1.0
}

impl Signal {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ecosystem: String::new(),
            intensity: default_intensity(),
            facts: DataMap::new(),
            incident_id: None,
            issued_at: Utc::now(),
        }
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.facts.insert(key.into(), value.into());
        self
    }

    pub fn with_intensity(mut self, intensity: f64) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_incident_id(mut self, incident_id: impl Into<String>) -> Self {
        self.incident_id = Some(incident_id.into());
        self
    }

    pub fn fact_str(&self, key: &str) -> Option<&str> {
        self.facts.get(key).and_then(|v| v.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CuriosityQuestion
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Ready,
    Running,
    Completed,
    Failed,
    Timeout,
    Decomposed,
    MetaSkipped,
    QueueFullSkipped,
    NotRelevantSkipped,
}

/// A hypothesis about system state produced by the Intent Router or a
/// scanner (e.g. the UnindexedKnowledgeScanner), awaiting investigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuriosityQuestion {
    pub id: String,
    pub hypothesis: String,
    pub question: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub evidence_hash: String,
    pub priority: String,
    pub capability_key: String,
    pub status: QuestionStatus,
    pub created_at: DateTime<Utc>,
}

impl CuriosityQuestion {
    pub fn new(
        id: impl Into<String>,
        hypothesis: impl Into<String>,
        question: impl Into<String>,
        evidence: Vec<String>,
        priority: impl Into<String>,
        capability_key: impl Into<String>,
    ) -> Self {
        let evidence_hash = evidence_hash(&evidence);
        Self {
            id: id.into(),
            hypothesis: hypothesis.into(),
            question: question.into(),
            evidence,
            evidence_hash,
            priority: priority.into(),
            capability_key: capability_key.into(),
            status: QuestionStatus::Ready,
            created_at: Utc::now(),
        }
    }
}

/// The 16-character evidence hash used for dedup / context-aware
/// re-investigation: a prefix of the SHA-256 of the sorted, pipe-joined
/// evidence strings.
pub fn evidence_hash(evidence: &[String]) -> String {
    let mut sorted: Vec<&str> = evidence.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let joined = sorted.join("|");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let digest = hasher.finalize();
    let full = format!("{:x}", digest);
    full[..16].to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// InvestigationRecord
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationStatus {
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationRecord {
    pub question_id: String,
    pub status: InvestigationStatus,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub evidence_hash: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub model_used: String,
    pub tokens_used: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl InvestigationRecord {
    /// A result is a failure iff: status != completed; tags contains
    /// "unsolvable"; evidence is empty; or evidence_hash matches the prior
    /// attempt's hash.
    pub fn is_failure(&self, previous_evidence_hash: Option<&str>) -> bool {
        self.status != InvestigationStatus::Completed
            || self.tags.iter().any(|t| t == "unsolvable")
            || self.evidence.is_empty()
            || previous_evidence_hash == Some(self.evidence_hash.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryEvent
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    #[serde(default)]
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub confidence: f32,
}

impl MemoryEvent {
    pub fn new(event_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            event_type: event_type.into(),
            content: content.into(),
            metadata: serde_json::Value::Null,
            conversation_id: None,
            confidence: 1.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VectorDoc
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDoc {
    pub collection: String,
    pub id: String,
    pub payload: serde_json::Value,
    pub embedding: Vec<f32>,
    pub content_hash: String,
    pub mtime: DateTime<Utc>,
    pub source_path: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ProcessedQuestion
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedQuestion {
    pub question_id: String,
    pub processed_at: DateTime<Utc>,
    /// Opaque marker token (`"investigated"`, `"meta_skipped"`,
    /// `"queue_full"`, ...); preserved verbatim, never interpreted.
    pub intent_sha: String,
    #[serde(default)]
    pub evidence_hash: Option<String>,
}

impl ProcessedQuestion {
    pub fn new(question_id: impl Into<String>, intent_sha: impl Into<String>) -> Self {
        Self {
            question_id: question_id.into(),
            processed_at: Utc::now(),
            intent_sha: intent_sha.into(),
            evidence_hash: None,
        }
    }

    pub fn with_evidence_hash(mut self, hash: impl Into<String>) -> Self {
        self.evidence_hash = Some(hash.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level error type surfaced to the CLI / daemon supervisor.
#[derive(Error, Debug)]
pub enum SynapseError {
    #[error("transient I/O error in {source_name}: {details}")]
    TransientIo { source_name: String, details: String },

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("memory store error: {0}")]
    Memory(#[from] MemoryErrorKind),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Narrow error kind used by `synapse-memory`; kept here so `SynapseError`
/// can convert it without the types crate depending on `rusqlite`.
#[derive(Error, Debug)]
pub enum MemoryErrorKind {
    #[error("sqlite: {0}")]
    Sqlite(String),
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("consistency violation: {0}")]
    Consistency(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_hash_key_includes_path_and_unit() {
        let event = Event::new("journald", "error_operational")
            .with_data("unit", "svc.service")
            .with_data("path", "/var/log/x");
        assert_eq!(event.hash_key(), "journald:error_operational:/var/log/x:svc.service");
    }

    #[test]
    fn event_hash_key_minimal() {
        let event = Event::new("inotify", "promotion_new");
        assert_eq!(event.hash_key(), "inotify:promotion_new");
    }

    #[test]
    fn evidence_hash_is_order_independent() {
        let a = evidence_hash(&["b".into(), "a".into(), "c".into()]);
        let b = evidence_hash(&["c".into(), "b".into(), "a".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn evidence_hash_differs_on_content() {
        let a = evidence_hash(&["a".into()]);
        let b = evidence_hash(&["b".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn intent_checksum_deterministic() {
        let intent = Intent::new("curiosity_investigate", 9, "reason").with_data("x", 1);
        let c1 = intent.compute_checksum();
        let c2 = intent.compute_checksum();
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64);
    }

    #[test]
    fn intent_checksum_ignores_generated_at() {
        let mut intent = Intent::new("curiosity_investigate", 9, "reason");
        let c1 = intent.compute_checksum();
        intent.generated_at = Utc::now() + chrono::Duration::seconds(5);
        let c2 = intent.compute_checksum();
        assert_eq!(c1, c2);
    }

    #[test]
    fn investigation_record_is_failure_on_empty_evidence() {
        let record = InvestigationRecord {
            question_id: "q1".into(),
            status: InvestigationStatus::Completed,
            evidence: vec![],
            evidence_hash: "abc".into(),
            tags: vec![],
            model_used: "llama3".into(),
            tokens_used: 10,
            duration_ms: 5,
            failure_reason: None,
        };
        assert!(record.is_failure(None));
    }

    #[test]
    fn investigation_record_is_failure_on_duplicate_evidence_hash() {
        let record = InvestigationRecord {
            question_id: "q1".into(),
            status: InvestigationStatus::Completed,
            evidence: vec!["ev".into()],
            evidence_hash: "abc123".into(),
            tags: vec![],
            model_used: "llama3".into(),
            tokens_used: 10,
            duration_ms: 5,
            failure_reason: None,
        };
        assert!(record.is_failure(Some("abc123")));
        assert!(!record.is_failure(Some("different")));
    }

    #[test]
    fn investigation_record_is_failure_on_unsolvable_tag() {
        let record = InvestigationRecord {
            question_id: "q1".into(),
            status: InvestigationStatus::Completed,
            evidence: vec!["ev".into()],
            evidence_hash: "abc123".into(),
            tags: vec!["unsolvable".into()],
            model_used: "llama3".into(),
            tokens_used: 10,
            duration_ms: 5,
            failure_reason: None,
        };
        assert!(record.is_failure(None));
    }

    #[test]
    fn investigation_record_success_case() {
        let record = InvestigationRecord {
            question_id: "q1".into(),
            status: InvestigationStatus::Completed,
            evidence: vec!["ev".into()],
            evidence_hash: "abc123".into(),
            tags: vec![],
            model_used: "llama3".into(),
            tokens_used: 10,
            duration_ms: 5,
            failure_reason: None,
        };
        assert!(!record.is_failure(Some("different_hash")));
    }

    #[test]
    fn signal_roundtrip() {
        let signal = Signal::new("Q_CURIOSITY_INVESTIGATE")
            .with_fact("priority", "critical")
            .with_incident_id("incident-1")
            .with_intensity(2.0);
        let json = serde_json::to_string(&signal).unwrap();
        let back: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(back.topic, "Q_CURIOSITY_INVESTIGATE");
        assert_eq!(back.fact_str("priority"), Some("critical"));
        assert_eq!(back.incident_id.as_deref(), Some("incident-1"));
        assert!((back.intensity - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn curiosity_question_computes_evidence_hash_on_construction() {
        let q = CuriosityQuestion::new(
            "q1",
            "hypothesis",
            "question?",
            vec!["ev1".into(), "ev2".into()],
            "medium",
            "self_healing.service_error_analysis",
        );
        assert_eq!(q.evidence_hash, evidence_hash(&["ev1".into(), "ev2".into()]));
        assert_eq!(q.status, QuestionStatus::Ready);
    }
}
