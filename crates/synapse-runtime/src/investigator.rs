//! Investigation Worker Pool — carries [`CuriosityQuestion`]s from the bus
//! through to a recorded [`InvestigationRecord`].
//!
//! Every question passes through the same pipeline:
//!
//! 1. [`InvestigationGate::admit`] rejects meta-loop questions and questions
//!    arriving while the queue is already over its depth limit.
//! 2. A rejected question is marked processed (so it is never re-admitted)
//!    and, for a queue-full rejection, an `INVESTIGATION_QUEUE_FULL` signal
//!    is published.
//! 3. Priority routing: `critical`/`high`-priority questions take the
//!    emergency path (bypass the concurrency semaphore and the
//!    inter-investigation delay, run under [`WorkerPoolConfig::emergency_timeout`]);
//!    everything else takes the normal path (wait for a semaphore permit,
//!    honor [`WorkerPoolConfig::min_delay_between_investigations`], run under
//!    [`WorkerPoolConfig::normal_timeout`]).
//! 4. `pattern.archive.*` questions get a relevance sanity check before any
//!    work is done — if the referenced archive file has since vanished or
//!    gone stale, the question is skipped rather than investigated.
//! 5. The question id's prefix selects a handler (module analysis, systemd
//!    service analysis, or generic).
//! 6. The handler runs inside a cancellable timeout. A timeout decomposes the
//!    question into narrower sub-questions at lower priority.
//! 7. The outcome is appended to the investigation log.
//! 8. A failing outcome is fed to a per-`capability_key` [`LoopGuard`]; three
//!    consecutive failures for the same reason publish
//!    `AFFECT_TASK_FAILURE_PATTERN`.
//! 9. `Q_INVESTIGATION_COMPLETE` is published with timing and token-usage
//!    facts.
//! 10. The question id is appended to the processed-questions log so it is
//!     never investigated twice.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use synapse_bus::ChemBus;
use synapse_kernel::{GateRejection, InvestigationGate};
use synapse_memory::{InvestigationLog, ProcessedQuestionLog};
use synapse_types::{CuriosityQuestion, InvestigationRecord, InvestigationStatus, ProcessedQuestion, Signal};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::loop_guard::LoopGuard;

/// Number of consecutive same-reason failures, for the same `capability_key`,
/// that triggers an `AFFECT_TASK_FAILURE_PATTERN` signal.
const FAILURE_PATTERN_THRESHOLD: usize = 3;

/// A handler invoked for one [`CuriosityQuestion`], returning the outcome of
/// actually carrying out the investigation (an LLM call, a log scrape, a
/// `systemctl` inspection — whatever the route implies).
///
/// Modeled on [`ChemBus::subscribe_handler`]'s `Fn -> Future` shape so
/// construction reads the same way across the crate.
pub type HandlerFn =
    Arc<dyn Fn(CuriosityQuestion) -> Pin<Box<dyn Future<Output = InvestigationOutcome> + Send>> + Send + Sync>;

/// The result of actually running an investigation handler, before it is
/// turned into an [`InvestigationRecord`].
#[derive(Debug, Clone)]
pub struct InvestigationOutcome {
    pub status: InvestigationStatus,
    pub evidence: Vec<String>,
    pub tags: Vec<String>,
    pub model_used: String,
    pub tokens_used: u64,
    pub failure_reason: Option<String>,
}

impl InvestigationOutcome {
    pub fn completed(evidence: Vec<String>, model_used: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            status: InvestigationStatus::Completed,
            evidence,
            tags: Vec::new(),
            model_used: model_used.into(),
            tokens_used,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: InvestigationStatus::Failed,
            evidence: Vec::new(),
            tags: Vec::new(),
            model_used: String::new(),
            tokens_used: 0,
            failure_reason: Some(reason.into()),
        }
    }
}

/// The three handlers a question id's prefix can route to.
#[derive(Clone)]
pub struct QuestionHandlers {
    /// `discover.module.*` and `reinvestigate.*` questions.
    pub module: HandlerFn,
    /// `systemd_audit_*` questions.
    pub systemd: HandlerFn,
    /// Everything else.
    pub generic: HandlerFn,
}

/// Tunables for the worker pool, normally sourced from configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub max_concurrent_investigations: usize,
    pub min_delay_between_investigations: Duration,
    pub normal_timeout: Duration,
    pub emergency_timeout: Duration,
    pub max_queue_depth: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_investigations: 4,
            min_delay_between_investigations: Duration::from_millis(500),
            normal_timeout: Duration::from_secs(600),
            emergency_timeout: Duration::from_secs(300),
            max_queue_depth: 100,
        }
    }
}

/// What happened to one question after running the full pipeline.
#[derive(Debug, Clone)]
pub enum QuestionOutcome {
    MetaSkipped,
    QueueFullSkipped { queue_depth: usize, limit: usize },
    NotRelevantSkipped,
    Completed(InvestigationRecord),
    Failed(InvestigationRecord),
    TimedOut { record: InvestigationRecord, sub_questions: Vec<CuriosityQuestion> },
}

/// Counters sampled by the 300-second metrics tick.
#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    total_rejections: AtomicU64,
}

/// The investigation worker pool.
pub struct WorkerPool {
    config: Mutex<WorkerPoolConfig>,
    gate: InvestigationGate,
    bus: ChemBus,
    processed_log: ProcessedQuestionLog,
    investigation_log: InvestigationLog,
    handlers: QuestionHandlers,
    semaphore: Arc<Semaphore>,
    configured_permits: AtomicUsize,
    last_investigation_start: Mutex<Option<Instant>>,
    loop_guards: Mutex<HashMap<String, LoopGuard>>,
    counters: Counters,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        gate: InvestigationGate,
        bus: ChemBus,
        processed_log: ProcessedQuestionLog,
        investigation_log: InvestigationLog,
        handlers: QuestionHandlers,
    ) -> Self {
        let permits = config.max_concurrent_investigations.max(1);
        Self {
            config: Mutex::new(config),
            gate,
            bus,
            processed_log,
            investigation_log,
            handlers,
            semaphore: Arc::new(Semaphore::new(permits)),
            configured_permits: AtomicUsize::new(permits),
            last_investigation_start: Mutex::new(None),
            loop_guards: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Adjust the concurrency cap at runtime (e.g. in response to an
    /// `INVESTIGATION_THROTTLE_REQUEST` signal from the self-regulator).
    pub fn set_max_concurrent(&self, requested: usize) {
        let requested = requested.max(1);
        let current = self.configured_permits.swap(requested, Ordering::SeqCst);
        match requested.cmp(&current) {
            std::cmp::Ordering::Greater => self.semaphore.add_permits(requested - current),
            std::cmp::Ordering::Less => {
                let _ = self.semaphore.forget_permits(current - requested);
            }
            std::cmp::Ordering::Equal => {}
        }
    }

    pub fn set_min_delay(&self, delay: Duration) {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).min_delay_between_investigations = delay;
    }

    pub fn completed_count(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Run the full ten-step pipeline for one question.
    pub async fn process_question(&self, question: CuriosityQuestion, queue_depth: usize) -> QuestionOutcome {
        // Steps 1-2: meta-loop filter, then queue-depth check.
        if let Err(rejection) = self.gate.admit(&question, queue_depth) {
            return self.handle_rejection(&question, rejection).await;
        }

        // Step 4: relevance sanity check for pattern.archive.* questions.
        if question.id.starts_with("pattern.archive.") && !is_archive_question_relevant(&question) {
            self.mark_processed(&question, "not_relevant_skipped", None).await;
            return QuestionOutcome::NotRelevantSkipped;
        }

        let is_emergency = matches!(question.priority.as_str(), "critical" | "high");
        let enqueued_at = question.created_at;

        // Step 3: priority routing — emergency bypasses the semaphore and delay.
        let (outcome, model_used, tokens_used, duration) = if is_emergency {
            let timeout = self.config.lock().unwrap_or_else(|e| e.into_inner()).emergency_timeout;
            self.run_with_timeout(&question, timeout).await
        } else {
            self.throttle_for_normal_path().await;
            let _permit = self.semaphore.clone().acquire_owned().await.ok();
            *self.last_investigation_start.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            let timeout = self.config.lock().unwrap_or_else(|e| e.into_inner()).normal_timeout;
            self.run_with_timeout(&question, timeout).await
        };

        let queue_wait_ms = (Utc::now() - enqueued_at).num_milliseconds().max(0) as u64;

        match outcome {
            Some(outcome) => {
                let previous_hash = self.processed_log.previous_evidence_hash(&question.id);
                self.finish(question, outcome, duration, queue_wait_ms, previous_hash.as_deref()).await
            }
            None => self.finish_timeout(question, model_used, tokens_used, duration, queue_wait_ms).await,
        }
    }

    async fn handle_rejection(&self, question: &CuriosityQuestion, rejection: GateRejection) -> QuestionOutcome {
        match rejection {
            GateRejection::MetaLoop => {
                self.mark_processed(question, "meta_skipped", None).await;
                QuestionOutcome::MetaSkipped
            }
            GateRejection::QueueFull { queue_depth, limit } => {
                let total_rejections = self.counters.total_rejections.fetch_add(1, Ordering::Relaxed) + 1;
                let signal = Signal::new("INVESTIGATION_QUEUE_FULL")
                    .with_fact("queue_depth", queue_depth as i64)
                    .with_fact("limit", limit as i64)
                    .with_fact("rejected_question_id", question.id.clone())
                    .with_fact("total_rejections", total_rejections as i64);
                let _ = self.bus.publish(signal);
                self.mark_processed(question, "queue_full", None).await;
                QuestionOutcome::QueueFullSkipped { queue_depth, limit }
            }
        }
    }

    async fn throttle_for_normal_path(&self) {
        let min_delay = self.config.lock().unwrap_or_else(|e| e.into_inner()).min_delay_between_investigations;
        let last = *self.last_investigation_start.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = last {
            let elapsed = last.elapsed();
            if elapsed < min_delay {
                tokio::time::sleep(min_delay - elapsed).await;
            }
        }
    }

    /// Step 5 (routing) + step 6 (timeout enforcement). Returns `None` on
    /// timeout; `Some` carries the handler outcome plus elapsed wall time.
    async fn run_with_timeout(
        &self,
        question: &CuriosityQuestion,
        timeout: Duration,
    ) -> (Option<InvestigationOutcome>, String, u64, Duration) {
        let handler = self.select_handler(&question.id);
        let started = Instant::now();
        match tokio::time::timeout(timeout, handler(question.clone())).await {
            Ok(outcome) => {
                let model_used = outcome.model_used.clone();
                let tokens_used = outcome.tokens_used;
                (Some(outcome), model_used, tokens_used, started.elapsed())
            }
            Err(_) => (None, String::new(), 0, started.elapsed()),
        }
    }

    fn select_handler(&self, question_id: &str) -> HandlerFn {
        if question_id.starts_with("discover.module.") || question_id.starts_with("reinvestigate.") {
            Arc::clone(&self.handlers.module)
        } else if question_id.starts_with("systemd_audit_") {
            Arc::clone(&self.handlers.systemd)
        } else {
            Arc::clone(&self.handlers.generic)
        }
    }

    async fn finish(
        &self,
        question: CuriosityQuestion,
        outcome: InvestigationOutcome,
        duration: Duration,
        queue_wait_ms: u64,
        previous_evidence_hash: Option<&str>,
    ) -> QuestionOutcome {
        let evidence_hash = synapse_types::evidence_hash(&outcome.evidence);
        let record = InvestigationRecord {
            question_id: question.id.clone(),
            status: outcome.status,
            evidence: outcome.evidence,
            evidence_hash,
            tags: outcome.tags,
            model_used: outcome.model_used.clone(),
            tokens_used: outcome.tokens_used,
            duration_ms: duration.as_millis() as u64,
            failure_reason: outcome.failure_reason.clone(),
        };

        // Step 7: outcome recording.
        let _ = self.investigation_log.append(record.clone()).await;

        let is_failure = record.is_failure(previous_evidence_hash);
        if is_failure {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            // Step 8: failure-pattern learning.
            self.record_failure_and_maybe_signal(&question.capability_key, &record);
        } else {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        }

        // Step 9: completion signal.
        self.publish_completion(&question, &record, queue_wait_ms);

        // Step 10: processed marker.
        self.mark_processed(&question, "investigated", Some(record.evidence_hash.clone())).await;

        if is_failure { QuestionOutcome::Failed(record) } else { QuestionOutcome::Completed(record) }
    }

    async fn finish_timeout(
        &self,
        question: CuriosityQuestion,
        model_used: String,
        tokens_used: u64,
        duration: Duration,
        queue_wait_ms: u64,
    ) -> QuestionOutcome {
        let record = InvestigationRecord {
            question_id: question.id.clone(),
            status: InvestigationStatus::Timeout,
            evidence: Vec::new(),
            evidence_hash: synapse_types::evidence_hash(&question.evidence),
            tags: vec!["timeout".to_string()],
            model_used,
            tokens_used,
            duration_ms: duration.as_millis() as u64,
            failure_reason: Some("investigation timed out".to_string()),
        };
        let _ = self.investigation_log.append(record.clone()).await;
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.record_failure_and_maybe_signal(&question.capability_key, &record);
        self.publish_completion(&question, &record, queue_wait_ms);

        let sub_questions = decompose_timed_out_question(&question);
        self.mark_processed(&question, "investigated", Some(record.evidence_hash.clone())).await;
        QuestionOutcome::TimedOut { record, sub_questions }
    }

    fn record_failure_and_maybe_signal(&self, capability_key: &str, record: &InvestigationRecord) {
        let reason = record.failure_reason.clone().unwrap_or_else(|| "unknown".to_string());
        let label = format!("{capability_key}|{reason}");
        let mut guards = self.loop_guards.lock().unwrap_or_else(|e| e.into_inner());
        let guard = guards.entry(capability_key.to_string()).or_insert_with(|| LoopGuard::new(FAILURE_PATTERN_THRESHOLD));
        if guard.record(&label) {
            let signal = Signal::new("AFFECT_TASK_FAILURE_PATTERN")
                .with_fact("capability_key", capability_key.to_string())
                .with_fact("reason", reason)
                .with_intensity(2.0);
            let _ = self.bus.publish(signal);
        }
    }

    fn publish_completion(&self, question: &CuriosityQuestion, record: &InvestigationRecord, queue_wait_ms: u64) {
        let module_name = question
            .id
            .strip_prefix("discover.module.")
            .or_else(|| question.id.strip_prefix("reinvestigate."))
            .unwrap_or(question.id.as_str());
        let signal = Signal::new("Q_INVESTIGATION_COMPLETE")
            .with_fact("question_id", question.id.clone())
            .with_fact("module_name", module_name.to_string())
            .with_fact("status", format!("{:?}", record.status).to_lowercase())
            .with_fact("duration_ms", record.duration_ms as i64)
            .with_fact("model_used", record.model_used.clone())
            .with_fact("tokens_used", record.tokens_used as i64)
            .with_fact("queue_wait_time_ms", queue_wait_ms as i64);
        let _ = self.bus.publish(signal);
    }

    async fn mark_processed(&self, question: &CuriosityQuestion, marker: &str, evidence_hash: Option<String>) {
        let mut entry = ProcessedQuestion::new(question.id.clone(), marker);
        if let Some(hash) = evidence_hash {
            entry = entry.with_evidence_hash(hash);
        }
        let _ = self.processed_log.record(entry).await;
    }

    /// Emit `METRICS_SUMMARY`, and `BOTTLENECK_DETECTED` when `queue_depth`
    /// exceeds 50. Intended to be called from a 300-second tick loop owned by
    /// the caller (so tests can drive it deterministically).
    pub fn emit_metrics_summary(&self, queue_depth: usize) {
        let completed = self.counters.completed.swap(0, Ordering::Relaxed);
        let failed = self.counters.failed.swap(0, Ordering::Relaxed);
        let signal = Signal::new("METRICS_SUMMARY")
            .with_fact("completed", completed as i64)
            .with_fact("failed", failed as i64)
            .with_fact("queue_depth", queue_depth as i64);
        let _ = self.bus.publish(signal);

        if queue_depth > 50 {
            let signal = Signal::new("BOTTLENECK_DETECTED")
                .with_fact("queue_depth", queue_depth as i64)
                .with_intensity(2.0);
            let _ = self.bus.publish(signal);
        }
    }
}

/// `pattern.archive.*` relevance check: the question's evidence must name an
/// `archive_path`, that file must still exist, have been modified within the
/// last five minutes, and contain at least three lines.
fn is_archive_question_relevant(question: &CuriosityQuestion) -> bool {
    let Some(path) = question
        .evidence
        .iter()
        .find_map(|e| e.strip_prefix("archive_path: "))
    else {
        return false;
    };

    let Ok(metadata) = std::fs::metadata(path) else { return false };
    let Ok(modified) = metadata.modified() else { return false };
    let age = modified.elapsed().unwrap_or(Duration::MAX);
    if age > Duration::from_secs(5 * 60) {
        return false;
    }

    let Ok(contents) = std::fs::read_to_string(path) else { return false };
    contents.lines().count() >= 3
}

/// Decompose a timed-out question into 1-3 narrower sub-questions at a lower
/// priority, so the pool makes incremental progress instead of repeatedly
/// re-attempting the same too-broad question.
fn decompose_timed_out_question(question: &CuriosityQuestion) -> Vec<CuriosityQuestion> {
    let lower_priority = match question.priority.as_str() {
        "critical" => "high",
        "high" => "medium",
        _ => "low",
    };
    vec![
        CuriosityQuestion::new(
            format!("decomposed.{}.unique_keys", question.id),
            question.hypothesis.clone(),
            format!("{} (narrowed: unique identifying evidence only)", question.question),
            question.evidence.clone(),
            lower_priority,
            question.capability_key.clone(),
        ),
        CuriosityQuestion::new(
            format!("decomposed.{}.temporal", question.id),
            question.hypothesis.clone(),
            format!("{} (narrowed: most recent evidence window only)", question.question),
            question.evidence.iter().rev().take(3).cloned().collect(),
            lower_priority,
            question.capability_key.clone(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_kernel::MetaLoopFilter;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("synapse-investigator-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_file(&p);
        p
    }

    fn always_completes() -> HandlerFn {
        Arc::new(|_question| {
            Box::pin(async move { InvestigationOutcome::completed(vec!["found it".to_string()], "local-model", 42) })
        })
    }

    fn always_fails(reason: &'static str) -> HandlerFn {
        Arc::new(move |_question| Box::pin(async move { InvestigationOutcome::failed(reason) }))
    }

    fn never_completes() -> HandlerFn {
        Arc::new(|_question| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            })
        })
    }

    fn pool(config: WorkerPoolConfig, handlers: QuestionHandlers, suffix: &str) -> WorkerPool {
        let processed = ProcessedQuestionLog::open(tmp_path(&format!("processed-{suffix}"))).unwrap();
        let investigations = InvestigationLog::open(tmp_path(&format!("investigations-{suffix}"))).unwrap();
        let gate = InvestigationGate::new(MetaLoopFilter::new(), config.max_queue_depth);
        WorkerPool::new(config, gate, ChemBus::default(), processed, investigations, handlers)
    }

    fn question(id: &str, priority: &str) -> CuriosityQuestion {
        CuriosityQuestion::new(id, "hyp", "why?", vec!["evidence line".to_string()], priority, "cap.key")
    }

    #[tokio::test]
    async fn meta_prefixed_question_is_skipped_without_running_handler() {
        let handlers = QuestionHandlers { module: always_completes(), systemd: always_completes(), generic: always_completes() };
        let pool = pool(WorkerPoolConfig::default(), handlers, "meta");
        let outcome = pool.process_question(question("meta.rescan", "medium"), 0).await;
        assert!(matches!(outcome, QuestionOutcome::MetaSkipped));
    }

    #[tokio::test]
    async fn queue_full_question_is_rejected_with_depth_and_limit() {
        let config = WorkerPoolConfig { max_queue_depth: 2, ..WorkerPoolConfig::default() };
        let handlers = QuestionHandlers { module: always_completes(), systemd: always_completes(), generic: always_completes() };
        let pool = pool(config, handlers, "queue-full");
        let outcome = pool.process_question(question("discover.module.foo", "medium"), 5).await;
        assert!(matches!(outcome, QuestionOutcome::QueueFullSkipped { queue_depth: 5, limit: 2 }));
    }

    #[tokio::test]
    async fn generic_question_completes_successfully() {
        let handlers = QuestionHandlers { module: always_completes(), systemd: always_completes(), generic: always_completes() };
        let pool = pool(WorkerPoolConfig::default(), handlers, "completes");
        let outcome = pool.process_question(question("curiosity.adhoc.x", "medium"), 0).await;
        match outcome {
            QuestionOutcome::Completed(record) => {
                assert_eq!(record.status, InvestigationStatus::Completed);
                assert_eq!(record.tokens_used, 42);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn module_prefixed_question_routes_to_module_handler() {
        let routed = Arc::new(StdAtomicUsize::new(0));
        let routed_clone = routed.clone();
        let module_handler: HandlerFn = Arc::new(move |_q| {
            let routed = routed_clone.clone();
            Box::pin(async move {
                routed.fetch_add(1, Ordering::SeqCst);
                InvestigationOutcome::completed(vec!["ok".to_string()], "local-model", 1)
            })
        });
        let handlers = QuestionHandlers { module: module_handler, systemd: always_completes(), generic: always_fails("wrong route") };
        let pool = pool(WorkerPoolConfig::default(), handlers, "routing");
        let outcome = pool.process_question(question("discover.module.foo", "medium"), 0).await;
        assert!(matches!(outcome, QuestionOutcome::Completed(_)));
        assert_eq!(routed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_decomposes_into_sub_questions() {
        let config = WorkerPoolConfig { normal_timeout: Duration::from_millis(20), ..WorkerPoolConfig::default() };
        let handlers = QuestionHandlers { module: never_completes(), systemd: always_completes(), generic: always_completes() };
        let pool = pool(config, handlers, "timeout");
        let outcome = pool.process_question(question("discover.module.foo", "medium"), 0).await;
        match outcome {
            QuestionOutcome::TimedOut { record, sub_questions } => {
                assert_eq!(record.status, InvestigationStatus::Timeout);
                assert!(!sub_questions.is_empty());
                assert!(sub_questions.len() <= 3);
                assert!(sub_questions[0].priority == "low" || sub_questions[0].priority == "medium");
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn emergency_priority_bypasses_semaphore_and_uses_emergency_timeout() {
        let config = WorkerPoolConfig { max_concurrent_investigations: 1, emergency_timeout: Duration::from_secs(5), ..WorkerPoolConfig::default() };
        let handlers = QuestionHandlers { module: always_completes(), systemd: always_completes(), generic: always_completes() };
        let pool = pool(config, handlers, "emergency");
        // Hold the one permit so a normal-path question would block forever.
        let _permit = pool.semaphore.clone().acquire_owned().await.unwrap();
        let outcome = pool.process_question(question("hardware.critical.disk", "critical"), 0).await;
        assert!(matches!(outcome, QuestionOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn three_consecutive_same_reason_failures_trigger_failure_pattern_signal() {
        let handlers = QuestionHandlers {
            module: always_fails("parse error"),
            systemd: always_fails("parse error"),
            generic: always_fails("parse error"),
        };
        let pool = pool(WorkerPoolConfig::default(), handlers, "failure-pattern");
        let mut sub = pool.bus.subscribe_topic("AFFECT_TASK_FAILURE_PATTERN");

        for i in 0..3 {
            pool.process_question(question(&format!("curiosity.adhoc.{i}"), "medium"), 0).await;
        }
        let signal = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await.unwrap().unwrap();
        assert_eq!(signal.fact_str("capability_key"), Some("cap.key"));
    }

    #[tokio::test]
    async fn set_max_concurrent_shrinks_and_grows_permits() {
        let handlers = QuestionHandlers { module: always_completes(), systemd: always_completes(), generic: always_completes() };
        let pool = pool(WorkerPoolConfig { max_concurrent_investigations: 4, ..WorkerPoolConfig::default() }, handlers, "throttle");
        assert_eq!(pool.semaphore.available_permits(), 4);
        pool.set_max_concurrent(1);
        assert_eq!(pool.semaphore.available_permits(), 1);
        pool.set_max_concurrent(3);
        assert_eq!(pool.semaphore.available_permits(), 3);
    }

    #[tokio::test]
    async fn not_relevant_archive_question_is_skipped() {
        let handlers = QuestionHandlers { module: always_completes(), systemd: always_completes(), generic: always_fails("should not run") };
        let pool = pool(WorkerPoolConfig::default(), handlers, "not-relevant");
        let q = CuriosityQuestion::new(
            "pattern.archive.missing",
            "hyp",
            "still relevant?",
            vec!["archive_path: /nonexistent/path/for/sure".to_string()],
            "medium",
            "cap.key",
        );
        let outcome = pool.process_question(q, 0).await;
        assert!(matches!(outcome, QuestionOutcome::NotRelevantSkipped));
    }

    #[tokio::test]
    async fn metrics_summary_publishes_and_resets_counters() {
        let handlers = QuestionHandlers { module: always_completes(), systemd: always_completes(), generic: always_completes() };
        let pool = pool(WorkerPoolConfig::default(), handlers, "metrics");
        pool.process_question(question("curiosity.adhoc.a", "medium"), 0).await;
        assert_eq!(pool.completed_count(), 1);

        let mut sub = pool.bus.subscribe_topic("METRICS_SUMMARY");
        pool.emit_metrics_summary(10);
        let signal = sub.recv().await.unwrap();
        assert_eq!(signal.facts.get("completed").and_then(|v| v.as_i64()), Some(1));
        assert_eq!(pool.completed_count(), 0); // swapped back to zero after the tick
    }

    #[tokio::test]
    async fn metrics_summary_over_fifty_queue_depth_emits_bottleneck() {
        let handlers = QuestionHandlers { module: always_completes(), systemd: always_completes(), generic: always_completes() };
        let pool = pool(WorkerPoolConfig::default(), handlers, "bottleneck");
        let mut sub = pool.bus.subscribe_topic("BOTTLENECK_DETECTED");
        pool.emit_metrics_summary(51);
        let signal = sub.recv().await.unwrap();
        assert_eq!(signal.intensity, 2.0);
    }
}
