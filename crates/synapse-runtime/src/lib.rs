//! `synapse-runtime` – the introspection core's daemons.
//!
//! The tasks that observe the running system, decide what warrants
//! investigation, carry investigations out, and adapt behavior under
//! resource pressure.
//!
//! # Modules
//!
//! - [`sources`] – [`JournalSource`][sources::JournalSource],
//!   [`FileWatcherSource`][sources::FileWatcherSource],
//!   [`SystemdAuditSource`][sources::SystemdAuditSource],
//!   [`MetricsSource`][sources::MetricsSource], and
//!   [`DeadLetterMonitor`][sources::DeadLetterMonitor]: independent producers
//!   that stream [`Event`](synapse_types::Event)s from journald, the
//!   filesystem, systemd, a Prometheus scrape target, and the dead-letter
//!   queue respectively, each classifying what it observes into a typed
//!   event kind.
//! - [`rules`] – [`RuleEngine`][rules::RuleEngine]: a priority-ordered,
//!   rate-limited dispatcher that turns classified events into
//!   [`Intent`](synapse_types::Intent)s.
//! - [`llm_driver`] – [`AnalysisDriver`][llm_driver::AnalysisDriver]: an
//!   OpenAI-compatible HTTP client, selectable between
//!   [`AnalysisBackend::Ollama`][llm_driver::AnalysisBackend::Ollama] and
//!   [`AnalysisBackend::OpenAiCompatible`][llm_driver::AnalysisBackend::OpenAiCompatible],
//!   used by investigation handlers to reason over evidence.
//! - [`loop_guard`] – [`LoopGuard`][loop_guard::LoopGuard]: a rolling-window
//!   repeated-outcome detector used to flag a `capability_key` that keeps
//!   failing for the same reason.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: initialises
//!   the global `tracing` subscriber with an optional OTLP span exporter.
//!   Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export to
//!   Jaeger, Grafana Tempo, or any OTLP-compatible collector.
//! - [`router`] – [`IntentRouter`][router::IntentRouter]: persists intents
//!   atomically to the intents directory, prunes entries older than 24 h,
//!   and translates them into ChemBus signals, maintaining a dead-letter
//!   file for undeliverable signals.
//! - [`investigator`] – [`WorkerPool`][investigator::WorkerPool]: the
//!   investigation worker pool that executes curiosity questions end to
//!   end (meta-loop filter, queue-depth check, priority routing, timeout
//!   and decomposition, outcome recording).
//! - [`affect`] – [`SelfRegulator`][affect::SelfRegulator]: observes
//!   resource-pressure signals and adapts worker concurrency and
//!   per-action cognitive behavior.
//! - [`cognitive_actions`] – the five action bodies
//!   [`SelfRegulator`][affect::SelfRegulator] gates: context summarization,
//!   completed-task archival, investigation throttling, performance
//!   optimization proposals, and failure-pattern analysis.
//! - [`scanner`] – [`UnindexedKnowledgeScanner`][scanner::UnindexedKnowledgeScanner]:
//!   walks the filesystem for undocumented or stale-indexed knowledge and
//!   emits capped, priority-sorted curiosity questions.

pub mod affect;
pub mod cognitive_actions;
pub mod investigator;
pub mod llm_driver;
pub mod loop_guard;
pub mod router;
pub mod rules;
pub mod scanner;
pub mod sources;
pub mod telemetry;

pub use affect::{CognitiveAction, PressureLevel, SelfRegulator};
pub use investigator::WorkerPool;
pub use llm_driver::{AnalysisBackend, AnalysisDriver, ChatMessage, LlmError, Role};
pub use loop_guard::LoopGuard;
pub use router::IntentRouter;
pub use rules::RuleEngine;
pub use scanner::UnindexedKnowledgeScanner;
pub use telemetry::{init_tracing, TracerProviderGuard};

// Re-export the kernel gating primitives so runtime orchestration code can
// hold and use them without an additional explicit dependency on
// synapse-kernel.
pub use synapse_kernel::{ComponentHealth, GateRejection, InvestigationGate, MetaLoopFilter, Watchdog};
