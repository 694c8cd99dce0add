//! `synapse-memory` – the Knowledge Base.
//!
//! Persistent state and recall for the introspection core, backed by local
//! SQLite databases and append-only JSONL logs.
//!
//! # Modules
//!
//! - [`memory_store`] – [`MemoryStore`][memory_store::MemoryStore]: append-only
//!   episodic event storage with write-then-verify durability checks and an
//!   integrity sweep (`consistency_check`).
//! - [`vector_index`] – [`VectorIndex`][vector_index::VectorIndex]: a local
//!   vector database supporting idempotent upserts and cosine-similarity
//!   top-k recall, scoped by collection.
//! - [`processed_log`] – [`ProcessedQuestionLog`][processed_log::ProcessedQuestionLog],
//!   [`InvestigationLog`][processed_log::InvestigationLog], and
//!   [`DeadLetterQueue`][processed_log::DeadLetterQueue]: append-only JSONL
//!   logs written with an atomic rename, each rebuilding its in-memory index
//!   from disk at startup.

pub mod memory_store;
pub mod processed_log;
pub mod vector_index;

pub use memory_store::{ConsistencyReport, EventFilter, MemoryStore};
pub use processed_log::{DeadLetterQueue, InvestigationLog, ProcessedQuestionLog};
pub use vector_index::{QueryFilter, VectorIndex};
