//! Cognitive Action bodies — the work the self-regulator's
//! [`CognitiveAction`](crate::affect::CognitiveAction) gate actually runs
//! once a pressure signal clears cooldown and the emergency brake.
//!
//! Each function here is free-standing (no dependency on [`SelfRegulator`](crate::affect::SelfRegulator)
//! itself) so it can be unit-tested directly and wired into
//! `SelfRegulator::run_ready_actions` by the caller that owns a
//! [`MemoryStore`] and [`InvestigationLog`] handle.

use std::collections::HashMap;

use synapse_bus::ChemBus;
use synapse_memory::{InvestigationLog, MemoryStore};
use synapse_types::{InvestigationRecord, InvestigationStatus, MemoryEvent, Signal};

use crate::affect::PressureLevel;

/// Recent-activity window `summarize_context` treats as still "in context".
const RECENT_WINDOW: usize = 10;
/// Additional older activity folded into one summary beyond the recent window.
const OLDER_WINDOW: usize = 50;

/// How far back `archive_completed_tasks` and the failure/performance scans
/// look into the investigation log.
const ARCHIVE_SCAN_LIMIT: usize = 200;
const PERFORMANCE_SCAN_LIMIT: usize = 100;
const FAILURE_SCAN_LIMIT: usize = 200;

/// An investigation slower than this is flagged by `optimize_performance`.
const SLOW_INVESTIGATION_MS: u64 = 30_000;

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

/// Fold investigation activity older than [`RECENT_WINDOW`] into one
/// episodic summary event, verifying it is retrievable by id before
/// returning success. A no-op (success) if there is nothing older than the
/// recent window to compress.
pub async fn summarize_context(memory: &MemoryStore, investigations: &InvestigationLog) -> Result<(), String> {
    let window = investigations.recent(RECENT_WINDOW + OLDER_WINDOW);
    let older: Vec<InvestigationRecord> = window.into_iter().skip(RECENT_WINDOW).collect();
    if older.is_empty() {
        return Ok(());
    }

    let turns_compressed = older.len();
    let summary_text = format!(
        "{turns_compressed} investigation(s) condensed: {}",
        older.iter().map(|r| r.question_id.as_str()).collect::<Vec<_>>().join(", ")
    );
    let event = MemoryEvent {
        metadata: serde_json::json!({
            "reason": "context_pressure",
            "turns_compressed": turns_compressed,
        }),
        ..MemoryEvent::new("episodic_summary", format!("Context archived: {}", truncate(&summary_text, 200)))
    };
    memory.store_and_verify(&event).await.map_err(|e| e.to_string())?;
    Ok(())
}

/// Archive recently completed investigations into one episodic summary
/// event, verifying the round trip. A no-op (success) if nothing completed
/// recently.
pub async fn archive_completed_tasks(memory: &MemoryStore, investigations: &InvestigationLog) -> Result<(), String> {
    let completed: Vec<InvestigationRecord> = investigations
        .recent(ARCHIVE_SCAN_LIMIT)
        .into_iter()
        .filter(|r| r.status == InvestigationStatus::Completed)
        .collect();
    if completed.is_empty() {
        return Ok(());
    }

    let archived_count = completed.len();
    let question_ids: Vec<String> = completed.iter().map(|r| r.question_id.clone()).collect();
    let summary = format!("{archived_count} completed investigation(s) archived: {}", question_ids.join(", "));
    let event = MemoryEvent {
        metadata: serde_json::json!({
            "reason": "task_archival",
            "archived_count": archived_count,
            "question_ids": question_ids,
        }),
        ..MemoryEvent::new("episodic_summary", truncate(&summary, 200))
    };
    memory.store_and_verify(&event).await.map_err(|e| e.to_string())?;
    Ok(())
}

/// Re-publish `INVESTIGATION_THROTTLE_REQUEST` for the current pressure
/// level. Distinct from [`SelfRegulator::handle_signal`](crate::affect::SelfRegulator::handle_signal)'s
/// own publish-on-escalation: this re-asserts the current cap on its own
/// cooldown, so a worker pool that joined or reconnected after the
/// escalating signal still learns the active limit.
pub async fn throttle_investigations(bus: &ChemBus, level: PressureLevel) -> Result<(), String> {
    let signal = Signal::new("INVESTIGATION_THROTTLE_REQUEST")
        .with_fact("requested_concurrency", level.max_concurrent() as i64)
        .with_fact("min_delay_ms", level.min_delay().as_millis() as i64)
        .with_fact("pressure_level", format!("{level:?}").to_lowercase());
    bus.publish(signal).map_err(|e| e.to_string())?;
    Ok(())
}

/// Scan recent investigations for slow outliers and propose an
/// optimization, publishing `PERFORMANCE_OPTIMIZATION_PROPOSED` and
/// persisting the proposal as an `action` event. A no-op (success) if
/// nothing recent is unusually slow.
pub async fn optimize_performance(
    memory: &MemoryStore,
    investigations: &InvestigationLog,
    bus: &ChemBus,
) -> Result<(), String> {
    let recent = investigations.recent(PERFORMANCE_SCAN_LIMIT);
    if recent.is_empty() {
        return Ok(());
    }

    let avg_duration_ms = recent.iter().map(|r| r.duration_ms).sum::<u64>() / recent.len() as u64;
    let slow: Vec<&InvestigationRecord> = recent.iter().filter(|r| r.duration_ms > SLOW_INVESTIGATION_MS).collect();
    if slow.is_empty() {
        return Ok(());
    }

    let slowest = slow.iter().max_by_key(|r| r.duration_ms).map(|r| r.question_id.as_str()).unwrap_or("-");
    let proposal = format!(
        "{} of {} recent investigations exceeded {SLOW_INVESTIGATION_MS}ms (avg {avg_duration_ms}ms); slowest: {slowest}",
        slow.len(),
        recent.len(),
    );

    let signal = Signal::new("PERFORMANCE_OPTIMIZATION_PROPOSED")
        .with_fact("slow_count", slow.len() as i64)
        .with_fact("sample_size", recent.len() as i64)
        .with_fact("avg_duration_ms", avg_duration_ms as i64);
    let _ = bus.publish(signal);

    let event = MemoryEvent {
        metadata: serde_json::json!({
            "avg_duration_ms": avg_duration_ms,
            "slow_count": slow.len(),
            "sample_size": recent.len(),
        }),
        ..MemoryEvent::new("action", truncate(&proposal, 200))
    };
    memory.store_and_verify(&event).await.map_err(|e| e.to_string())?;
    Ok(())
}

/// Cluster recent investigation failures by failure reason and persist the
/// dominant pattern as an `analysis` event. A no-op (success) if nothing
/// recent failed.
pub async fn analyze_failure_patterns(memory: &MemoryStore, investigations: &InvestigationLog) -> Result<(), String> {
    let recent = investigations.recent(FAILURE_SCAN_LIMIT);
    let failures: Vec<&InvestigationRecord> =
        recent.iter().filter(|r| matches!(r.status, InvestigationStatus::Failed | InvestigationStatus::Timeout)).collect();
    if failures.is_empty() {
        return Ok(());
    }

    let mut clusters: HashMap<String, usize> = HashMap::new();
    for failure in &failures {
        let reason = failure.failure_reason.clone().unwrap_or_else(|| "unknown".to_string());
        *clusters.entry(reason).or_insert(0) += 1;
    }
    let mut clusters: Vec<(String, usize)> = clusters.into_iter().collect();
    clusters.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let finding = match clusters.first() {
        Some((reason, count)) => format!("{count} of {} recent failures share reason \"{reason}\"", failures.len()),
        None => format!("{} recent failures, no dominant pattern", failures.len()),
    };

    let event = MemoryEvent {
        metadata: serde_json::json!({
            "failure_count": failures.len(),
            "clusters": clusters,
        }),
        ..MemoryEvent::new("analysis", format!("Failure pattern analysis: {}", truncate(&finding, 180)))
    };
    memory.store_and_verify(&event).await.map_err(|e| e.to_string())?;
    Ok(())
}
