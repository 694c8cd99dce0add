//! Affective Self-Regulator — reacts to resource-pressure signals by
//! adjusting investigation concurrency and running cooldown-gated cognitive
//! actions.
//!
//! Subscribes to `AFFECT_MEMORY_PRESSURE`, `AFFECT_CONTEXT_OVERFLOW`,
//! `AFFECT_TASK_FAILURE_PATTERN`, and `AFFECT_RESOURCE_STRAIN`. A signal's
//! `severity` fact (`"critical"` or `"high"`) raises the current
//! [`PressureLevel`]; 60 seconds without a further pressure signal lowers it
//! by one step. Each pressure level maps to a concurrency cap and an
//! inter-investigation delay applied to the [`WorkerPool`](crate::investigator::WorkerPool)
//! via `INVESTIGATION_THROTTLE_REQUEST`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use synapse_bus::ChemBus;
use synapse_types::Signal;
use tokio::time::Instant;

/// How long without a fresh pressure signal before the level decays by one step.
const RECOVERY_WINDOW: Duration = Duration::from_secs(60);

/// Default per-action cooldown: a cognitive action may not re-run within
/// this window of its previous run.
const DEFAULT_ACTION_COOLDOWN: Duration = Duration::from_secs(300);

const BASELINE_MIN_DELAY: Duration = Duration::from_millis(500);
const MAX_MIN_DELAY: Duration = Duration::from_millis(5_000);

/// How concerned the system currently is about its own resource use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal = 0,
    Elevated = 1,
    Critical = 2,
}

impl PressureLevel {
    fn from_u8(n: u8) -> Self {
        match n {
            0 => PressureLevel::Normal,
            1 => PressureLevel::Elevated,
            _ => PressureLevel::Critical,
        }
    }

    /// Worker-pool concurrency cap at this level.
    pub fn max_concurrent(self) -> usize {
        match self {
            PressureLevel::Normal => 4,
            PressureLevel::Elevated => 2,
            PressureLevel::Critical => 1,
        }
    }

    /// Minimum delay between investigations at this level.
    pub fn min_delay(self) -> Duration {
        match self {
            PressureLevel::Normal => BASELINE_MIN_DELAY,
            PressureLevel::Elevated => (BASELINE_MIN_DELAY + MAX_MIN_DELAY) / 2,
            PressureLevel::Critical => MAX_MIN_DELAY,
        }
    }
}

/// The five cognitive actions the regulator may run under pressure, each
/// independently cooldown-gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CognitiveAction {
    SummarizeContext,
    ArchiveCompletedTasks,
    ThrottleInvestigations,
    OptimizePerformance,
    AnalyzeFailurePatterns,
}

impl CognitiveAction {
    fn label(self) -> &'static str {
        match self {
            CognitiveAction::SummarizeContext => "summarize_context",
            CognitiveAction::ArchiveCompletedTasks => "archive_completed_tasks",
            CognitiveAction::ThrottleInvestigations => "throttle_investigations",
            CognitiveAction::OptimizePerformance => "optimize_performance",
            CognitiveAction::AnalyzeFailurePatterns => "analyze_failure_patterns",
        }
    }

    const ALL: [CognitiveAction; 5] = [
        CognitiveAction::SummarizeContext,
        CognitiveAction::ArchiveCompletedTasks,
        CognitiveAction::ThrottleInvestigations,
        CognitiveAction::OptimizePerformance,
        CognitiveAction::AnalyzeFailurePatterns,
    ];
}

/// Per-action last-run timestamps, guarding each action's cooldown.
#[derive(Default)]
struct ActionCooldowns {
    last_run: Mutex<std::collections::HashMap<&'static str, Instant>>,
}

impl ActionCooldowns {
    /// `true` iff `action` may run now (never run before, or its cooldown has
    /// elapsed). Does not itself record the run — call [`Self::record`] after
    /// the action completes.
    fn is_ready(&self, action: CognitiveAction, cooldown: Duration) -> bool {
        let last_run = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        match last_run.get(action.label()) {
            Some(instant) => instant.elapsed() >= cooldown,
            None => true,
        }
    }

    fn record(&self, action: CognitiveAction) {
        self.last_run.lock().unwrap_or_else(|e| e.into_inner()).insert(action.label(), Instant::now());
    }
}

/// Reacts to affect signals and adapts investigation throughput.
///
/// Every cognitive action checks [`SelfRegulator::emergency_brake_engaged`]
/// before running — an operator can drop a sentinel file at the configured
/// path to suppress all cognitive actions immediately, regardless of
/// cooldown state.
pub struct SelfRegulator {
    bus: ChemBus,
    level: AtomicU8,
    last_pressure_signal: Mutex<Option<Instant>>,
    cooldowns: ActionCooldowns,
    action_cooldown: Duration,
    emergency_brake_path: std::path::PathBuf,
}

impl SelfRegulator {
    pub fn new(bus: ChemBus, emergency_brake_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            bus,
            level: AtomicU8::new(PressureLevel::Normal as u8),
            last_pressure_signal: Mutex::new(None),
            cooldowns: ActionCooldowns::default(),
            action_cooldown: DEFAULT_ACTION_COOLDOWN,
            emergency_brake_path: emergency_brake_path.into(),
        }
    }

    pub fn with_action_cooldown(mut self, cooldown: Duration) -> Self {
        self.action_cooldown = cooldown;
        self
    }

    pub fn level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.level.load(Ordering::SeqCst))
    }

    /// `true` iff the emergency-brake sentinel file is present.
    pub fn emergency_brake_engaged(&self) -> bool {
        self.emergency_brake_path.exists()
    }

    /// Handle one signal arriving on any of the four affect topics. Returns
    /// the new pressure level after processing, and publishes
    /// `INVESTIGATION_THROTTLE_REQUEST` if the level changed.
    pub fn handle_signal(&self, signal: &Signal) -> PressureLevel {
        let severity = signal.fact_str("severity").unwrap_or("");
        let previous = self.level();
        let target = match severity {
            "critical" => PressureLevel::Critical,
            "high" => previous.max(PressureLevel::Elevated),
            _ => previous,
        };

        if target > previous {
            self.level.store(target as u8, Ordering::SeqCst);
            *self.last_pressure_signal.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            self.publish_throttle_request(target);
        } else {
            *self.last_pressure_signal.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        }
        self.level()
    }

    /// Decay the pressure level by one step if [`RECOVERY_WINDOW`] has
    /// elapsed since the last pressure signal. Intended to be polled
    /// periodically by the caller's supervisor loop.
    pub fn check_recovery(&self) -> PressureLevel {
        let last = *self.last_pressure_signal.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.level();
        if current == PressureLevel::Normal {
            return current;
        }
        let Some(last) = last else { return current };
        if last.elapsed() < RECOVERY_WINDOW {
            return current;
        }

        let decayed = PressureLevel::from_u8(current as u8 - 1);
        self.level.store(decayed as u8, Ordering::SeqCst);
        *self.last_pressure_signal.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.publish_throttle_request(decayed);
        decayed
    }

    fn publish_throttle_request(&self, level: PressureLevel) {
        let signal = Signal::new("INVESTIGATION_THROTTLE_REQUEST")
            .with_fact("requested_concurrency", level.max_concurrent() as i64)
            .with_fact("min_delay_ms", level.min_delay().as_millis() as i64)
            .with_fact("pressure_level", format!("{level:?}").to_lowercase());
        let _ = self.bus.publish(signal);
    }

    /// Attempt to run `action` if its cooldown has elapsed and the emergency
    /// brake is not engaged. Returns `true` if it ran.
    ///
    /// `run` performs the actual work and is only invoked when the gate
    /// passes; its result is logged but not otherwise interpreted.
    pub async fn try_run<F, Fut>(&self, action: CognitiveAction, run: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        if self.emergency_brake_engaged() {
            tracing::warn!(action = action.label(), "emergency brake engaged, skipping cognitive action");
            return false;
        }
        if !self.cooldowns.is_ready(action, self.action_cooldown) {
            return false;
        }

        tracing::info!(action = action.label(), "cognitive action starting");
        let result = run().await;
        self.cooldowns.record(action);
        match result {
            Ok(()) => tracing::info!(action = action.label(), "cognitive action completed"),
            Err(ref e) => tracing::warn!(action = action.label(), error = %e, "cognitive action failed"),
        }
        result.is_ok()
    }

    /// Run every cognitive action whose cooldown has elapsed, in a fixed
    /// order, using `run` to perform the actual work for each.
    pub async fn run_ready_actions<F, Fut>(&self, mut run: F)
    where
        F: FnMut(CognitiveAction) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        for action in CognitiveAction::ALL {
            self.try_run(action, || run(action)).await;
        }
    }
}
