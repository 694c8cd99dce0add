//! [`LoopGuard`] – repeated-outcome detector.
//!
//! The investigation worker pool uses this to detect when the same
//! `capability_key` has failed for the same reason three or more times in a
//! row, so it can report an `AFFECT_TASK_FAILURE_PATTERN` signal without
//! waiting on the periodic metrics tick.
//!
//! # Algorithm
//!
//! The guard maintains a rolling window of the last *N* outcome labels.
//! After each [`LoopGuard::record`] call it checks whether the most recent
//! `threshold` entries are all identical.  If they are, [`record`] returns
//! `true` – meaning the caller should treat this as a detected pattern.
//!
//! # Example
//!
//! ```rust
//! use synapse_runtime::loop_guard::LoopGuard;
//!
//! let mut guard = LoopGuard::new(3);
//!
//! assert!(!guard.record("timeout: journal_parse"));
//! assert!(!guard.record("timeout: journal_parse"));
//! assert!(guard.record("timeout: journal_parse")); // third repeat → stuck!
//!
//! // Resetting clears the history.
//! guard.reset();
//! assert!(!guard.record("timeout: journal_parse"));
//! ```

use std::collections::VecDeque;

// ─────────────────────────────────────────────────────────────────────────────
// LoopGuard
// ─────────────────────────────────────────────────────────────────────────────

/// Detects when the LLM is stuck in a repetitive action loop.
///
/// Construct with [`LoopGuard::new`], passing the number of consecutive
/// identical actions that constitute a "stuck" condition.
pub struct LoopGuard {
    /// Number of consecutive identical records that triggers detection.
    threshold: usize,
    /// Rolling window of the most recent action labels.
    history: VecDeque<String>,
}

impl LoopGuard {
    /// Create a new guard.
    ///
    /// `threshold` is the minimum number of consecutive identical action
    /// labels that will be flagged as a loop.  A `threshold` of 1 would
    /// trigger on every action; values ≥ 2 are recommended.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            history: VecDeque::with_capacity(threshold),
        }
    }

    /// Record that `action` was just requested by the LLM.
    ///
    /// Returns `true` when the same action has been recorded `threshold` times
    /// in a row, indicating the system is stuck and an intervention is
    /// required.  Returns `false` otherwise.
    pub fn record(&mut self, action: &str) -> bool {
        self.history.push_back(action.to_string());
        // Keep only the last `threshold` entries.
        while self.history.len() > self.threshold {
            self.history.pop_front();
        }
        self.is_stuck()
    }

    /// Return `true` if the current history constitutes a loop.
    ///
    /// This is `true` when the window is full *and* every entry is identical.
    pub fn is_stuck(&self) -> bool {
        if self.history.len() < self.threshold {
            return false;
        }
        let first = &self.history[0];
        self.history.iter().all(|a| a == first)
    }

    /// Clear all recorded history, resetting the guard to its initial state.
    pub fn reset(&mut self) {
        self.history.clear();
    }
}
