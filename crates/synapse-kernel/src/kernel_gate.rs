//! [`InvestigationGate`] – single interception point before a curiosity
//! question is handed to a worker.
//!
//! Before a [`CuriosityQuestion`] reaches the investigation worker pool, it
//! must pass through [`InvestigationGate::admit`]. This method enforces
//! **two independent checks** in order:
//!
//! 1. **Meta-loop filter** ([`MetaLoopFilter`]): a question whose id carries
//!    one of the configured meta prefixes (e.g. `"meta."`,
//!    `"investigation."`) is rejected outright — investigating the
//!    investigation system must never spawn new investigations.
//! 2. **Queue-depth check**: if the current pending-question count is at or
//!    above `max_queue_depth`, the question is rejected with the queue
//!    depth and limit so the caller can publish `INVESTIGATION_QUEUE_FULL`.
//!
//! Only when both checks pass is the caller permitted to route the question
//! to a worker.

use synapse_types::CuriosityQuestion;

/// Checks whether a question id is a meta-investigation (investigating the
/// introspection system itself), which must be dropped to avoid recursion.
pub struct MetaLoopFilter {
    prefixes: Vec<String>,
}

impl MetaLoopFilter {
    /// The reference prefix list. Exposed as a default, not a hardcoded
    /// constant elsewhere — callers that need a different list should
    /// construct via [`MetaLoopFilter::with_prefixes`] from configuration.
    pub fn default_prefixes() -> Vec<String> {
        vec![
            "meta.".to_string(),
            "investigation.".to_string(),
            "curiosity.processor.".to_string(),
            "archive.system.".to_string(),
        ]
    }

    pub fn new() -> Self {
        Self::with_prefixes(Self::default_prefixes())
    }

    pub fn with_prefixes(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    pub fn is_meta(&self, question_id: &str) -> bool {
        self.prefixes.iter().any(|p| question_id.starts_with(p.as_str()))
    }
}

impl Default for MetaLoopFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reason a [`CuriosityQuestion`] was rejected by [`InvestigationGate::admit`].
#[derive(Debug, Clone, PartialEq)]
pub enum GateRejection {
    /// The question id matched a meta-investigation prefix.
    MetaLoop,
    /// The pending-question queue is at or above its limit.
    QueueFull { queue_depth: usize, limit: usize },
}

/// The single gateway a worker-pool dispatcher passes every question
/// through before admitting it for execution.
pub struct InvestigationGate {
    meta_filter: MetaLoopFilter,
    max_queue_depth: usize,
}

impl InvestigationGate {
    pub fn new(meta_filter: MetaLoopFilter, max_queue_depth: usize) -> Self {
        Self {
            meta_filter,
            max_queue_depth,
        }
    }

    /// Admit `question` given the current pending-question count.
    ///
    /// # Errors
    ///
    /// - [`GateRejection::MetaLoop`] — the question id matches a
    ///   meta-investigation prefix.
    /// - [`GateRejection::QueueFull`] — `queue_depth >= max_queue_depth`.
    pub fn admit(
        &self,
        question: &CuriosityQuestion,
        queue_depth: usize,
    ) -> Result<(), GateRejection> {
        if self.meta_filter.is_meta(&question.id) {
            return Err(GateRejection::MetaLoop);
        }
        if queue_depth >= self.max_queue_depth {
            return Err(GateRejection::QueueFull {
                queue_depth,
                limit: self.max_queue_depth,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: &str) -> CuriosityQuestion {
        CuriosityQuestion::new(id, "hyp", "q?", vec!["ev".into()], "medium", "cap.key")
    }

    fn gate(max_queue_depth: usize) -> InvestigationGate {
        InvestigationGate::new(MetaLoopFilter::new(), max_queue_depth)
    }

    #[test]
    fn admits_normal_question_below_queue_limit() {
        let gate = gate(100);
        assert!(gate.admit(&question("discover.module.x"), 5).is_ok());
    }

    #[test]
    fn rejects_meta_prefixed_question() {
        let gate = gate(100);
        let result = gate.admit(&question("meta.rescan"), 5);
        assert_eq!(result, Err(GateRejection::MetaLoop));
    }

    #[test]
    fn rejects_investigation_prefixed_question() {
        let gate = gate(100);
        let result = gate.admit(&question("investigation.followup"), 0);
        assert_eq!(result, Err(GateRejection::MetaLoop));
    }

    #[test]
    fn queue_full_at_exactly_max_depth() {
        let gate = gate(100);
        let result = gate.admit(&question("discover.module.x"), 100);
        assert_eq!(
            result,
            Err(GateRejection::QueueFull {
                queue_depth: 100,
                limit: 100
            })
        );
    }

    #[test]
    fn queue_not_full_one_below_max_depth() {
        let gate = gate(100);
        assert!(gate.admit(&question("discover.module.x"), 99).is_ok());
    }

    #[test]
    fn meta_loop_filter_checked_before_queue_full() {
        // Even with the queue already over the limit, a meta question must
        // report MetaLoop, not QueueFull — meta rejection short-circuits.
        let gate = gate(1);
        let result = gate.admit(&question("meta.rescan"), 999);
        assert_eq!(result, Err(GateRejection::MetaLoop));
    }

    #[test]
    fn custom_prefix_list_from_configuration() {
        let filter = MetaLoopFilter::with_prefixes(vec!["custom.prefix.".to_string()]);
        assert!(filter.is_meta("custom.prefix.x"));
        assert!(!filter.is_meta("meta.rescan"));
    }
}
