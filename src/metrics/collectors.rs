//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    BREAKER_TRANSITIONS_TOTAL, CACHE_LOOKUPS_TOTAL, CAPABILITY_CALLS_TOTAL,
    GROUNDING_CHECKS_TOTAL, TASKS_TOTAL, TASK_DURATION,
};

/// Outcome label for a capability call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcomeLabel {
    Success,
    Cached,
    TransientError,
    PermanentError,
    Rejected,
}

impl CallOutcomeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcomeLabel::Success => "success",
            CallOutcomeLabel::Cached => "cached",
            CallOutcomeLabel::TransientError => "transient_error",
            CallOutcomeLabel::PermanentError => "permanent_error",
            CallOutcomeLabel::Rejected => "rejected",
        }
    }
}

/// Records orchestrator metrics.
///
/// Every method is a no-op until [`init_metrics`](super::init_metrics) has run.
///
/// ```ignore
/// use research_orchestrator::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_breaker_transition("literature-search", "closed", "open");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a breaker state change.
    pub fn record_breaker_transition(&self, capability: &str, from: &str, to: &str) {
        if let Some(counter) = BREAKER_TRANSITIONS_TOTAL.get() {
            counter.with_label_values(&[capability, from, to]).inc();
        }
    }

    /// Record one call through the protected wrapper.
    pub fn record_capability_call(&self, capability: &str, outcome: CallOutcomeLabel) {
        if let Some(counter) = CAPABILITY_CALLS_TOTAL.get() {
            counter
                .with_label_values(&[capability, outcome.as_str()])
                .inc();
        }
    }

    /// Record a response cache lookup.
    pub fn record_cache_lookup(&self, hit: bool) {
        if let Some(counter) = CACHE_LOOKUPS_TOTAL.get() {
            counter
                .with_label_values(&[if hit { "hit" } else { "miss" }])
                .inc();
        }
    }

    /// Record a grounding check result.
    pub fn record_grounding_check(&self, passed: bool) {
        if let Some(counter) = GROUNDING_CHECKS_TOTAL.get() {
            counter
                .with_label_values(&[if passed { "true" } else { "false" }])
                .inc();
        }
    }

    /// Record a task reaching a terminal state.
    ///
    /// # Arguments
    ///
    /// * `status` - Terminal status ("succeeded", "failed")
    /// * `capability` - Capability the task targeted
    /// * `duration_secs` - Wall-clock time from start to completion
    pub fn record_task(&self, status: &str, capability: &str, duration_secs: f64) {
        if let Some(counter) = TASKS_TOTAL.get() {
            counter.with_label_values(&[status]).inc();
        }
        if let Some(histogram) = TASK_DURATION.get() {
            histogram
                .with_label_values(&[capability])
                .observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            capability = capability,
            duration_secs = duration_secs,
            "Recorded task metric"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_before_and_after_init() {
        let collector = MetricsCollector::new();
        collector.record_cache_lookup(true);

        init_metrics().expect("metrics init");
        collector.record_breaker_transition("test-capability", "closed", "open");
        collector.record_capability_call("test-capability", CallOutcomeLabel::Rejected);
        collector.record_grounding_check(false);
        collector.record_task("failed", "test-capability", 0.3);

        let text = export_metrics();
        assert!(text.contains("orchestrator_breaker_transitions_total"));
        assert!(text.contains("test-capability"));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(CallOutcomeLabel::TransientError.as_str(), "transient_error");
        assert_eq!(CallOutcomeLabel::Cached.as_str(), "cached");
    }
}
