//! Prometheus metrics registration and export.
//!
//! All metrics live in process-wide `OnceLock`s and are created by
//! [`init_metrics`]. Until then every recording call is a no-op, which keeps
//! library users and tests free of global setup.

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all orchestrator metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Breaker state transitions, labeled by capability, from and to.
pub static BREAKER_TRANSITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Capability calls, labeled by capability and outcome
/// (success, transient_error, permanent_error, rejected, cached).
pub static CAPABILITY_CALLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Response cache lookups, labeled by result (hit, miss).
pub static CACHE_LOOKUPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Grounding checks, labeled by passed (true, false).
pub static GROUNDING_CHECKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Tasks reaching a terminal state, labeled by status.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task wall-clock duration in seconds, labeled by capability.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric cannot be created or registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let breaker_transitions = CounterVec::new(
        Opts::new(
            "orchestrator_breaker_transitions_total",
            "Circuit breaker state transitions",
        ),
        &["capability", "from", "to"],
    )?;

    let capability_calls = CounterVec::new(
        Opts::new(
            "orchestrator_capability_calls_total",
            "Capability calls by outcome",
        ),
        &["capability", "outcome"],
    )?;

    let cache_lookups = CounterVec::new(
        Opts::new("orchestrator_cache_lookups_total", "Response cache lookups"),
        &["result"],
    )?;

    let grounding_checks = CounterVec::new(
        Opts::new(
            "orchestrator_grounding_checks_total",
            "Grounding checks on generated text",
        ),
        &["passed"],
    )?;

    let tasks_total = CounterVec::new(
        Opts::new("orchestrator_tasks_total", "Tasks reaching a terminal state"),
        &["status"],
    )?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "orchestrator_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["capability"],
    )?;

    registry.register(Box::new(breaker_transitions.clone()))?;
    registry.register(Box::new(capability_calls.clone()))?;
    registry.register(Box::new(cache_lookups.clone()))?;
    registry.register(Box::new(grounding_checks.clone()))?;
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = BREAKER_TRANSITIONS_TOTAL.set(breaker_transitions);
    let _ = CAPABILITY_CALLS_TOTAL.set(capability_calls);
    let _ = CACHE_LOOKUPS_TOTAL.set(cache_lookups);
    let _ = GROUNDING_CHECKS_TOTAL.set(grounding_checks);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics if [`init_metrics`] has not run.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_init() {
        let _ = init_metrics();
        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
    }
}
