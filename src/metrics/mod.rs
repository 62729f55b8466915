//! Prometheus metrics for breakers, capability calls, caching, grounding and tasks.
//!
//! ```ignore
//! use research_orchestrator::metrics::{export_metrics, init_metrics};
//!
//! init_metrics()?;
//! // ... run requests ...
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{CallOutcomeLabel, MetricsCollector};
pub use self::prometheus::{
    export_metrics, init_metrics, BREAKER_TRANSITIONS_TOTAL, CACHE_LOOKUPS_TOTAL,
    CAPABILITY_CALLS_TOTAL, GROUNDING_CHECKS_TOTAL, REGISTRY, TASKS_TOTAL, TASK_DURATION,
};
