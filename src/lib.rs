//! research_orchestrator: multi-step task orchestration over research capabilities.
//!
//! A natural-language request is classified by the [`router`], turned into an
//! [`ExecutionPlan`] of capability calls, and executed by the
//! [`orchestrator`] with per-capability circuit breakers, a response cache,
//! and grounding checks on generated text.

// Core modules
pub mod breaker;
pub mod capability;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod grounding;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod plan;
pub mod protection;
pub mod router;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError, EngineResponse};
pub use error::{
    CapabilityError, DependencyResolutionError, GroundingViolation, LlmError, PlanningError,
    TaskError,
};
pub use orchestrator::{AggregatedResult, OverallStatus, TaskOrchestrator};
pub use plan::{ExecutionPlan, TaskSpec, TaskStatus};
pub use router::{QueryRouter, RouteDecision};
