//! Error types for research-orchestrator operations.
//!
//! The taxonomy follows how failures propagate through a request:
//! - [`PlanningError`]: malformed or cyclic plans, rejected before any side effect
//! - [`DependencyResolutionError`]: a task parameter could not be resolved from upstream output
//! - [`CapabilityError`]: a provider call failed, either transient or permanent
//! - [`GroundingViolation`]: generated text cited identifiers that could not be verified
//! - [`TaskError`]: the per-task failure recorded in an aggregated result
//! - [`LlmError`]: chat-completions client failures

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::grounding::GroundingCheck;
use crate::plan::TaskStatus;
use crate::utils::json_extraction::JsonExtractionError;

/// Errors that reject a plan before execution begins.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanningError {
    #[error("Plan contains no tasks")]
    EmptyPlan,

    #[error("Task id '{0}' appears more than once in the plan")]
    DuplicateTaskId(String),

    #[error("Task '{task}' references unknown task in '{reference}'")]
    UnknownReference { task: String, reference: String },

    #[error("Task '{0}' references its own output")]
    SelfReference(String),

    #[error("Dependency cycle detected involving tasks: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("Task '{task}' targets unregistered capability '{capability}'")]
    UnknownCapability { task: String, capability: String },

    #[error("Task '{task}': capability '{capability}' does not support operation '{operation}'")]
    UnsupportedOperation {
        task: String,
        capability: String,
        operation: String,
    },

    #[error("Task '{task}' is declared as '{declared}' but capability '{capability}' is '{actual}'")]
    KindMismatch {
        task: String,
        capability: String,
        declared: String,
        actual: String,
    },

    #[error("Task '{task}' has malformed reference '{raw}': {reason}")]
    MalformedReference {
        task: String,
        raw: String,
        reason: String,
    },

    #[error("Plan does not match schema: {0}")]
    Schema(String),

    #[error("Could not extract plan from planner output: {0}")]
    Extraction(#[from] JsonExtractionError),

    #[error("Plan generation failed: {0}")]
    Generation(String),
}

/// Errors raised when a task's parameters cannot be resolved from upstream outputs.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyResolutionError {
    #[error("Referenced task '{task}' does not exist (reference '{reference}')")]
    MissingTask { task: String, reference: String },

    #[error("Referenced task '{task}' has not succeeded (status: {status})")]
    NotSucceeded { task: String, status: TaskStatus },

    #[error("Referenced task '{task}' returned no data: its capability is temporarily unavailable")]
    Unavailable { task: String },

    #[error("Field '{path}' not found in output of task '{task}'")]
    MissingField { task: String, path: String },

    #[error("Upstream task '{task}' failed")]
    UpstreamFailed { task: String },
}

/// Classification of a transient capability failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Timeout,
    Connection,
    RateLimited,
    Unavailable,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::Connection => write!(f, "connection"),
            TransientKind::RateLimited => write!(f, "rate_limited"),
            TransientKind::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Errors returned by a capability call.
///
/// Only [`CapabilityError::Transient`] counts against a circuit breaker.
/// Everything else describes a bad request rather than an unhealthy provider.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityError {
    #[error("Transient failure in '{capability}' ({kind}): {message}")]
    Transient {
        capability: String,
        kind: TransientKind,
        message: String,
    },

    #[error("Permanent failure in '{capability}': {message}")]
    Permanent { capability: String, message: String },

    #[error("Capability '{capability}' is not registered")]
    UnknownCapability { capability: String },

    #[error("Capability '{capability}' does not support operation '{operation}'")]
    UnsupportedOperation {
        capability: String,
        operation: String,
    },
}

impl CapabilityError {
    /// Build a transient error.
    pub fn transient(
        capability: impl Into<String>,
        kind: TransientKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Transient {
            capability: capability.into(),
            kind,
            message: message.into(),
        }
    }

    /// Build a permanent error.
    pub fn permanent(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            capability: capability.into(),
            message: message.into(),
        }
    }

    /// Whether this failure should be counted by the capability's breaker.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Name of the capability that produced the error.
    pub fn capability(&self) -> &str {
        match self {
            Self::Transient { capability, .. }
            | Self::Permanent { capability, .. }
            | Self::UnknownCapability { capability }
            | Self::UnsupportedOperation { capability, .. } => capability,
        }
    }
}

/// Generated text cited identifiers absent from the verified results.
///
/// Recorded on the task outcome; never surfaced as a task failure.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error(
    "Task '{task_id}' cited {} unverified identifier(s)",
    .check.unverified_ids.len()
)]
pub struct GroundingViolation {
    pub task_id: String,
    pub check: GroundingCheck,
}

/// Failure recorded against a single task.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskError {
    #[error("Unresolved dependency: {0}")]
    Dependency(#[from] DependencyResolutionError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Task cancelled before completion")]
    Cancelled,
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Context length exceeded: {limit} tokens")]
    ContextLengthExceeded { limit: u32 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Map this error onto the capability taxonomy.
    ///
    /// Network, timeout, rate-limit and server-side failures are transient.
    /// Client-side rejections (bad request, context overflow, auth) are permanent.
    pub fn into_capability_error(self, capability: &str) -> CapabilityError {
        let message = self.to_string();
        match self {
            LlmError::RequestFailed(_) => {
                CapabilityError::transient(capability, TransientKind::Connection, message)
            }
            LlmError::Timeout(_) => {
                CapabilityError::transient(capability, TransientKind::Timeout, message)
            }
            LlmError::RateLimited(_) => {
                CapabilityError::transient(capability, TransientKind::RateLimited, message)
            }
            LlmError::ParseError(_) => {
                CapabilityError::transient(capability, TransientKind::Unavailable, message)
            }
            LlmError::ApiError { code, .. } if code == 408 => {
                CapabilityError::transient(capability, TransientKind::Timeout, message)
            }
            LlmError::ApiError { code, .. } if code >= 500 => {
                CapabilityError::transient(capability, TransientKind::Unavailable, message)
            }
            LlmError::ApiError { .. }
            | LlmError::ContextLengthExceeded { .. }
            | LlmError::MissingApiBase => CapabilityError::permanent(capability, message),
        }
    }
}
