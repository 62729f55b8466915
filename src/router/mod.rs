//! Query routing: classify a request and produce the plan that answers it.
//!
//! Single-capability requests map straight to a one-task plan. Requests with
//! sequencing language go to the [`LlmPlanner`]; if it fails for any reason
//! the rejection is logged and the request runs as a single task against the
//! default capability. Low-confidence requests produce a clarification and
//! no plan.

pub mod intent;
pub mod planner;

pub use intent::{staged_confidence, Classification, Intent, IntentCategory, IntentClassifier};
pub use planner::{parse_plan, LlmPlanner, PLAN_OPERATION};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityKind, CapabilityRegistry};
use crate::error::PlanningError;
use crate::plan::{ExecutionPlan, TaskSpec};

/// Id of the task in router-built single-step plans.
pub const SINGLE_STEP_TASK_ID: &str = "step-1";

const CLARIFICATION: &str = "I couldn't tell what you'd like me to do. Could you say whether \
you want to search the literature, look up a citation, compute a statistic, or summarize \
something?";

/// Router tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Requests classified below this confidence get a clarification.
    pub confidence_floor: f64,
    /// Capability used when planning fails.
    pub default_capability: String,
    pub default_operation: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.5,
            default_capability: "literature-search".to_string(),
            default_operation: "search".to_string(),
        }
    }
}

/// What the caller should do with a routed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RouteAction {
    Execute,
    Clarify { message: String },
}

/// Outcome of routing one request.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub intent: Intent,
    pub confidence: f64,
    /// Present exactly when `action` is [`RouteAction::Execute`].
    pub plan: Option<ExecutionPlan>,
    pub action: RouteAction,
    /// Why the planner's answer was rejected, when the plan is a fallback.
    pub planning_error: Option<PlanningError>,
}

impl RouteDecision {
    pub fn is_fallback(&self) -> bool {
        self.planning_error.is_some()
    }
}

/// Routes requests to plans.
#[derive(Debug, Clone)]
pub struct QueryRouter {
    config: RouterConfig,
    classifier: IntentClassifier,
    registry: Arc<CapabilityRegistry>,
    planner: Option<LlmPlanner>,
}

impl QueryRouter {
    pub fn new(config: RouterConfig, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            config,
            classifier: IntentClassifier::research_default(),
            registry,
            planner: None,
        }
    }

    pub fn with_classifier(mut self, classifier: IntentClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_planner(mut self, planner: LlmPlanner) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn classifier(&self) -> &IntentClassifier {
        &self.classifier
    }

    /// Classify `request` and build its plan.
    pub async fn route(&self, request: &str) -> RouteDecision {
        let classification = self.classifier.classify(request);
        debug!(
            intent = %classification.intent,
            confidence = classification.confidence,
            signals = classification.signals,
            "Classified request"
        );

        if classification.confidence < self.config.confidence_floor {
            info!(
                intent = %classification.intent,
                confidence = classification.confidence,
                floor = self.config.confidence_floor,
                "Confidence below floor; asking for clarification"
            );
            return RouteDecision {
                intent: classification.intent,
                confidence: classification.confidence,
                plan: None,
                action: RouteAction::Clarify {
                    message: CLARIFICATION.to_string(),
                },
                planning_error: None,
            };
        }

        let planned = match (&classification.intent, &classification.target) {
            (Intent::MultiStep, _) => self.plan_multi_step(request).await,
            (_, Some((capability, operation))) => self.single_step(request, capability, operation),
            (_, None) => Err(PlanningError::Generation(format!(
                "no capability mapped for intent '{}'",
                classification.intent
            ))),
        };

        let (plan, planning_error) = match planned {
            Ok(plan) => (Some(plan), None),
            Err(err) => {
                warn!(
                    error = %err,
                    fallback_capability = %self.config.default_capability,
                    "Plan rejected; falling back to single-step default"
                );
                (self.default_plan(request), Some(err))
            }
        };

        RouteDecision {
            intent: classification.intent,
            confidence: classification.confidence,
            plan,
            action: RouteAction::Execute,
            planning_error,
        }
    }

    async fn plan_multi_step(&self, request: &str) -> Result<ExecutionPlan, PlanningError> {
        match &self.planner {
            Some(planner) => planner.plan(request).await,
            None => Err(PlanningError::Generation(
                "no planner configured for multi-step requests".to_string(),
            )),
        }
    }

    /// One task carrying the request as its `query`.
    fn single_step(
        &self,
        request: &str,
        capability: &str,
        operation: &str,
    ) -> Result<ExecutionPlan, PlanningError> {
        let spec = match self.registry.descriptor(capability).map(|d| d.kind) {
            Some(CapabilityKind::TextGeneration) => {
                TaskSpec::generate(SINGLE_STEP_TASK_ID, operation).on(capability)
            }
            _ => TaskSpec::call(SINGLE_STEP_TASK_ID, capability, operation),
        }
        .param("query", request);
        let plan = ExecutionPlan::single(spec)?;
        plan.validate_against(&self.registry)?;
        Ok(plan)
    }

    /// Single-step plan against the configured default capability.
    ///
    /// Not validated against the registry: if the default is missing the
    /// task fails explicitly at execution.
    fn default_plan(&self, request: &str) -> Option<ExecutionPlan> {
        let spec = TaskSpec::call(
            SINGLE_STEP_TASK_ID,
            &self.config.default_capability,
            &self.config.default_operation,
        )
        .param("query", request);
        match ExecutionPlan::single(spec) {
            Ok(plan) => Some(plan),
            Err(err) => {
                warn!(error = %err, "Default plan could not be built");
                None
            }
        }
    }
}
