//! Multi-step plan generation through the text-generation capability.
//!
//! The model is shown the registered capabilities and the plan schema and
//! must answer with a single JSON document. The answer is extracted from
//! whatever prose surrounds it, parsed strictly (unknown fields and untagged
//! tasks are rejected) and validated twice: structurally by
//! [`ExecutionPlan::new`] and against the registry by
//! [`ExecutionPlan::validate_against`]. Nothing is defaulted.

use serde_json::Value;
use tracing::{debug, warn};

use crate::capability::text::INSTRUCTION_PARAM;
use crate::capability::{CapabilityKind, CapabilityRegistry, Params, DEFAULT_TEXT_CAPABILITY};
use crate::error::PlanningError;
use crate::plan::{ExecutionPlan, PlanSpec};
use crate::protection::{CallOutcome, ProtectedCaller};
use crate::utils::json_extraction::extract_json_object;

/// Operation the planner invokes on the text capability.
pub const PLAN_OPERATION: &str = "plan";

const PLANNER_PREAMBLE: &str = r#"You are the planning component of a research assistant.
Break the user's request into the smallest set of capability calls that answers it.

## OUTPUT FORMAT

Answer with ONE JSON object and nothing else:

{
  "tasks": [
    {"kind": "call", "id": "search", "capability": "<tool name>", "operation": "<operation>", "params": {"query": "..."}},
    {"kind": "generate", "id": "summary", "operation": "summarize", "params": {"records": "<search.records>"}}
  ],
  "aggregation": "last"
}

## RULES

- "kind" is "call" for tools and "generate" for text generation.
- Task ids are short, unique, and use only letters, digits, '-' and '_'.
- Use a later task's params to consume an earlier task's output with a reference string
  of the form "<task_id.field.path>". A reference must name an earlier task, never itself.
- Only use the capabilities and operations listed below. Do not invent parameters you
  cannot fill from the request or from an earlier task.
- "aggregation" is one of "last", "all", "merge".
"#;

/// Turns a free-form request into a validated [`ExecutionPlan`].
#[derive(Debug, Clone)]
pub struct LlmPlanner {
    caller: ProtectedCaller,
    capability: String,
}

impl LlmPlanner {
    /// Plan with the first registered text-generation capability.
    pub fn new(caller: ProtectedCaller) -> Self {
        let capability = caller
            .capabilities()
            .text_generation()
            .map(|d| d.name.clone())
            .unwrap_or_else(|| DEFAULT_TEXT_CAPABILITY.to_string());
        Self { caller, capability }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = capability.into();
        self
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Full planning instruction for `request`.
    pub fn build_prompt(&self, request: &str) -> String {
        let mut prompt = String::from(PLANNER_PREAMBLE);
        prompt.push_str("\n## AVAILABLE CAPABILITIES\n\n");
        for descriptor in self.caller.capabilities().descriptors() {
            let kind = match descriptor.kind {
                CapabilityKind::Tool => "call",
                CapabilityKind::TextGeneration => "generate",
            };
            prompt.push_str(&format!(
                "- {} (kind: {}) operations: [{}]",
                descriptor.name,
                kind,
                descriptor.operations.join(", ")
            ));
            if !descriptor.description.is_empty() {
                prompt.push_str(&format!(" - {}", descriptor.description));
            }
            prompt.push('\n');
        }
        prompt.push_str("\n## REQUEST\n\n");
        prompt.push_str(request);
        prompt.push('\n');
        prompt
    }

    /// Ask the model for a plan and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`PlanningError::Generation`] if the text capability failed or
    /// was unavailable, and any extraction, schema or validation error for
    /// the answer it gave.
    pub async fn plan(&self, request: &str) -> Result<ExecutionPlan, PlanningError> {
        let mut params = Params::new();
        params.insert(
            INSTRUCTION_PARAM.to_string(),
            Value::String(self.build_prompt(request)),
        );

        let outcome = self
            .caller
            .call(&self.capability, PLAN_OPERATION, &params)
            .await
            .map_err(|e| PlanningError::Generation(e.to_string()))?;

        let raw = match outcome {
            CallOutcome::Completed { output, .. } => match output.as_text() {
                Some(text) => text.to_string(),
                None => output.to_json().to_string(),
            },
            CallOutcome::Unavailable { fallback } => {
                return Err(PlanningError::Generation(fallback.message));
            }
        };
        debug!(capability = %self.capability, chars = raw.len(), "Received plan candidate");

        let plan = parse_plan(&raw, self.caller.capabilities())?;
        debug!(plan_id = %plan.id(), tasks = plan.len(), "Accepted generated plan");
        Ok(plan)
    }
}

/// Extract, parse and validate a plan document from model output.
///
/// # Errors
///
/// Returns the first [`PlanningError`] encountered.
pub fn parse_plan(raw: &str, registry: &CapabilityRegistry) -> Result<ExecutionPlan, PlanningError> {
    let json = extract_json_object(raw)?;
    let spec: PlanSpec = serde_json::from_str(&json).map_err(|e| {
        warn!(error = %e, "Generated plan does not match the plan schema");
        PlanningError::Schema(e.to_string())
    })?;
    let plan = ExecutionPlan::from_spec(spec)?;
    plan.validate_against(registry)?;
    Ok(plan)
}
