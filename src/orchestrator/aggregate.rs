//! Per-task outcomes and the aggregated result of one plan execution.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{GroundingViolation, TaskError};
use crate::grounding::GroundingCheck;
use crate::plan::{AggregationHint, ExecutionPlan, TaskStatus};
use crate::protection::CallOutcome;

/// Overall status of a plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// Every task succeeded with real data.
    Succeeded,
    /// Some tasks succeeded; others failed or returned a fallback.
    Partial,
    /// No task succeeded.
    Failed,
    Cancelled,
}

/// What happened to one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub capability: String,
    pub operation: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CallOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grounding: Option<GroundingCheck>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl TaskOutcome {
    pub fn is_unavailable(&self) -> bool {
        self.result.as_ref().is_some_and(CallOutcome::is_unavailable)
    }

    /// JSON view of the output, when the task produced one.
    pub fn output_json(&self) -> Option<Value> {
        self.result
            .as_ref()
            .and_then(CallOutcome::output)
            .map(|output| output.to_json())
    }
}

/// Final result handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResult {
    pub plan_id: Uuid,
    pub status: OverallStatus,
    pub aggregation: AggregationHint,
    /// Combined output according to the plan's aggregation hint.
    pub output: Option<Value>,
    /// Outcomes in plan order.
    pub tasks: Vec<TaskOutcome>,
    /// Tasks whose capability was unavailable and returned a fallback.
    pub unavailable: Vec<String>,
    pub grounding_violations: Vec<GroundingViolation>,
}

impl AggregatedResult {
    /// Assemble the result from outcomes listed in any order.
    pub fn build(plan: &ExecutionPlan, mut outcomes: Vec<TaskOutcome>, cancelled: bool) -> Self {
        let position = |id: &str| {
            plan.tasks()
                .iter()
                .position(|t| t.id() == id)
                .unwrap_or(usize::MAX)
        };
        outcomes.sort_by_key(|o| position(&o.task_id));

        let unavailable: Vec<String> = outcomes
            .iter()
            .filter(|o| o.is_unavailable())
            .map(|o| o.task_id.clone())
            .collect();
        let grounding_violations = outcomes
            .iter()
            .filter_map(|o| {
                o.grounding
                    .as_ref()
                    .filter(|check| !check.passed)
                    .map(|check| GroundingViolation {
                        task_id: o.task_id.clone(),
                        check: check.clone(),
                    })
            })
            .collect();

        let succeeded = outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Succeeded)
            .count();
        let status = if cancelled {
            OverallStatus::Cancelled
        } else if succeeded == 0 {
            OverallStatus::Failed
        } else if succeeded == outcomes.len() && unavailable.is_empty() {
            OverallStatus::Succeeded
        } else {
            OverallStatus::Partial
        };

        let output = combine(plan.aggregation(), &outcomes);
        Self {
            plan_id: plan.id(),
            status,
            aggregation: plan.aggregation(),
            output,
            tasks: outcomes,
            unavailable,
            grounding_violations,
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|o| o.task_id == id)
    }

    pub fn is_success(&self) -> bool {
        self.status == OverallStatus::Succeeded
    }

    /// Text of the combined output, when it is a plain string.
    pub fn output_text(&self) -> Option<&str> {
        self.output.as_ref().and_then(Value::as_str)
    }
}

fn combine(hint: AggregationHint, outcomes: &[TaskOutcome]) -> Option<Value> {
    let produced = outcomes
        .iter()
        .filter_map(|o| o.output_json().map(|v| (o.task_id.as_str(), v)));

    match hint {
        AggregationHint::Last => produced.last().map(|(_, v)| v),
        AggregationHint::All => {
            let all: Map<String, Value> = produced.map(|(id, v)| (id.to_string(), v)).collect();
            (!all.is_empty()).then_some(Value::Object(all))
        }
        AggregationHint::Merge => {
            let mut merged = Map::new();
            for (id, value) in produced {
                match value {
                    Value::Object(fields) => merged.extend(fields),
                    other => {
                        merged.insert(id.to_string(), other);
                    }
                }
            }
            (!merged.is_empty()).then_some(Value::Object(merged))
        }
    }
}
