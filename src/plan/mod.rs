//! Execution plans: tasks, parameters, dependencies.
//!
//! A plan is built once per request, either from the router's single-step
//! mapping or from planner output, and consumed once by the orchestrator.
//! Construction through [`ExecutionPlan::new`] is the only way to get a plan,
//! so every plan that reaches execution has already been checked for
//! duplicate ids, dangling or self references, and dependency cycles.

pub mod reference;

pub use reference::{ParamValue, TaskReference, RESULT_ALIAS};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use uuid::Uuid;

use crate::capability::{CapabilityKind, CapabilityRegistry, DEFAULT_TEXT_CAPABILITY};
use crate::error::PlanningError;
use crate::protection::CallOutcome;

/// Lifecycle status of a task within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    /// Whether the task will not change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How the final outputs of a plan are combined for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationHint {
    /// Output of the last task, in plan order, that produced data.
    #[default]
    Last,
    /// Every task output keyed by task id.
    All,
    /// Shallow merge of structured outputs; text outputs keyed by task id.
    Merge,
}

/// A tool call as written by a planner or a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallSpec {
    pub id: String,
    pub capability: String,
    pub operation: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// A text-generation step as written by a planner or a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateSpec {
    pub id: String,
    #[serde(default = "default_text_capability")]
    pub capability: String,
    pub operation: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

fn default_text_capability() -> String {
    DEFAULT_TEXT_CAPABILITY.to_string()
}

/// Authored form of a task, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    Call(CallSpec),
    Generate(GenerateSpec),
}

impl TaskSpec {
    /// Start a tool call spec.
    pub fn call(
        id: impl Into<String>,
        capability: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        TaskSpec::Call(CallSpec {
            id: id.into(),
            capability: capability.into(),
            operation: operation.into(),
            params: Map::new(),
        })
    }

    /// Start a text-generation spec against the default text capability.
    pub fn generate(id: impl Into<String>, operation: impl Into<String>) -> Self {
        TaskSpec::Generate(GenerateSpec {
            id: id.into(),
            capability: default_text_capability(),
            operation: operation.into(),
            params: Map::new(),
        })
    }

    /// Set a parameter. String values of the form `<task.path>` become references.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let params = match &mut self {
            TaskSpec::Call(spec) => &mut spec.params,
            TaskSpec::Generate(spec) => &mut spec.params,
        };
        params.insert(name.into(), value.into());
        self
    }

    /// Override the target capability.
    pub fn on(mut self, capability: impl Into<String>) -> Self {
        match &mut self {
            TaskSpec::Call(spec) => spec.capability = capability.into(),
            TaskSpec::Generate(spec) => spec.capability = capability.into(),
        }
        self
    }

    pub fn id(&self) -> &str {
        match self {
            TaskSpec::Call(spec) => &spec.id,
            TaskSpec::Generate(spec) => &spec.id,
        }
    }

    pub fn capability(&self) -> &str {
        match self {
            TaskSpec::Call(spec) => &spec.capability,
            TaskSpec::Generate(spec) => &spec.capability,
        }
    }

    pub fn operation(&self) -> &str {
        match self {
            TaskSpec::Call(spec) => &spec.operation,
            TaskSpec::Generate(spec) => &spec.operation,
        }
    }

    /// The capability kind this spec expects to target.
    pub fn kind(&self) -> CapabilityKind {
        match self {
            TaskSpec::Call(_) => CapabilityKind::Tool,
            TaskSpec::Generate(_) => CapabilityKind::TextGeneration,
        }
    }

    fn into_parts(self) -> (String, String, String, Map<String, Value>) {
        match self {
            TaskSpec::Call(s) => (s.id, s.capability, s.operation, s.params),
            TaskSpec::Generate(s) => (s.id, s.capability, s.operation, s.params),
        }
    }
}

/// Authored form of a whole plan. This is the schema planners must emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanSpec {
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub aggregation: AggregationHint,
}

/// One unit of work within a plan.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityTask {
    id: String,
    kind: CapabilityKind,
    capability: String,
    operation: String,
    params: BTreeMap<String, ParamValue>,
    depends_on: BTreeSet<String>,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<CallOutcome>,
}

impl CapabilityTask {
    fn from_spec(spec: TaskSpec) -> Result<Self, PlanningError> {
        let kind = spec.kind();
        let (id, capability, operation, raw_params) = spec.into_parts();

        let mut params = BTreeMap::new();
        for (name, value) in raw_params {
            params.insert(name, ParamValue::parse(&id, value)?);
        }
        let depends_on = params
            .values()
            .flat_map(ParamValue::references)
            .map(|r| r.task_id.clone())
            .collect();

        Ok(Self {
            id,
            kind,
            capability,
            operation,
            params,
            depends_on,
            status: TaskStatus::Pending,
            result: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    /// Task ids referenced anywhere in this task's parameters.
    pub fn depends_on(&self) -> &BTreeSet<String> {
        &self.depends_on
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Output once the task has succeeded.
    pub fn result(&self) -> Option<&CallOutcome> {
        self.result.as_ref()
    }

    /// Every reference in this task's parameters.
    pub fn references(&self) -> impl Iterator<Item = &TaskReference> {
        self.params.values().flat_map(ParamValue::references)
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
    }

    pub(crate) fn mark_succeeded(&mut self, outcome: CallOutcome) {
        self.status = TaskStatus::Succeeded;
        self.result = Some(outcome);
    }

    pub(crate) fn mark_failed(&mut self) {
        self.status = TaskStatus::Failed;
        self.result = None;
    }

    /// Convert back to the authored form.
    pub fn to_spec(&self) -> TaskSpec {
        let params = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        match self.kind {
            CapabilityKind::Tool => TaskSpec::Call(CallSpec {
                id: self.id.clone(),
                capability: self.capability.clone(),
                operation: self.operation.clone(),
                params,
            }),
            CapabilityKind::TextGeneration => TaskSpec::Generate(GenerateSpec {
                id: self.id.clone(),
                capability: self.capability.clone(),
                operation: self.operation.clone(),
                params,
            }),
        }
    }
}

/// A validated, dependency-annotated set of tasks.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    id: Uuid,
    tasks: Vec<CapabilityTask>,
    aggregation: AggregationHint,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Build and validate a plan.
    ///
    /// # Errors
    ///
    /// Returns a [`PlanningError`] if the plan is empty, repeats a task id,
    /// contains a malformed reference, references a missing task or itself,
    /// or contains a dependency cycle.
    pub fn new(specs: Vec<TaskSpec>, aggregation: AggregationHint) -> Result<Self, PlanningError> {
        if specs.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }

        let mut tasks = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());
        for spec in specs {
            let task = CapabilityTask::from_spec(spec)?;
            if index.insert(task.id.clone(), tasks.len()).is_some() {
                return Err(PlanningError::DuplicateTaskId(task.id));
            }
            tasks.push(task);
        }

        for task in &tasks {
            for reference in task.references() {
                if reference.task_id == task.id {
                    return Err(PlanningError::SelfReference(task.id.clone()));
                }
                if !index.contains_key(&reference.task_id) {
                    return Err(PlanningError::UnknownReference {
                        task: task.id.clone(),
                        reference: reference.to_string(),
                    });
                }
            }
        }

        let plan = Self {
            id: Uuid::new_v4(),
            tasks,
            aggregation,
            index,
        };
        plan.detect_cycles()?;
        Ok(plan)
    }

    /// Build a plan from its authored form.
    pub fn from_spec(spec: PlanSpec) -> Result<Self, PlanningError> {
        Self::new(spec.tasks, spec.aggregation)
    }

    /// A plan with exactly one task.
    pub fn single(spec: TaskSpec) -> Result<Self, PlanningError> {
        Self::new(vec![spec], AggregationHint::Last)
    }

    /// Parse a plan document strictly. Unknown fields are rejected.
    pub fn from_json(raw: &str) -> Result<Self, PlanningError> {
        let spec: PlanSpec =
            serde_json::from_str(raw).map_err(|e| PlanningError::Schema(e.to_string()))?;
        Self::from_spec(spec)
    }

    /// Parse a plan document written as YAML.
    pub fn from_yaml(raw: &str) -> Result<Self, PlanningError> {
        let spec: PlanSpec =
            serde_yaml::from_str(raw).map_err(|e| PlanningError::Schema(e.to_string()))?;
        Self::from_spec(spec)
    }

    /// Fresh id for this plan instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn aggregation(&self) -> AggregationHint {
        self.aggregation
    }

    /// Tasks in plan order.
    pub fn tasks(&self) -> &[CapabilityTask] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&CapabilityTask> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub(crate) fn task_mut(&mut self, id: &str) -> Option<&mut CapabilityTask> {
        match self.index.get(id) {
            Some(&i) => self.tasks.get_mut(i),
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks that reference `id` directly.
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.depends_on.contains(id))
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Every task that reaches `id` through one or more references.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if found.insert(dependent.to_string()) {
                    queue.push_back(dependent);
                }
            }
        }
        found
    }

    /// Tasks grouped into layers; every task's dependencies sit in earlier layers.
    ///
    /// Within a layer tasks keep plan order.
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut remaining: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.len()))
            .collect();
        let mut layers = Vec::new();

        while !remaining.is_empty() {
            let layer: Vec<String> = self
                .tasks
                .iter()
                .filter(|t| remaining.get(t.id.as_str()) == Some(&0))
                .map(|t| t.id.clone())
                .collect();
            if layer.is_empty() {
                break;
            }
            for id in &layer {
                remaining.remove(id.as_str());
                for dependent in self.dependents(id) {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
            layers.push(layer);
        }
        layers
    }

    /// Check every task against the registered capabilities.
    ///
    /// # Errors
    ///
    /// Returns a [`PlanningError`] naming the first task whose capability is
    /// unknown, whose operation is not declared, or whose declared kind does
    /// not match the capability.
    pub fn validate_against(&self, registry: &CapabilityRegistry) -> Result<(), PlanningError> {
        for task in &self.tasks {
            let descriptor = registry.descriptor(&task.capability).ok_or_else(|| {
                PlanningError::UnknownCapability {
                    task: task.id.clone(),
                    capability: task.capability.clone(),
                }
            })?;
            if descriptor.kind != task.kind {
                return Err(PlanningError::KindMismatch {
                    task: task.id.clone(),
                    capability: task.capability.clone(),
                    declared: task.kind.to_string(),
                    actual: descriptor.kind.to_string(),
                });
            }
            if !descriptor.supports(&task.operation) {
                return Err(PlanningError::UnsupportedOperation {
                    task: task.id.clone(),
                    capability: task.capability.clone(),
                    operation: task.operation.clone(),
                });
            }
        }
        Ok(())
    }

    /// Convert back to the authored form.
    pub fn to_spec(&self) -> PlanSpec {
        PlanSpec {
            tasks: self.tasks.iter().map(CapabilityTask::to_spec).collect(),
            aggregation: self.aggregation,
        }
    }

    /// Depth-first search over dependency edges, reporting the first cycle as a path.
    fn detect_cycles(&self) -> Result<(), PlanningError> {
        fn visit<'a>(
            node: &'a str,
            plan: &'a ExecutionPlan,
            visited: &mut HashSet<&'a str>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            if let Some(pos) = stack.iter().position(|&n| n == node) {
                let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            if !visited.insert(node) {
                return None;
            }
            stack.push(node);
            if let Some(task) = plan.task(node) {
                for dep in &task.depends_on {
                    if let Some(cycle) = visit(dep, plan, visited, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            None
        }

        let mut visited = HashSet::new();
        for task in &self.tasks {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(&task.id, self, &mut visited, &mut stack) {
                return Err(PlanningError::CycleDetected(cycle));
            }
        }
        Ok(())
    }
}
