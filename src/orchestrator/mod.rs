//! Plan execution.
//!
//! [`TaskOrchestrator::execute`] walks a plan in dependency order. A task is
//! dispatched once every task it references has succeeded; independent tasks
//! run concurrently up to `max_concurrent_tasks`. In-flight calls are polled
//! together and the loop wakes on the first completion, so a slot is freed
//! as soon as its call returns.
//!
//! Parameters are resolved at dispatch. A reference that cannot be resolved
//! fails the task with a [`DependencyResolutionError`] instead of passing
//! `null` along. Any failure also fails every transitive dependent without
//! invoking it.
//!
//! Text-generation tasks get an `instruction` rendered from the operation's
//! template, and their text output is checked against the outputs of the
//! tasks they reference before it is kept.

pub mod aggregate;
pub mod instructions;

pub use aggregate::{AggregatedResult, OverallStatus, TaskOutcome};
pub use instructions::{fallback_instruction, InstructionTemplates, DEFAULT_TEMPLATES};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::capability::text::INSTRUCTION_PARAM;
use crate::capability::{CapabilityKind, CapabilityOutput, Params};
use crate::error::{CapabilityError, DependencyResolutionError, TaskError};
use crate::grounding::{GroundingCheck, GroundingValidator};
use crate::metrics::MetricsCollector;
use crate::plan::{ExecutionPlan, TaskReference, TaskStatus};
use crate::protection::{CallOutcome, ProtectedCaller, DEFAULT_CALL_TIMEOUT};
use crate::storage::{MultiSink, RunRecordSink, TaskRunRecord};

/// Default number of tasks that may run at once.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;

/// Orchestrator tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_tasks: usize,
    /// Deadline applied to each capability call.
    pub call_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT.as_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new(max_concurrent_tasks: usize) -> Self {
        Self {
            max_concurrent_tasks,
            ..Self::default()
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// Everything a dispatched task needs, detached from the plan.
struct Invocation {
    task_id: String,
    kind: CapabilityKind,
    capability: String,
    operation: String,
    params: Params,
    /// Outputs of referenced tasks, for grounding.
    sources: Value,
}

struct TaskRun {
    outcome: CallOutcome,
    grounding: Option<GroundingCheck>,
}

/// Executes plans against a [`ProtectedCaller`].
#[derive(Clone)]
pub struct TaskOrchestrator {
    caller: ProtectedCaller,
    config: OrchestratorConfig,
    templates: InstructionTemplates,
    grounding: GroundingValidator,
    sink: Arc<dyn RunRecordSink>,
    metrics: MetricsCollector,
}

impl TaskOrchestrator {
    pub fn new(caller: ProtectedCaller) -> Self {
        Self {
            caller,
            config: OrchestratorConfig::default(),
            templates: InstructionTemplates::default(),
            grounding: GroundingValidator::default(),
            sink: Arc::new(MultiSink::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_templates(mut self, templates: InstructionTemplates) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_grounding(mut self, grounding: GroundingValidator) -> Self {
        self.grounding = grounding;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunRecordSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn caller(&self) -> &ProtectedCaller {
        &self.caller
    }

    /// Execute `plan` to completion.
    pub async fn execute(&self, plan: ExecutionPlan) -> AggregatedResult {
        self.execute_with_cancel(plan, CancellationToken::new()).await
    }

    /// Execute `plan`, stopping early if `cancel` fires.
    ///
    /// On cancellation in-flight calls are dropped and their tasks fail with
    /// [`TaskError::Cancelled`], as do tasks that never started. Tasks that
    /// already succeeded keep their results.
    #[instrument(skip_all, fields(plan_id = %plan.id(), tasks = plan.len()))]
    pub async fn execute_with_cancel(
        &self,
        mut plan: ExecutionPlan,
        cancel: CancellationToken,
    ) -> AggregatedResult {
        let plan_id = plan.id();
        let limit = self.config.max_concurrent_tasks.max(1);
        let mut outcomes: Vec<TaskOutcome> = Vec::with_capacity(plan.len());
        let mut started: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut in_flight = FuturesUnordered::new();
        let mut cancelled = cancel.is_cancelled();

        info!(limit, "Executing plan");

        while !cancelled {
            while in_flight.len() < limit {
                let Some(task_id) = next_ready(&plan) else {
                    break;
                };
                match prepare(&plan, &task_id) {
                    Ok(invocation) => {
                        if let Some(task) = plan.task_mut(&task_id) {
                            task.mark_running();
                        }
                        started.insert(task_id.clone(), Utc::now());
                        debug!(
                            task_id = %task_id,
                            capability = %invocation.capability,
                            operation = %invocation.operation,
                            "Task started"
                        );
                        in_flight.push(self.run_task(invocation));
                    }
                    Err(err) => {
                        let now = Utc::now();
                        self.fail_with_cascade(
                            &mut plan,
                            &task_id,
                            TaskError::Dependency(err),
                            (now, now),
                            &mut outcomes,
                        );
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let finished = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                finished = in_flight.next() => finished,
            };
            let Some((task_id, result)) = finished else {
                break;
            };
            let started_at = started.get(&task_id).copied().unwrap_or_else(Utc::now);

            match result {
                Ok(run) => {
                    if let Some(task) = plan.task_mut(&task_id) {
                        task.mark_succeeded(run.outcome.clone());
                    }
                    let outcome = self.outcome_for(
                        &plan,
                        &task_id,
                        TaskStatus::Succeeded,
                        Some(run.outcome),
                        None,
                        run.grounding,
                        (started_at, Utc::now().max(started_at)),
                    );
                    self.finish(outcome, &mut outcomes);
                }
                Err(err) => {
                    self.fail_with_cascade(
                        &mut plan,
                        &task_id,
                        TaskError::Capability(err),
                        (started_at, Utc::now().max(started_at)),
                        &mut outcomes,
                    );
                }
            }
        }
        drop(in_flight);

        let leftover: Vec<(String, TaskStatus)> = plan
            .tasks()
            .iter()
            .filter(|t| !t.status().is_terminal())
            .map(|t| (t.id().to_string(), t.status()))
            .collect();
        for (task_id, status) in leftover {
            let error = if cancelled {
                TaskError::Cancelled
            } else {
                blocked_by(&plan, &task_id)
            };
            if cancelled {
                debug!(task_id = %task_id, previous = %status, "Task cancelled");
            }
            let now = Utc::now();
            // Tasks that never ran get a zero-length window.
            let started_at = started.get(&task_id).copied().unwrap_or(now);
            if let Some(task) = plan.task_mut(&task_id) {
                task.mark_failed();
            }
            let outcome = self.outcome_for(
                &plan,
                &task_id,
                TaskStatus::Failed,
                None,
                Some(error),
                None,
                (started_at, now.max(started_at)),
            );
            self.finish(outcome, &mut outcomes);
        }

        self.flush_records(plan_id, &outcomes).await;

        let result = AggregatedResult::build(&plan, outcomes, cancelled);
        info!(
            status = ?result.status,
            unavailable = result.unavailable.len(),
            grounding_violations = result.grounding_violations.len(),
            "Plan finished"
        );
        result
    }

    /// Invoke one task and ground its text output.
    async fn run_task(&self, invocation: Invocation) -> (String, Result<TaskRun, CapabilityError>) {
        let Invocation {
            task_id,
            kind,
            capability,
            operation,
            mut params,
            sources,
        } = invocation;

        if kind == CapabilityKind::TextGeneration {
            let instruction = self.templates.instruction(&task_id, &operation, &params);
            params.insert(INSTRUCTION_PARAM.to_string(), Value::String(instruction));
        }

        let result = self
            .caller
            .call(&capability, &operation, &params)
            .await
            .map(|outcome| self.ground(&task_id, kind, outcome, &sources));
        (task_id, result)
    }

    fn ground(
        &self,
        task_id: &str,
        kind: CapabilityKind,
        outcome: CallOutcome,
        sources: &Value,
    ) -> TaskRun {
        let (text, from_cache) = match (&outcome, kind) {
            (
                CallOutcome::Completed {
                    output: CapabilityOutput::Text(text),
                    from_cache,
                },
                CapabilityKind::TextGeneration,
            ) => (text.clone(), *from_cache),
            _ => {
                return TaskRun {
                    outcome,
                    grounding: None,
                }
            }
        };

        let grounded = self.grounding.enforce(task_id, text, sources);
        TaskRun {
            outcome: CallOutcome::Completed {
                output: CapabilityOutput::Text(grounded.text),
                from_cache,
            },
            grounding: Some(grounded.check),
        }
    }

    /// Fail `task_id` and every task downstream of it.
    ///
    /// Dependents never run, so their window collapses to the instant the
    /// upstream failure was recorded.
    fn fail_with_cascade(
        &self,
        plan: &mut ExecutionPlan,
        task_id: &str,
        error: TaskError,
        window: (DateTime<Utc>, DateTime<Utc>),
        outcomes: &mut Vec<TaskOutcome>,
    ) {
        let skipped_at = window.1;
        warn!(task_id, error = %error, "Task failed");
        if let Some(task) = plan.task_mut(task_id) {
            task.mark_failed();
        }
        let outcome = self.outcome_for(
            plan,
            task_id,
            TaskStatus::Failed,
            None,
            Some(error),
            None,
            window,
        );
        self.finish(outcome, outcomes);

        for dependent in plan.transitive_dependents(task_id) {
            let pending = plan
                .task(&dependent)
                .is_some_and(|t| t.status() == TaskStatus::Pending);
            if !pending {
                continue;
            }
            debug!(task_id = %dependent, upstream = task_id, "Skipping task downstream of failure");
            if let Some(task) = plan.task_mut(&dependent) {
                task.mark_failed();
            }
            let error = TaskError::Dependency(DependencyResolutionError::UpstreamFailed {
                task: task_id.to_string(),
            });
            let outcome = self.outcome_for(
                plan,
                &dependent,
                TaskStatus::Failed,
                None,
                Some(error),
                None,
                (skipped_at, skipped_at),
            );
            self.finish(outcome, outcomes);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn outcome_for(
        &self,
        plan: &ExecutionPlan,
        task_id: &str,
        status: TaskStatus,
        result: Option<CallOutcome>,
        error: Option<TaskError>,
        grounding: Option<GroundingCheck>,
        (started_at, completed_at): (DateTime<Utc>, DateTime<Utc>),
    ) -> TaskOutcome {
        let (capability, operation) = plan
            .task(task_id)
            .map(|t| (t.capability().to_string(), t.operation().to_string()))
            .unwrap_or_default();
        TaskOutcome {
            task_id: task_id.to_string(),
            capability,
            operation,
            status,
            result,
            error,
            grounding,
            started_at,
            completed_at,
        }
    }

    /// Record a terminal outcome.
    fn finish(&self, outcome: TaskOutcome, outcomes: &mut Vec<TaskOutcome>) {
        let elapsed = (outcome.completed_at - outcome.started_at)
            .to_std()
            .unwrap_or_default();
        self.metrics.record_task(
            &outcome.status.to_string(),
            &outcome.capability,
            elapsed.as_secs_f64(),
        );

        outcomes.push(outcome);
    }

    /// Write one run record per outcome, in completion order. Called once
    /// scheduling is over.
    async fn flush_records(&self, plan_id: Uuid, outcomes: &[TaskOutcome]) {
        for outcome in outcomes {
            let record = TaskRunRecord::from_outcome(plan_id, outcome);
            if let Err(e) = self.sink.append(&record).await {
                warn!(task_id = %outcome.task_id, error = %e, "Failed to append run record");
            }
        }
    }
}

/// First pending task, in plan order, whose dependencies have all succeeded.
fn next_ready(plan: &ExecutionPlan) -> Option<String> {
    plan.tasks()
        .iter()
        .filter(|t| t.status() == TaskStatus::Pending)
        .find(|t| {
            t.depends_on().iter().all(|dep| {
                plan.task(dep)
                    .is_some_and(|d| d.status() == TaskStatus::Succeeded)
            })
        })
        .map(|t| t.id().to_string())
}

/// Resolve a task's parameters against upstream results.
fn prepare(plan: &ExecutionPlan, task_id: &str) -> Result<Invocation, DependencyResolutionError> {
    let task = plan
        .task(task_id)
        .ok_or_else(|| DependencyResolutionError::MissingTask {
            task: task_id.to_string(),
            reference: task_id.to_string(),
        })?;

    let lookup = |reference: &TaskReference| resolve_reference(plan, reference);
    let mut params = Params::new();
    for (name, value) in task.params() {
        params.insert(name.clone(), value.resolve(&lookup)?);
    }

    let sources = task
        .depends_on()
        .iter()
        .filter_map(|dep| plan.task(dep))
        .filter_map(|dep| dep.result())
        .filter_map(CallOutcome::output)
        .map(CapabilityOutput::to_json)
        .collect();

    Ok(Invocation {
        task_id: task_id.to_string(),
        kind: task.kind(),
        capability: task.capability().to_string(),
        operation: task.operation().to_string(),
        params,
        sources: Value::Array(sources),
    })
}

fn resolve_reference(
    plan: &ExecutionPlan,
    reference: &TaskReference,
) -> Result<Value, DependencyResolutionError> {
    let upstream = plan.task(&reference.task_id).ok_or_else(|| {
        DependencyResolutionError::MissingTask {
            task: reference.task_id.clone(),
            reference: reference.to_string(),
        }
    })?;
    let outcome = match (upstream.status(), upstream.result()) {
        (TaskStatus::Succeeded, Some(outcome)) => outcome,
        (status, _) => {
            return Err(DependencyResolutionError::NotSucceeded {
                task: reference.task_id.clone(),
                status,
            })
        }
    };
    let output = outcome
        .output()
        .ok_or_else(|| DependencyResolutionError::Unavailable {
            task: reference.task_id.clone(),
        })?
        .to_json();
    reference
        .extract(&output)
        .cloned()
        .ok_or_else(|| DependencyResolutionError::MissingField {
            task: reference.task_id.clone(),
            path: reference.path_display(),
        })
}

/// Error for a task left pending when no more work can run.
fn blocked_by(plan: &ExecutionPlan, task_id: &str) -> TaskError {
    let blocker = plan.task(task_id).and_then(|task| {
        task.depends_on()
            .iter()
            .filter_map(|dep| plan.task(dep))
            .find(|dep| dep.status() != TaskStatus::Succeeded)
    });
    match blocker {
        Some(dep) => TaskError::Dependency(DependencyResolutionError::NotSucceeded {
            task: dep.id().to_string(),
            status: dep.status(),
        }),
        None => TaskError::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerRegistry};
    use crate::capability::{Capability, CapabilityDescriptor, CapabilityRegistry};
    use crate::error::TransientKind;
    use crate::grounding::DEFAULT_SUBSTITUTE;
    use crate::plan::{AggregationHint, TaskSpec};
    use crate::protection::{CacheConfig, ResponseCache};
    use crate::storage::InMemoryRunSink;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&Params) -> Result<CapabilityOutput, CapabilityError> + Send + Sync>;

    /// Records every call and tracks peak concurrency.
    struct MockCapability {
        descriptor: CapabilityDescriptor,
        respond: Responder,
        delay: Duration,
        calls: Mutex<Vec<Params>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockCapability {
        fn tool(name: &str, respond: Responder) -> Self {
            Self::new(
                CapabilityDescriptor::new(name, CapabilityKind::Tool)
                    .with_operations(["search", "compute"])
                    .with_cacheable(false),
                respond,
            )
        }

        fn text(reply: &'static str) -> Self {
            Self::new(
                CapabilityDescriptor::new("text-generation", CapabilityKind::TextGeneration)
                    .with_operations(["summarize", "answer"]),
                Box::new(move |_| Ok(CapabilityOutput::Text(reply.to_string()))),
            )
        }

        fn new(descriptor: CapabilityDescriptor, respond: Responder) -> Self {
            Self {
                descriptor,
                respond,
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn last_params(&self) -> Params {
            self.calls.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl Capability for MockCapability {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.descriptor
        }

        async fn invoke(
            &self,
            _operation: &str,
            params: &Params,
        ) -> Result<CapabilityOutput, CapabilityError> {
            self.calls.lock().unwrap().push(params.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            (self.respond)(params)
        }
    }

    fn records(value: Value) -> Responder {
        Box::new(move |_| Ok(CapabilityOutput::Structured(value.clone())))
    }

    fn orchestrator(capabilities: Vec<Arc<dyn Capability>>) -> (TaskOrchestrator, Arc<InMemoryRunSink>) {
        let mut registry = CapabilityRegistry::new();
        for capability in capabilities {
            registry.register(capability);
        }
        let caller = ProtectedCaller::new(
            Arc::new(registry),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            Arc::new(ResponseCache::new(CacheConfig::default())),
        );
        let sink = Arc::new(InMemoryRunSink::new());
        (TaskOrchestrator::new(caller).with_sink(sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_references_resolve_to_upstream_values() {
        let search = Arc::new(MockCapability::tool(
            "search",
            records(json!({"topic": "asthma", "records": [{"pmid": "42"}]})),
        ));
        let stats = Arc::new(MockCapability::tool("stats", records(json!({"n": 1}))));
        let (orch, sink) = orchestrator(vec![search.clone(), stats.clone()]);

        let plan = ExecutionPlan::new(
            vec![
                TaskSpec::call("A", "search", "search").param("query", "asthma"),
                TaskSpec::call("B", "stats", "compute")
                    .param("topic", "<A.result.topic>")
                    .param("first", "<A.records.0.pmid>")
                    .param("all", json!(["<A.records>", 3])),
            ],
            AggregationHint::Last,
        )
        .unwrap();

        let result = orch.execute(plan).await;
        assert_eq!(result.status, OverallStatus::Succeeded);
        assert_eq!(
            Value::Object(stats.last_params()),
            json!({"topic": "asthma", "first": "42", "all": [[{"pmid": "42"}], 3]})
        );
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_cascades_without_invoking_dependents() {
        let search = Arc::new(MockCapability::tool(
            "search",
            Box::new(|_| Err(CapabilityError::permanent("search", "missing query"))),
        ));
        let stats = Arc::new(MockCapability::tool("stats", records(json!({"n": 1}))));
        let (orch, sink) = orchestrator(vec![search, stats.clone()]);

        let plan = ExecutionPlan::new(
            vec![
                TaskSpec::call("A", "search", "search"),
                TaskSpec::call("B", "stats", "compute").param("topic", "<A.result.topic>"),
                TaskSpec::call("C", "stats", "compute").param("n", "<B.n>"),
                TaskSpec::call("D", "stats", "compute").param("n", 1),
            ],
            AggregationHint::All,
        )
        .unwrap();

        let result = orch.execute(plan).await;
        assert_eq!(result.status, OverallStatus::Partial);
        assert_eq!(stats.call_count(), 1);

        let b = result.task("B").unwrap();
        assert_eq!(b.status, TaskStatus::Failed);
        assert_eq!(
            b.error,
            Some(TaskError::Dependency(DependencyResolutionError::UpstreamFailed {
                task: "A".to_string()
            }))
        );
        assert!(matches!(
            result.task("C").unwrap().error,
            Some(TaskError::Dependency(_))
        ));
        assert!(matches!(
            result.task("A").unwrap().error,
            Some(TaskError::Capability(CapabilityError::Permanent { .. }))
        ));
        assert_eq!(result.task("D").unwrap().status, TaskStatus::Succeeded);
        assert_eq!(sink.len(), 4);

        for skipped in sink.records().iter().filter(|r| r.task_id == "B" || r.task_id == "C") {
            assert_eq!(skipped.started_at, skipped.completed_at);
        }
        let c = result.task("C").unwrap();
        assert_eq!(c.started_at, c.completed_at);
    }

    #[tokio::test]
    async fn test_missing_field_fails_task() {
        let search = Arc::new(MockCapability::tool("search", records(json!({"records": []}))));
        let stats = Arc::new(MockCapability::tool("stats", records(json!({}))));
        let (orch, _) = orchestrator(vec![search, stats.clone()]);

        let plan = ExecutionPlan::new(
            vec![
                TaskSpec::call("A", "search", "search"),
                TaskSpec::call("B", "stats", "compute").param("topic", "<A.topic>"),
            ],
            AggregationHint::Last,
        )
        .unwrap();

        let result = orch.execute(plan).await;
        assert_eq!(
            result.task("B").unwrap().error,
            Some(TaskError::Dependency(DependencyResolutionError::MissingField {
                task: "A".to_string(),
                path: "topic".to_string()
            }))
        );
        assert_eq!(stats.call_count(), 0);
        let b = result.task("B").unwrap();
        assert_eq!(b.started_at, b.completed_at);
    }

    #[tokio::test]
    async fn test_unavailable_dependency_is_explicit() {
        let search = Arc::new(MockCapability::tool("search", records(json!({}))));
        let stats = Arc::new(MockCapability::tool("stats", records(json!({}))));
        let (orch, _) = orchestrator(vec![search, stats.clone()]);

        {
            let breaker = orch.caller().breakers().breaker("search");
            let mut state = breaker.lock().unwrap();
            for _ in 0..5 {
                let admission = state.admit(std::time::Instant::now());
                state.record_failure(admission, std::time::Instant::now(), "timeout");
            }
        }

        let plan = ExecutionPlan::new(
            vec![
                TaskSpec::call("A", "search", "search"),
                TaskSpec::call("B", "stats", "compute").param("records", "<A.records>"),
            ],
            AggregationHint::Last,
        )
        .unwrap();

        let result = orch.execute(plan).await;
        assert_eq!(result.unavailable, vec!["A".to_string()]);
        assert_eq!(result.task("A").unwrap().status, TaskStatus::Succeeded);
        assert_eq!(
            result.task("B").unwrap().error,
            Some(TaskError::Dependency(DependencyResolutionError::Unavailable {
                task: "A".to_string()
            }))
        );
        assert_eq!(result.status, OverallStatus::Partial);
        assert_eq!(stats.call_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let search = Arc::new(
            MockCapability::tool("search", records(json!({"records": []})))
                .with_delay(Duration::from_millis(30)),
        );
        let (orch, _) = orchestrator(vec![search.clone()]);
        let orch = orch.with_config(OrchestratorConfig::new(2));

        let specs = (0..6)
            .map(|i| TaskSpec::call(format!("t{}", i), "search", "search").param("n", i))
            .collect();
        let result = orch
            .execute(ExecutionPlan::new(specs, AggregationHint::All).unwrap())
            .await;

        assert_eq!(result.status, OverallStatus::Succeeded);
        assert_eq!(search.call_count(), 6);
        assert_eq!(search.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_independent_tasks_overlap() {
        let search = Arc::new(
            MockCapability::tool("search", records(json!({"records": []})))
                .with_delay(Duration::from_millis(50)),
        );
        let (orch, sink) = orchestrator(vec![search]);

        let plan = ExecutionPlan::new(
            vec![
                TaskSpec::call("A", "search", "search").param("q", "a"),
                TaskSpec::call("B", "search", "search").param("q", "b"),
            ],
            AggregationHint::All,
        )
        .unwrap();
        orch.execute(plan).await;

        let runs = sink.records();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].overlaps(&runs[1]));
    }

    #[tokio::test]
    async fn test_fabricated_ids_are_replaced() {
        let search = Arc::new(MockCapability::tool(
            "search",
            records(json!({"count": 0, "records": []})),
        ));
        let text = Arc::new(MockCapability::text(
            "1. Title one (PMID: 111)\n2. Title two (PMID: 222)\n3. Title three (PMID: 333)",
        ));
        let (orch, _) = orchestrator(vec![search, text.clone()]);

        let plan = ExecutionPlan::new(
            vec![
                TaskSpec::call("search", "search", "search").param("query", "topic X"),
                TaskSpec::generate("summary", "summarize").param("records", "<search.records>"),
            ],
            AggregationHint::Last,
        )
        .unwrap();

        let result = orch.execute(plan).await;
        let summary = result.task("summary").unwrap();
        assert_eq!(summary.status, TaskStatus::Succeeded);
        assert_eq!(result.output_text(), Some(DEFAULT_SUBSTITUTE));

        let check = summary.grounding.as_ref().unwrap();
        assert!(!check.passed);
        assert!(check.verified_ids.is_empty());
        assert_eq!(check.unverified_ids.len(), 3);
        assert_eq!(result.grounding_violations.len(), 1);

        let instruction = text.last_params()[INSTRUCTION_PARAM].as_str().unwrap().to_string();
        assert!(instruction.starts_with("Summarize the research material"));
    }

    #[tokio::test]
    async fn test_template_failure_uses_generic_instruction() {
        let text = Arc::new(MockCapability::text("No identifiers here."));
        let (orch, _) = orchestrator(vec![text.clone()]);

        // "answer" needs {{ query }}, which this task does not provide.
        let plan = ExecutionPlan::single(TaskSpec::generate("q", "answer").param("context", "x"))
            .unwrap();
        let result = orch.execute(plan).await;

        assert_eq!(result.status, OverallStatus::Succeeded);
        assert_eq!(result.output_text(), Some("No identifiers here."));
        let mut expected = Params::new();
        expected.insert("context".to_string(), json!("x"));
        assert_eq!(
            text.last_params()[INSTRUCTION_PARAM],
            json!(fallback_instruction("answer", &expected))
        );
    }

    #[tokio::test]
    async fn test_transient_failure_is_recorded() {
        let search = Arc::new(MockCapability::tool(
            "search",
            Box::new(|_| {
                Err(CapabilityError::transient(
                    "search",
                    TransientKind::Timeout,
                    "timed out",
                ))
            }),
        ));
        let (orch, sink) = orchestrator(vec![search]);
        let result = orch
            .execute(ExecutionPlan::single(TaskSpec::call("A", "search", "search")).unwrap())
            .await;

        assert_eq!(result.status, OverallStatus::Failed);
        let records = sink.records();
        assert_eq!(records[0].status, TaskStatus::Failed);
        assert!(records[0].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(
            orch.caller().breakers().snapshot("search").unwrap().failure_count,
            1
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_in_flight_and_pending_tasks() {
        let fast = Arc::new(MockCapability::tool("fast", records(json!({"n": 1}))));
        let slow = Arc::new(
            MockCapability::tool("slow", records(json!({"n": 2})))
                .with_delay(Duration::from_secs(10)),
        );
        let (orch, sink) = orchestrator(vec![fast.clone(), slow]);

        let plan = ExecutionPlan::new(
            vec![
                TaskSpec::call("A", "fast", "search"),
                TaskSpec::call("B", "slow", "search").param("n", "<A.n>"),
                TaskSpec::call("C", "fast", "compute").param("n", "<B.n>"),
            ],
            AggregationHint::Last,
        )
        .unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            orch.execute_with_cancel(plan, token),
        )
        .await
        .expect("cancellation ends execution");

        assert_eq!(result.status, OverallStatus::Cancelled);
        assert_eq!(result.task("A").unwrap().status, TaskStatus::Succeeded);
        assert_eq!(result.task("B").unwrap().error, Some(TaskError::Cancelled));
        assert_eq!(result.task("C").unwrap().error, Some(TaskError::Cancelled));
        assert_eq!(fast.call_count(), 1);
        assert_eq!(sink.len(), 3);

        let c = result.task("C").unwrap();
        assert_eq!(c.started_at, c.completed_at);
    }

    /// Sink whose every append takes `delay`.
    struct SlowSink {
        delay: Duration,
        inner: InMemoryRunSink,
    }

    #[async_trait]
    impl RunRecordSink for SlowSink {
        async fn append(&self, record: &TaskRunRecord) -> Result<(), crate::storage::StorageError> {
            tokio::time::sleep(self.delay).await;
            self.inner.append(record).await
        }
    }

    #[tokio::test]
    async fn test_slow_sink_does_not_delay_cancellation() {
        let fast = Arc::new(MockCapability::tool("fast", records(json!({"n": 1}))));
        let slow = Arc::new(
            MockCapability::tool("slow", records(json!({"n": 2})))
                .with_delay(Duration::from_secs(10)),
        );
        let (orch, _) = orchestrator(vec![fast, slow]);
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(400),
            inner: InMemoryRunSink::new(),
        });
        let orch = orch.with_sink(sink.clone());

        let plan = ExecutionPlan::new(
            vec![
                TaskSpec::call("A", "fast", "search"),
                TaskSpec::call("B", "slow", "search"),
            ],
            AggregationHint::All,
        )
        .unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = orch.execute_with_cancel(plan, token).await;

        assert_eq!(result.status, OverallStatus::Cancelled);
        let b = result.task("B").unwrap();
        assert_eq!(b.error, Some(TaskError::Cancelled));
        // B was cancelled long before a single append could have finished.
        let window = (b.completed_at - b.started_at).to_std().unwrap();
        assert!(window < Duration::from_millis(300), "took {:?}", window);
        assert_eq!(sink.inner.len(), 2);
    }
}
