//! Request handling from routing through execution.
//!
//! [`Engine`] owns one [`QueryRouter`] and one [`TaskOrchestrator`] sharing a
//! single capability registry, breaker registry and response cache. Breaker
//! state therefore persists across requests handled by the same engine.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::breaker::BreakerRegistry;
use crate::capability::http::HttpCapability;
use crate::capability::{CapabilityRegistry, TextGenerationCapability};
use crate::config::{ConfigError, EngineConfig};
use crate::llm::LiteLlmClient;
use crate::orchestrator::{AggregatedResult, InstructionTemplates, TaskOrchestrator};
use crate::plan::ExecutionPlan;
use crate::protection::{ProtectedCaller, ResponseCache};
use crate::router::{Intent, LlmPlanner, QueryRouter, RouteAction};
use crate::storage::{JsonlRunSink, MultiSink, RunRecordSink, SqliteRunStore, StorageError};

/// Errors raised while assembling an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid instruction template: {0}")]
    Template(#[from] tera::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What the caller gets back for one request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EngineResponse {
    /// Confidence was below the floor; nothing was executed.
    Clarification {
        intent: Intent,
        confidence: f64,
        message: String,
    },
    Completed {
        intent: Intent,
        confidence: f64,
        /// Why the generated plan was replaced by the single-step default.
        #[serde(skip_serializing_if = "Option::is_none")]
        planning_fallback: Option<String>,
        result: AggregatedResult,
    },
}

impl EngineResponse {
    pub fn result(&self) -> Option<&AggregatedResult> {
        match self {
            EngineResponse::Completed { result, .. } => Some(result),
            EngineResponse::Clarification { .. } => None,
        }
    }

    pub fn intent(&self) -> Intent {
        match self {
            EngineResponse::Clarification { intent, .. }
            | EngineResponse::Completed { intent, .. } => *intent,
        }
    }
}

/// Router and orchestrator wired together.
#[derive(Clone)]
pub struct Engine {
    router: QueryRouter,
    orchestrator: TaskOrchestrator,
}

impl Engine {
    pub fn new(router: QueryRouter, orchestrator: TaskOrchestrator) -> Self {
        Self {
            router,
            orchestrator,
        }
    }

    /// Assemble an engine from configuration and an already-populated registry.
    ///
    /// A planner is attached only when the registry has a text-generation
    /// capability; without one, multi-step requests fall back to the default
    /// capability.
    pub fn from_config(
        config: &EngineConfig,
        registry: CapabilityRegistry,
        sink: Arc<dyn RunRecordSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let registry = Arc::new(registry);
        let caller = ProtectedCaller::new(
            registry.clone(),
            Arc::new(BreakerRegistry::new(config.breaker.to_breaker_config())),
            Arc::new(ResponseCache::new(config.cache.to_cache_config())),
        )
        .with_call_timeout(config.call_timeout());

        let mut router = QueryRouter::new(config.router.clone(), registry.clone());
        if registry.text_generation().is_some() {
            router = router.with_planner(LlmPlanner::new(caller.clone()));
        }

        let orchestrator = TaskOrchestrator::new(caller)
            .with_config(config.orchestrator.clone())
            .with_templates(InstructionTemplates::from_overrides(&config.templates)?)
            .with_sink(sink);

        Ok(Self::new(router, orchestrator))
    }

    /// Registry described by `config`: the LLM backend (when configured) plus
    /// every declared HTTP capability.
    pub fn build_registry(config: &EngineConfig) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();

        if let Some(api_base) = &config.llm.api_base {
            let client = LiteLlmClient::new(
                api_base.clone(),
                config.llm.api_key.clone(),
                config.llm.model.clone(),
            )
            .with_timeout(config.call_timeout() + Duration::from_secs(1));
            registry.register(Arc::new(
                TextGenerationCapability::new(Arc::new(client)).with_model(&config.llm.model),
            ));
        }

        for declared in &config.capabilities {
            registry.register(Arc::new(HttpCapability::from_config(
                declared,
                config.call_timeout(),
            )));
        }
        registry
    }

    /// Run record sinks described by `config`. Empty when none are configured.
    pub async fn build_sink(config: &EngineConfig) -> Result<Arc<dyn RunRecordSink>, EngineError> {
        let mut sink = MultiSink::new();
        if let Some(path) = &config.storage.run_log {
            sink = sink.with(Arc::new(JsonlRunSink::new(path)));
        }
        if let Some(url) = &config.storage.database_url {
            sink = sink.with(Arc::new(SqliteRunStore::connect(url).await?));
        }
        Ok(Arc::new(sink))
    }

    pub fn router(&self) -> &QueryRouter {
        &self.router
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        self.orchestrator.caller().capabilities()
    }

    /// Route `request` and execute the resulting plan.
    pub async fn handle(&self, request: &str) -> EngineResponse {
        self.handle_with_cancel(request, CancellationToken::new())
            .await
    }

    #[instrument(skip_all)]
    pub async fn handle_with_cancel(
        &self,
        request: &str,
        cancel: CancellationToken,
    ) -> EngineResponse {
        let decision = self.router.route(request).await;

        let plan = match (decision.action, decision.plan) {
            (RouteAction::Clarify { message }, _) => {
                return EngineResponse::Clarification {
                    intent: decision.intent,
                    confidence: decision.confidence,
                    message,
                }
            }
            (RouteAction::Execute, Some(plan)) => plan,
            (RouteAction::Execute, None) => {
                return EngineResponse::Clarification {
                    intent: decision.intent,
                    confidence: decision.confidence,
                    message: "No plan could be built for this request.".to_string(),
                }
            }
        };

        info!(
            intent = %decision.intent,
            confidence = decision.confidence,
            plan_id = %plan.id(),
            tasks = plan.len(),
            fallback = decision.planning_error.is_some(),
            "Executing routed plan"
        );
        let result = self.orchestrator.execute_with_cancel(plan, cancel).await;

        EngineResponse::Completed {
            intent: decision.intent,
            confidence: decision.confidence,
            planning_fallback: decision.planning_error.map(|e| e.to_string()),
            result,
        }
    }

    /// Execute a plan that did not come from the router.
    pub async fn execute(&self, plan: ExecutionPlan) -> AggregatedResult {
        self.orchestrator.execute(plan).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        Capability, CapabilityDescriptor, CapabilityKind, CapabilityOutput, Params,
    };
    use crate::error::CapabilityError;
    use crate::orchestrator::OverallStatus;
    use crate::storage::InMemoryRunSink;
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixed {
        descriptor: CapabilityDescriptor,
        reply: CapabilityOutput,
    }

    #[async_trait]
    impl Capability for Fixed {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, _: &str, _: &Params) -> Result<CapabilityOutput, CapabilityError> {
            Ok(self.reply.clone())
        }
    }

    fn search_only() -> CapabilityRegistry {
        CapabilityRegistry::new().with(Arc::new(Fixed {
            descriptor: CapabilityDescriptor::new("literature-search", CapabilityKind::Tool)
                .with_operations(["search"]),
            reply: CapabilityOutput::Structured(json!({"count": 1, "records": [{"pmid": "1"}]})),
        }))
    }

    #[tokio::test]
    async fn test_single_step_request_end_to_end() {
        let sink = Arc::new(InMemoryRunSink::new());
        let engine = Engine::from_config(&EngineConfig::default(), search_only(), sink.clone())
            .unwrap();

        let response = engine.handle("find papers on asthma in pubmed").await;
        assert_eq!(response.intent(), Intent::LiteratureSearch);
        let result = response.result().unwrap();
        assert_eq!(result.status, OverallStatus::Succeeded);
        assert_eq!(result.output.as_ref().unwrap()["count"], 1);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_vague_request_gets_clarification() {
        let sink = Arc::new(InMemoryRunSink::new());
        let engine = Engine::from_config(&EngineConfig::default(), search_only(), sink.clone())
            .unwrap();

        let response = engine.handle("hello there").await;
        assert!(matches!(response, EngineResponse::Clarification { .. }));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_multi_step_without_text_backend_falls_back() {
        let engine = Engine::from_config(
            &EngineConfig::default(),
            search_only(),
            Arc::new(InMemoryRunSink::new()),
        )
        .unwrap();

        let response = engine
            .handle("find studies on statins then summarize the key findings")
            .await;
        match response {
            EngineResponse::Completed {
                intent,
                planning_fallback,
                result,
                ..
            } => {
                assert_eq!(intent, Intent::MultiStep);
                assert!(planning_fallback.is_some());
                assert_eq!(result.status, OverallStatus::Succeeded);
                assert_eq!(result.tasks[0].capability, "literature-search");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_template_override_is_rejected() {
        let mut config = EngineConfig::default();
        config
            .templates
            .insert("summarize".to_string(), "{{ unclosed".to_string());
        let err = Engine::from_config(&config, search_only(), Arc::new(InMemoryRunSink::new()))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Template(_)));
    }

    #[test]
    fn test_build_registry_from_config() {
        let yaml = r#"
llm:
  api_base: http://localhost:4000
capabilities:
  - name: literature-search
    base_url: http://localhost:8081
    operations: [search]
  - name: statistics
    base_url: http://localhost:8082
    operations: [compute]
    cacheable: false
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        let registry = Engine::build_registry(&config);
        assert_eq!(registry.len(), 3);
        assert!(registry.text_generation().is_some());
        assert!(!registry.descriptor("statistics").unwrap().cacheable);
    }

    #[tokio::test]
    async fn test_build_sink_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.storage.run_log = Some(dir.path().join("runs.jsonl"));
        let sink = Engine::build_sink(&config).await.unwrap();

        let engine = Engine::from_config(&config, search_only(), sink).unwrap();
        engine.handle("search pubmed for asthma trials").await;

        let log = JsonlRunSink::new(dir.path().join("runs.jsonl"));
        assert_eq!(log.read_all().await.unwrap().len(), 1);
    }
}
