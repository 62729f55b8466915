//! Protected capability calls: cache, breaker, deadline.
//!
//! [`ProtectedCaller::call`] is the only path from the orchestrator (and the
//! planner) to a provider. In order it:
//!
//! 1. rejects unknown capabilities and undeclared operations (permanent, not counted)
//! 2. serves a fresh cached response for cacheable capabilities
//! 3. asks the capability's breaker for admission; a rejection becomes a
//!    [`Fallback`] marker instead of an error
//! 4. runs the call under a deadline; a timeout is a transient failure
//! 5. reports the outcome to the breaker and caches successes

pub mod cache;

pub use cache::{canonical_json, CacheConfig, CacheKey, CacheStats, ResponseCache};

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::breaker::{Admission, BreakerRegistry, RejectReason, SharedBreaker};
use crate::capability::{CapabilityOutput, CapabilityRegistry, Params};
use crate::error::{CapabilityError, TransientKind};
use crate::metrics::{CallOutcomeLabel, MetricsCollector};

/// Default deadline for a single capability call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a fallback was returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    CircuitOpen,
    ProbeInFlight,
}

/// Marker returned in place of a result while a capability is considered unhealthy.
///
/// Distinct from an empty result: it means "not asked", not "nothing found".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fallback {
    pub capability: String,
    pub operation: String,
    pub reason: FallbackReason,
    /// Milliseconds until the breaker will admit a probe, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub message: String,
}

impl Fallback {
    fn from_rejection(capability: &str, operation: &str, reason: RejectReason) -> Self {
        let (reason, retry_after_ms) = match reason {
            RejectReason::CircuitOpen { retry_after } => (
                FallbackReason::CircuitOpen,
                Some(retry_after.as_millis().min(u128::from(u64::MAX)) as u64),
            ),
            RejectReason::ProbeInFlight => (FallbackReason::ProbeInFlight, None),
        };
        Self {
            capability: capability.to_string(),
            operation: operation.to_string(),
            reason,
            retry_after_ms,
            message: format!(
                "The '{}' service is temporarily unavailable. Please try again shortly.",
                capability
            ),
        }
    }
}

/// Result of a protected call that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Completed {
        output: CapabilityOutput,
        from_cache: bool,
    },
    Unavailable {
        fallback: Fallback,
    },
}

impl CallOutcome {
    /// Output, if the provider (or the cache) answered.
    pub fn output(&self) -> Option<&CapabilityOutput> {
        match self {
            CallOutcome::Completed { output, .. } => Some(output),
            CallOutcome::Unavailable { .. } => None,
        }
    }

    pub fn fallback(&self) -> Option<&Fallback> {
        match self {
            CallOutcome::Unavailable { fallback } => Some(fallback),
            CallOutcome::Completed { .. } => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, CallOutcome::Unavailable { .. })
    }

    pub fn from_cache(&self) -> bool {
        matches!(self, CallOutcome::Completed { from_cache: true, .. })
    }
}

/// Reports an admitted call's outcome to its breaker exactly once.
///
/// If the call future is dropped before settling (cancellation), the probe
/// slot is released so the breaker does not stay stuck half-open.
struct AdmissionGuard {
    breaker: SharedBreaker,
    admission: Admission,
    settled: bool,
}

impl AdmissionGuard {
    fn new(breaker: SharedBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            admission,
            settled: false,
        }
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker
            .lock()
            .expect("breaker lock poisoned")
            .record_success(self.admission);
    }

    fn failure(mut self, reason: &str) {
        self.settled = true;
        self.breaker
            .lock()
            .expect("breaker lock poisoned")
            .record_failure(self.admission, Instant::now(), reason);
    }

    fn release(mut self) {
        self.settled = true;
        self.breaker
            .lock()
            .expect("breaker lock poisoned")
            .release_probe(self.admission);
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if !self.settled && self.admission.is_probe() {
            if let Ok(mut state) = self.breaker.lock() {
                state.release_probe(self.admission);
            }
        }
    }
}

/// Calls capabilities through their breakers, with caching and deadlines.
#[derive(Debug, Clone)]
pub struct ProtectedCaller {
    capabilities: Arc<CapabilityRegistry>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<ResponseCache>,
    call_timeout: Duration,
    metrics: MetricsCollector,
}

impl ProtectedCaller {
    pub fn new(
        capabilities: Arc<CapabilityRegistry>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            capabilities,
            breakers,
            cache,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Call `operation` on `capability`.
    ///
    /// # Returns
    ///
    /// * `Ok(CallOutcome::Completed)` with the provider's (or cache's) output
    /// * `Ok(CallOutcome::Unavailable)` if the breaker turned the call away
    ///
    /// # Errors
    ///
    /// Returns the provider's [`CapabilityError`]. Transient errors, including
    /// deadline expiry, have already been counted by the breaker; permanent
    /// errors have not.
    pub async fn call(
        &self,
        capability: &str,
        operation: &str,
        params: &Params,
    ) -> Result<CallOutcome, CapabilityError> {
        let provider =
            self.capabilities
                .get(capability)
                .ok_or_else(|| CapabilityError::UnknownCapability {
                    capability: capability.to_string(),
                })?;
        let descriptor = provider.descriptor();
        if !descriptor.supports(operation) {
            self.metrics
                .record_capability_call(capability, CallOutcomeLabel::PermanentError);
            return Err(CapabilityError::UnsupportedOperation {
                capability: capability.to_string(),
                operation: operation.to_string(),
            });
        }

        let cache_key = descriptor
            .cacheable
            .then(|| CacheKey::for_call(capability, operation, params));
        if let Some(ref key) = cache_key {
            let cached = self.cache.get(key);
            self.metrics.record_cache_lookup(cached.is_some());
            if let Some(output) = cached {
                debug!(capability, operation, "Serving capability response from cache");
                self.metrics
                    .record_capability_call(capability, CallOutcomeLabel::Cached);
                return Ok(CallOutcome::Completed {
                    output,
                    from_cache: true,
                });
            }
        }

        let breaker = self.breakers.breaker(capability);
        let admission = breaker
            .lock()
            .expect("breaker lock poisoned")
            .admit(Instant::now());
        if let Admission::Rejected(reason) = admission {
            info!(capability, operation, reason = ?reason, "Call rejected by circuit breaker");
            self.metrics
                .record_capability_call(capability, CallOutcomeLabel::Rejected);
            return Ok(CallOutcome::Unavailable {
                fallback: Fallback::from_rejection(capability, operation, reason),
            });
        }

        let guard = AdmissionGuard::new(breaker, admission);
        let result = match tokio::time::timeout(
            self.call_timeout,
            provider.invoke(operation, params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::transient(
                capability,
                TransientKind::Timeout,
                format!("no response within {:?}", self.call_timeout),
            )),
        };

        match result {
            Ok(output) => {
                guard.success();
                self.metrics
                    .record_capability_call(capability, CallOutcomeLabel::Success);
                if let Some(key) = cache_key {
                    self.cache.insert(key, output.clone());
                }
                Ok(CallOutcome::Completed {
                    output,
                    from_cache: false,
                })
            }
            Err(err) if err.is_transient() => {
                guard.failure(&err.to_string());
                self.metrics
                    .record_capability_call(capability, CallOutcomeLabel::TransientError);
                Err(err)
            }
            Err(err) => {
                guard.release();
                self.metrics
                    .record_capability_call(capability, CallOutcomeLabel::PermanentError);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::capability::{Capability, CapabilityDescriptor, CapabilityKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted results, then repeats the last one.
    struct ScriptedTool {
        descriptor: CapabilityDescriptor,
        script: Mutex<Vec<Result<CapabilityOutput, CapabilityError>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedTool {
        fn new(name: &str, script: Vec<Result<CapabilityOutput, CapabilityError>>) -> Self {
            Self {
                descriptor: CapabilityDescriptor::new(name, CapabilityKind::Tool)
                    .with_operations(["search"]),
                script: Mutex::new(script),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn uncached(mut self) -> Self {
            self.descriptor.cacheable = false;
            self
        }
    }

    #[async_trait]
    impl Capability for ScriptedTool {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.descriptor
        }

        async fn invoke(
            &self,
            _operation: &str,
            _params: &Params,
        ) -> Result<CapabilityOutput, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock().expect("lock not poisoned");
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    fn timeout_error() -> Result<CapabilityOutput, CapabilityError> {
        Err(CapabilityError::transient(
            "search",
            TransientKind::Timeout,
            "upstream timed out",
        ))
    }

    fn caller(tool: Arc<ScriptedTool>, config: BreakerConfig) -> ProtectedCaller {
        let registry = CapabilityRegistry::new().with(tool);
        ProtectedCaller::new(
            Arc::new(registry),
            Arc::new(BreakerRegistry::new(config)),
            Arc::new(ResponseCache::new(CacheConfig::default())),
        )
    }

    fn query(q: &str) -> Params {
        json!({ "query": q }).as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_success_is_cached() {
        let tool = Arc::new(ScriptedTool::new(
            "search",
            vec![Ok(CapabilityOutput::Structured(json!({"records": []})))],
        ));
        let caller = caller(tool.clone(), BreakerConfig::default());

        let first = caller.call("search", "search", &query("x")).await.unwrap();
        assert!(!first.from_cache());
        let second = caller.call("search", "search", &query("x")).await.unwrap();
        assert!(second.from_cache());
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(caller.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_open_breaker_returns_fallback_without_calling() {
        let tool = Arc::new(ScriptedTool::new("search", vec![timeout_error()]));
        let caller = caller(tool.clone(), BreakerConfig::default().with_failure_threshold(2));

        for _ in 0..2 {
            let err = caller.call("search", "search", &query("x")).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert_eq!(caller.breakers().state("search"), Some(CircuitState::Open));

        let outcome = caller.call("search", "search", &query("x")).await.unwrap();
        let fallback = outcome.fallback().expect("fallback marker");
        assert_eq!(fallback.reason, FallbackReason::CircuitOpen);
        assert!(fallback.retry_after_ms.is_some());
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_counted() {
        let tool = Arc::new(ScriptedTool::new(
            "search",
            vec![Err(CapabilityError::permanent("search", "missing query"))],
        ));
        let caller = caller(tool, BreakerConfig::default().with_failure_threshold(1));

        for _ in 0..3 {
            let err = caller.call("search", "search", &Params::new()).await.unwrap_err();
            assert!(!err.is_transient());
        }
        let snapshot = caller.breakers().snapshot("search").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test]
    async fn test_deadline_counts_as_transient_timeout() {
        let tool = Arc::new(
            ScriptedTool::new("search", vec![Ok(CapabilityOutput::Text("late".into()))])
                .with_delay(Duration::from_millis(200)),
        );
        let caller = caller(tool, BreakerConfig::default().with_failure_threshold(1))
            .with_call_timeout(Duration::from_millis(20));

        let err = caller.call("search", "search", &query("x")).await.unwrap_err();
        assert!(matches!(
            err,
            CapabilityError::Transient {
                kind: TransientKind::Timeout,
                ..
            }
        ));
        assert_eq!(caller.breakers().state("search"), Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_unknown_capability_and_operation() {
        let tool = Arc::new(ScriptedTool::new("search", vec![timeout_error()]));
        let caller = caller(tool.clone(), BreakerConfig::default());

        assert!(matches!(
            caller.call("nope", "search", &Params::new()).await,
            Err(CapabilityError::UnknownCapability { .. })
        ));
        assert!(matches!(
            caller.call("search", "delete", &Params::new()).await,
            Err(CapabilityError::UnsupportedOperation { .. })
        ));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 0);
        assert!(caller.breakers().state("search").is_none());
    }

    #[tokio::test]
    async fn test_half_open_admits_one_concurrent_probe() {
        let tool = Arc::new(
            ScriptedTool::new(
                "search",
                vec![
                    timeout_error(),
                    Ok(CapabilityOutput::Structured(json!({"records": [1]}))),
                ],
            )
            .with_delay(Duration::from_millis(50))
            .uncached(),
        );
        let caller = caller(
            tool.clone(),
            BreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_millis(30)),
        );

        assert!(caller.call("search", "search", &query("x")).await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;

        let params = query("x");
        let (a, b) = tokio::join!(
            caller.call("search", "search", &params),
            caller.call("search", "search", &params)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let probes = outcomes.iter().filter(|o| !o.is_unavailable()).count();
        let rejected: Vec<&Fallback> = outcomes.iter().filter_map(CallOutcome::fallback).collect();
        assert_eq!(probes, 1);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].reason, FallbackReason::ProbeInFlight);
        assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
        assert_eq!(caller.breakers().state("search"), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_dropped_probe_is_released() {
        let tool = Arc::new(
            ScriptedTool::new("search", vec![timeout_error()])
                .with_delay(Duration::from_millis(200))
                .uncached(),
        );
        let caller = caller(
            tool,
            BreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::ZERO),
        )
        .with_call_timeout(Duration::from_millis(10));

        assert!(caller.call("search", "search", &query("x")).await.is_err());

        let params = query("x");
        let abandoned = tokio::time::timeout(
            Duration::from_millis(1),
            caller.call("search", "search", &params),
        )
        .await;
        assert!(abandoned.is_err());

        let snapshot = caller.breakers().snapshot("search").unwrap();
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert!(!snapshot.probe_in_flight);
    }
}
