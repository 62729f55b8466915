//! Scripted capabilities shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use research_orchestrator::breaker::{BreakerConfig, BreakerRegistry};
use research_orchestrator::capability::{
    Capability, CapabilityDescriptor, CapabilityKind, CapabilityOutput, CapabilityRegistry, Params,
};
use research_orchestrator::protection::{CacheConfig, ProtectedCaller, ResponseCache};
use research_orchestrator::CapabilityError;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Reply = Box<dyn Fn(&Params) -> Result<CapabilityOutput, CapabilityError> + Send + Sync>;

/// Capability with a fixed reply, an optional delay and a call log.
pub struct Scripted {
    descriptor: CapabilityDescriptor,
    reply: Reply,
    delay: Duration,
    calls: AtomicUsize,
    params: Mutex<Vec<Params>>,
}

impl Scripted {
    pub fn tool(name: &str, operations: &[&str], reply: Value) -> Self {
        Self::with_reply(
            CapabilityDescriptor::new(name, CapabilityKind::Tool)
                .with_operations(operations.iter().copied())
                .with_cacheable(false),
            Box::new(move |_| Ok(CapabilityOutput::Structured(reply.clone()))),
        )
    }

    pub fn text(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::with_reply(
            CapabilityDescriptor::new("text-generation", CapabilityKind::TextGeneration)
                .with_operations(["summarize", "answer", "compare", "plan"]),
            Box::new(move |_| Ok(CapabilityOutput::Text(reply.clone()))),
        )
    }

    pub fn failing(name: &str, operations: &[&str], error: CapabilityError) -> Self {
        Self::with_reply(
            CapabilityDescriptor::new(name, CapabilityKind::Tool)
                .with_operations(operations.iter().copied())
                .with_cacheable(false),
            Box::new(move |_| Err(error.clone())),
        )
    }

    pub fn with_reply(descriptor: CapabilityDescriptor, reply: Reply) -> Self {
        Self {
            descriptor,
            reply,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            params: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<Params> {
        self.params.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Capability for Scripted {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _operation: &str, params: &Params) -> Result<CapabilityOutput, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.params.lock().unwrap().push(params.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.reply)(params)
    }
}

pub fn registry(capabilities: Vec<Arc<dyn Capability>>) -> Arc<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    for capability in capabilities {
        registry.register(capability);
    }
    Arc::new(registry)
}

pub fn caller(registry: Arc<CapabilityRegistry>, breaker: BreakerConfig) -> ProtectedCaller {
    ProtectedCaller::new(
        registry,
        Arc::new(BreakerRegistry::new(breaker)),
        Arc::new(ResponseCache::new(CacheConfig::default())),
    )
}
