//! Capability providers and the name-keyed registry.
//!
//! A capability is anything the orchestrator can call: a literature search
//! service, a citation resolver, a statistics helper, or a text-generation
//! model. They all implement [`Capability`] and declare their operations up
//! front so generated plans can be checked before anything runs.

pub mod http;
pub mod text;

pub use http::{HttpCapability, HttpCapabilityConfig};
pub use text::TextGenerationCapability;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::error::CapabilityError;

/// Name under which the text-generation capability is registered by default.
pub const DEFAULT_TEXT_CAPABILITY: &str = "text-generation";

/// Parameters passed to a capability operation.
pub type Params = Map<String, Value>;

/// Whether a capability returns structured data or prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    TextGeneration,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Tool => write!(f, "tool"),
            CapabilityKind::TextGeneration => write!(f, "text_generation"),
        }
    }
}

/// Result of a successful capability call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CapabilityOutput {
    Structured(Value),
    Text(String),
}

impl CapabilityOutput {
    /// View as JSON. Text becomes a JSON string.
    pub fn to_json(&self) -> Value {
        match self {
            CapabilityOutput::Structured(v) => v.clone(),
            CapabilityOutput::Text(t) => Value::String(t.clone()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CapabilityOutput::Text(t) => Some(t),
            CapabilityOutput::Structured(_) => None,
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            CapabilityOutput::Structured(v) => Some(v),
            CapabilityOutput::Text(_) => None,
        }
    }
}

/// Static description of a registered capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub kind: CapabilityKind,
    pub operations: Vec<String>,
    /// Whether successful results may be served from the response cache.
    pub cacheable: bool,
    pub description: String,
}

impl CapabilityDescriptor {
    /// Create a descriptor. Tools are cacheable by default, text generation is not.
    pub fn new(name: impl Into<String>, kind: CapabilityKind) -> Self {
        Self {
            name: name.into(),
            kind,
            operations: Vec::new(),
            cacheable: kind == CapabilityKind::Tool,
            description: String::new(),
        }
    }

    pub fn with_operations<I, S>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations = operations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether `operation` is declared by this capability.
    pub fn supports(&self, operation: &str) -> bool {
        self.operations.iter().any(|op| op == operation)
    }
}

/// A named provider the orchestrator can invoke.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Name, kind and supported operations.
    fn descriptor(&self) -> &CapabilityDescriptor;

    /// Run `operation` with already-resolved parameters.
    ///
    /// Implementations classify their own failures: anything that says the
    /// provider is unhealthy is [`CapabilityError::Transient`], anything that
    /// says the request was wrong is [`CapabilityError::Permanent`].
    async fn invoke(
        &self,
        operation: &str,
        params: &Params,
    ) -> Result<CapabilityOutput, CapabilityError>;
}

/// Registered capabilities, keyed by name.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    providers: HashMap<String, Arc<dyn Capability>>,
    order: Vec<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its descriptor name.
    ///
    /// Registering the same name twice replaces the earlier provider.
    pub fn register(&mut self, provider: Arc<dyn Capability>) {
        let name = provider.descriptor().name.clone();
        if self.providers.insert(name.clone(), provider).is_some() {
            warn!(capability = %name, "Replacing previously registered capability");
        } else {
            self.order.push(name);
        }
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, provider: Arc<dyn Capability>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.providers.get(name).cloned()
    }

    pub fn descriptor(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.providers.get(name).map(|p| p.descriptor())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<&CapabilityDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.descriptor(name))
            .collect()
    }

    /// First registered text-generation capability.
    pub fn text_generation(&self) -> Option<&CapabilityDescriptor> {
        self.descriptors()
            .into_iter()
            .find(|d| d.kind == CapabilityKind::TextGeneration)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.order)
            .finish()
    }
}
