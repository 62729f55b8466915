//! Text-generation capability backed by an [`LlmProvider`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{
    Capability, CapabilityDescriptor, CapabilityKind, CapabilityOutput, Params,
    DEFAULT_TEXT_CAPABILITY,
};
use crate::error::{CapabilityError, TransientKind};
use crate::llm::{GenerationRequest, LlmProvider, Message};

/// Operations every text-generation capability answers.
pub const TEXT_OPERATIONS: [&str; 4] = ["summarize", "answer", "compare", "plan"];

/// Parameter carrying the rendered instruction.
pub const INSTRUCTION_PARAM: &str = "instruction";

const SYSTEM_PROMPT: &str = "You are a careful research assistant. Only cite identifiers \
(PMIDs, DOIs) that appear in the material you are given. If the material is empty, say so.";

/// Wraps an LLM provider as a capability returning plain text.
///
/// The prompt is taken from the `instruction` parameter, falling back to
/// `prompt` and then `query`. The orchestrator always supplies `instruction`.
pub struct TextGenerationCapability {
    descriptor: CapabilityDescriptor,
    provider: Arc<dyn LlmProvider>,
    model: String,
    system_prompt: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
}

impl TextGenerationCapability {
    /// Register as [`DEFAULT_TEXT_CAPABILITY`] using the provider's default model.
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            descriptor: CapabilityDescriptor::new(
                DEFAULT_TEXT_CAPABILITY,
                CapabilityKind::TextGeneration,
            )
            .with_operations(TEXT_OPERATIONS)
            .with_description("Summarize, answer, compare and plan in natural language"),
            provider,
            model: String::new(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            temperature: Some(0.2),
            max_tokens: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.name = name.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn prompt_from(&self, params: &Params) -> Result<String, CapabilityError> {
        [INSTRUCTION_PARAM, "prompt", "query"]
            .iter()
            .find_map(|key| match params.get(*key) {
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                CapabilityError::permanent(
                    &self.descriptor.name,
                    "missing 'instruction' parameter",
                )
            })
    }
}

#[async_trait]
impl Capability for TextGenerationCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &Params,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let name = &self.descriptor.name;
        let prompt = self.prompt_from(params)?;

        let mut request = GenerationRequest::new(
            self.model.clone(),
            vec![Message::system(&self.system_prompt), Message::user(prompt)],
        );
        if let Some(t) = self.temperature {
            request = request.with_temperature(t);
        }
        if let Some(m) = self.max_tokens {
            request = request.with_max_tokens(m);
        }

        debug!(capability = %name, operation, "Requesting text generation");
        let response = self
            .provider
            .generate(request)
            .await
            .map_err(|e| e.into_capability_error(name))?;

        match response.first_content() {
            Some(content) if !content.trim().is_empty() => {
                Ok(CapabilityOutput::Text(content.to_string()))
            }
            _ => Err(CapabilityError::transient(
                name,
                TransientKind::Unavailable,
                "provider returned no content",
            )),
        }
    }
}
