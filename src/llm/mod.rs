//! LLM integration.
//!
//! Provides the [`LlmProvider`] trait and an OpenAI-compatible client. The
//! orchestrator never calls a provider directly; it goes through
//! [`TextGenerationCapability`](crate::capability::TextGenerationCapability)
//! so generation is protected by the same breaker as every other capability.
//!
//! ```ignore
//! use research_orchestrator::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
//!
//! let client = LiteLlmClient::from_env()?;
//! let request = GenerationRequest::new("", vec![Message::user("Summarize PMID 12345")]);
//! let response = client.generate(request).await?;
//! ```

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    DEFAULT_MODEL,
};
