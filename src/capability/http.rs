//! JSON-over-HTTP capability adapter.
//!
//! Each operation maps to `POST {base_url}/{operation}` with the resolved
//! parameters as the JSON body. This lets research-database services be
//! registered from configuration alone.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::time::Duration;
use tracing::debug;

use super::{Capability, CapabilityDescriptor, CapabilityKind, CapabilityOutput, Params};
use crate::error::{CapabilityError, TransientKind};

/// Declaration of an HTTP capability in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCapabilityConfig {
    pub name: String,
    pub base_url: String,
    pub operations: Vec<String>,
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
    /// Environment variable holding a bearer token, if the service needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub description: String,
}

fn default_cacheable() -> bool {
    true
}

/// A capability served by a remote JSON endpoint.
pub struct HttpCapability {
    descriptor: CapabilityDescriptor,
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpCapability {
    /// Build from a configuration entry.
    ///
    /// The HTTP client timeout is set slightly above `call_timeout` so the
    /// caller's own deadline is the one that fires.
    pub fn from_config(config: &HttpCapabilityConfig, call_timeout: Duration) -> Self {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| env::var(var).ok());
        let client = Client::builder()
            .timeout(call_timeout + Duration::from_secs(1))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            descriptor: CapabilityDescriptor::new(&config.name, CapabilityKind::Tool)
                .with_operations(config.operations.iter().cloned())
                .with_cacheable(config.cacheable)
                .with_description(&config.description),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}/{}", self.base_url, operation)
    }
}

/// Classify an HTTP status returned by a capability endpoint.
pub fn classify_status(capability: &str, status: StatusCode, body: &str) -> CapabilityError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            CapabilityError::transient(capability, TransientKind::RateLimited, message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            CapabilityError::transient(capability, TransientKind::Timeout, message)
        }
        s if s.is_server_error() => {
            CapabilityError::transient(capability, TransientKind::Unavailable, message)
        }
        _ => CapabilityError::permanent(capability, message),
    }
}

fn classify_transport(capability: &str, err: reqwest::Error) -> CapabilityError {
    let kind = if err.is_timeout() {
        TransientKind::Timeout
    } else {
        TransientKind::Connection
    };
    CapabilityError::transient(capability, kind, err.to_string())
}

#[async_trait]
impl Capability for HttpCapability {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &Params,
    ) -> Result<CapabilityOutput, CapabilityError> {
        let name = &self.descriptor.name;
        let url = self.endpoint(operation);
        debug!(capability = %name, url = %url, "Calling HTTP capability");

        let mut request = self.client.post(&url).json(params);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(name, status, &body));
        }

        let body: Value = response.json().await.map_err(|e| {
            CapabilityError::transient(
                name,
                TransientKind::Unavailable,
                format!("invalid JSON body: {}", e),
            )
        })?;
        Ok(CapabilityOutput::Structured(body))
    }
}
