//! Engine configuration.
//!
//! All tunables live in one [`EngineConfig`]. It is loaded from YAML, then
//! overridden from `ORCH_*` (and `LITELLM_*`) environment variables, then
//! validated. Every section has defaults, so an empty file is a valid config.
//!
//! ```yaml
//! breaker:
//!   failure_threshold: 5
//!   reset_timeout_secs: 60
//! orchestrator:
//!   max_concurrent_tasks: 5
//! capabilities:
//!   - name: literature-search
//!     base_url: http://localhost:8081
//!     operations: [search]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::breaker::{BreakerConfig, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_TIMEOUT};
use crate::capability::http::HttpCapabilityConfig;
use crate::llm::DEFAULT_MODEL;
use crate::orchestrator::OrchestratorConfig;
use crate::protection::cache::{DEFAULT_MAX_ENTRIES, DEFAULT_TTL};
use crate::protection::CacheConfig;
use crate::router::RouterConfig;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Circuit breaker section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_secs: DEFAULT_RESET_TIMEOUT.as_secs(),
        }
    }
}

impl BreakerSection {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(self.failure_threshold)
            .with_reset_timeout(Duration::from_secs(self.reset_timeout_secs))
    }
}

/// Response cache section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL.as_secs(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl CacheSection {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig::new(self.max_entries).with_ttl(Duration::from_secs(self.ttl_secs))
    }
}

/// Text-generation backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// OpenAI-compatible base URL. No text capability is registered without one.
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_base: None,
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Run record outputs. Both are optional and may be combined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// JSON Lines file.
    pub run_log: Option<PathBuf>,
    /// SQLite URL, e.g. `sqlite://runs.db`.
    pub database_url: Option<String>,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub breaker: BreakerSection,
    pub cache: CacheSection,
    pub orchestrator: OrchestratorConfig,
    pub router: RouterConfig,
    /// Instruction template overrides keyed by operation (Tera syntax).
    pub templates: HashMap<String, String>,
    pub llm: LlmSection,
    pub capabilities: Vec<HttpCapabilityConfig>,
    pub storage: StorageSection,
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Read a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Load `path` (or defaults when `None`), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// # Environment Variables
    ///
    /// - `ORCH_MAX_CONCURRENT_TASKS`: tasks running at once (default: 5)
    /// - `ORCH_CALL_TIMEOUT_SECS`: per-call deadline (default: 30)
    /// - `ORCH_BREAKER_THRESHOLD`: consecutive transient failures before opening (default: 5)
    /// - `ORCH_BREAKER_RESET_SECS`: open duration before a probe (default: 60)
    /// - `ORCH_CACHE_TTL_SECS`: response cache TTL (default: 86400)
    /// - `ORCH_CONFIDENCE_FLOOR`: minimum routing confidence (default: 0.5)
    /// - `ORCH_RUN_LOG`: JSON Lines run log path
    /// - `ORCH_DATABASE_URL`: SQLite run store URL
    /// - `LITELLM_API_BASE`, `LITELLM_API_KEY`, `LITELLM_DEFAULT_MODEL`: text backend
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. `apply_env_overrides` uses the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("ORCH_MAX_CONCURRENT_TASKS") {
            self.orchestrator.max_concurrent_tasks =
                parse_env_value(&val, "ORCH_MAX_CONCURRENT_TASKS")?;
        }
        if let Some(val) = lookup("ORCH_CALL_TIMEOUT_SECS") {
            self.orchestrator.call_timeout_secs = parse_env_value(&val, "ORCH_CALL_TIMEOUT_SECS")?;
        }
        if let Some(val) = lookup("ORCH_BREAKER_THRESHOLD") {
            self.breaker.failure_threshold = parse_env_value(&val, "ORCH_BREAKER_THRESHOLD")?;
        }
        if let Some(val) = lookup("ORCH_BREAKER_RESET_SECS") {
            self.breaker.reset_timeout_secs = parse_env_value(&val, "ORCH_BREAKER_RESET_SECS")?;
        }
        if let Some(val) = lookup("ORCH_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_env_value(&val, "ORCH_CACHE_TTL_SECS")?;
        }
        if let Some(val) = lookup("ORCH_CONFIDENCE_FLOOR") {
            self.router.confidence_floor = parse_env_value(&val, "ORCH_CONFIDENCE_FLOOR")?;
        }
        if let Some(val) = lookup("ORCH_RUN_LOG") {
            self.storage.run_log = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("ORCH_DATABASE_URL") {
            self.storage.database_url = Some(val);
        }

        if let Some(val) = lookup("LITELLM_API_BASE") {
            self.llm.api_base = Some(val);
        }
        if let Some(val) = lookup("LITELLM_API_KEY") {
            self.llm.api_key = Some(val);
        }
        if let Some(val) = lookup("LITELLM_DEFAULT_MODEL") {
            self.llm.model = val;
        }
        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.max_concurrent_tasks == 0 {
            return Err(ConfigError::ValidationFailed(
                "orchestrator.max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }

        if self.orchestrator.call_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "orchestrator.call_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.breaker.reset_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "breaker.reset_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::ValidationFailed(
                "cache.max_entries must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.router.confidence_floor) {
            return Err(ConfigError::ValidationFailed(
                "router.confidence_floor must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.router.default_capability.is_empty() || self.router.default_operation.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "router.default_capability and router.default_operation cannot be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for capability in &self.capabilities {
            if capability.name.is_empty() || capability.base_url.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "capabilities need a name and a base_url".to_string(),
                ));
            }
            if capability.operations.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "capability '{}' declares no operations",
                    capability.name
                )));
            }
            if !seen.insert(capability.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "capability '{}' is declared twice",
                    capability.name
                )));
            }
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        self.orchestrator.call_timeout()
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.reset_timeout_secs, 60);
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.orchestrator.max_concurrent_tasks, 5);
        assert_eq!(config.orchestrator.call_timeout_secs, 30);
        assert_eq!(config.router.confidence_floor, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
breaker:
  failure_threshold: 3
router:
  confidence_floor: 0.7
templates:
  summarize: "Summarize briefly: {{ inputs }}"
capabilities:
  - name: literature-search
    base_url: http://localhost:8081/
    operations: [search]
storage:
  run_log: runs/log.jsonl
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.reset_timeout_secs, 60);
        assert_eq!(config.router.confidence_floor, 0.7);
        assert_eq!(config.router.default_capability, "literature-search");
        assert_eq!(config.capabilities.len(), 1);
        assert!(config.capabilities[0].cacheable);
        assert_eq!(config.storage.run_log, Some(PathBuf::from("runs/log.jsonl")));
        assert!(config.templates.contains_key("summarize"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(EngineConfig::from_yaml_str("  \n").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_unparseable_yaml() {
        let err = EngineConfig::from_yaml_str("breaker: [1, 2").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(vars(&[
                ("ORCH_MAX_CONCURRENT_TASKS", "8"),
                ("ORCH_CALL_TIMEOUT_SECS", " 10 "),
                ("ORCH_BREAKER_THRESHOLD", "2"),
                ("ORCH_CONFIDENCE_FLOOR", "0.25"),
                ("LITELLM_API_BASE", "http://localhost:4000"),
            ]))
            .unwrap();

        assert_eq!(config.orchestrator.max_concurrent_tasks, 8);
        assert_eq!(config.call_timeout(), Duration::from_secs(10));
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.router.confidence_floor, 0.25);
        assert_eq!(config.llm.api_base.as_deref(), Some("http://localhost:4000"));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(vars(&[("ORCH_BREAKER_THRESHOLD", "five")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "ORCH_BREAKER_THRESHOLD"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.orchestrator.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.router.confidence_floor = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        let capability = HttpCapabilityConfig {
            name: "statistics".to_string(),
            base_url: "http://localhost:9000".to_string(),
            operations: vec!["compute".to_string()],
            cacheable: true,
            api_key_env: None,
            description: String::new(),
        };
        config.capabilities = vec![capability.clone(), capability];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(msg)) if msg.contains("declared twice")
        ));
    }

    #[test]
    fn test_sections_convert() {
        let config = EngineConfig::default();
        let breaker = config.breaker.to_breaker_config();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.reset_timeout, Duration::from_secs(60));
        let cache = config.cache.to_cache_config();
        assert_eq!(cache, CacheConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "orchestrator:\n  max_concurrent_tasks: 2\n").unwrap();
        let config = EngineConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.orchestrator.max_concurrent_tasks, 2);
        assert!(matches!(
            EngineConfig::from_yaml_file(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }
}
