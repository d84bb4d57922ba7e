//! Engine configuration: defaults, optional YAML file, environment
//! overrides, layered in that order.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const ENV_PREFIX: &str = "APIWEAVER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// LLM provider settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_concurrency: usize,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            temperature: 0.1,
            max_tokens: 2048,
            max_concurrency: 8,
            timeout_secs: 30,
        }
    }
}

/// Outbound HTTP execution settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub timeout_secs: u64,
    pub backoff_base_ms: u64,
    /// Host-keyed path prefixes appended to a project base URL, e.g. the
    /// public petstore demo whose documents omit the `/api/v3` mount.
    pub host_aliases: HashMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let mut host_aliases = HashMap::new();
        host_aliases.insert("petstore3.swagger.io".to_string(), "/api/v3".to_string());
        Self {
            timeout_secs: 30,
            backoff_base_ms: 1000,
            host_aliases,
        }
    }
}

/// Pipeline-level settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Full pipeline restarts allowed per request.
    pub retry_budget: u32,
    /// Candidates taken from the resolver.
    pub top_candidates: usize,
    /// Candidates rendered into the planning prompt.
    pub prompt_candidates: usize,
    /// Field-link hints rendered into the planning prompt.
    pub field_link_hints: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_budget: 2,
            top_candidates: 10,
            prompt_candidates: 15,
            field_link_hints: 10,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    pub executor: ExecutorConfig,
    pub orchestrator: OrchestratorConfig,
}

impl EngineConfig {
    /// Defaults, overlaid with an optional YAML file, overlaid with
    /// `APIWEAVER_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path)?;
                serde_yaml::from_str(&raw)?
            }
            Some(path) => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(value) = env_var("LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = env_var("LLM_API_KEY") {
            self.llm.api_key = Some(value);
        }
        if let Some(value) = env_var("LLM_CHAT_MODEL") {
            self.llm.chat_model = value;
        }
        if let Some(value) = env_var("LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = value;
        }
        if let Some(value) = parse_env("LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = value;
        }
        if let Some(value) = parse_env("LLM_MAX_CONCURRENCY") {
            self.llm.max_concurrency = value;
        }
        if let Some(value) = parse_env("HTTP_TIMEOUT_SECS") {
            self.executor.timeout_secs = value;
        }
        if let Some(value) = parse_env("RETRY_BUDGET") {
            self.orchestrator.retry_budget = value;
        }
    }
}

fn env_var(suffix: &str) -> Option<String> {
    match env::var(format!("{ENV_PREFIX}{suffix}")) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn parse_env<T: std::str::FromStr>(suffix: &str) -> Option<T> {
    let raw = env_var(suffix)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(suffix, raw, "ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.orchestrator.retry_budget, 2);
        assert_eq!(config.executor.timeout_secs, 30);
        assert_eq!(config.llm.temperature, 0.1);
        assert_eq!(
            config.executor.host_aliases.get("petstore3.swagger.io"),
            Some(&"/api/v3".to_string())
        );
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let yaml = r#"
llm:
  chat_model: local-test
orchestrator:
  retry_budget: 1
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.chat_model, "local-test");
        assert_eq!(config.orchestrator.retry_budget, 1);
        // Untouched sections keep their defaults.
        assert_eq!(config.executor.timeout_secs, 30);
    }

    #[test]
    fn env_overrides_apply_last() {
        env::set_var("APIWEAVER_LLM_CHAT_MODEL", "env-model");
        env::set_var("APIWEAVER_RETRY_BUDGET", "5");
        env::set_var("APIWEAVER_HTTP_TIMEOUT_SECS", "not-a-number");
        let config = EngineConfig::load(None).unwrap();
        env::remove_var("APIWEAVER_LLM_CHAT_MODEL");
        env::remove_var("APIWEAVER_RETRY_BUDGET");
        env::remove_var("APIWEAVER_HTTP_TIMEOUT_SECS");

        assert_eq!(config.llm.chat_model, "env-model");
        assert_eq!(config.orchestrator.retry_budget, 5);
        assert_eq!(config.executor.timeout_secs, 30);
    }
}
