use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
}

pub const SETTINGS_FILE_NAME: &str = "draftloom.yaml";

/// Runtime knobs for the orchestration core. Every field has a serde
/// default so a partial (or absent) settings file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_context_token_budget")]
    pub context_token_budget: usize,
    #[serde(default = "default_semantic_top_k")]
    pub semantic_top_k: usize,
    #[serde(default = "default_model_retry_attempts")]
    pub model_retry_attempts: u32,
    #[serde(default = "default_max_tool_calls_per_request")]
    pub max_tool_calls_per_request: u32,
    #[serde(default = "default_request_wall_clock_seconds")]
    pub request_wall_clock_seconds: u64,
    #[serde(default = "default_embed_retry_attempts")]
    pub embed_retry_attempts: u32,
    #[serde(default = "default_embed_backoff_base_ms")]
    pub embed_backoff_base_ms: u64,
    #[serde(default = "default_chunk_target_tokens")]
    pub chunk_target_tokens: usize,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
    #[serde(default)]
    pub embedder_endpoint: Option<String>,
    #[serde(default = "default_embedder_timeout_seconds")]
    pub embedder_timeout_seconds: u64,
}

fn default_context_token_budget() -> usize {
    8_000
}

fn default_semantic_top_k() -> usize {
    8
}

fn default_model_retry_attempts() -> u32 {
    2
}

fn default_max_tool_calls_per_request() -> u32 {
    16
}

fn default_request_wall_clock_seconds() -> u64 {
    900
}

fn default_embed_retry_attempts() -> u32 {
    3
}

fn default_embed_backoff_base_ms() -> u64 {
    250
}

fn default_chunk_target_tokens() -> usize {
    450
}

fn default_chunk_max_tokens() -> usize {
    500
}

fn default_embedder_timeout_seconds() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            context_token_budget: default_context_token_budget(),
            semantic_top_k: default_semantic_top_k(),
            model_retry_attempts: default_model_retry_attempts(),
            max_tool_calls_per_request: default_max_tool_calls_per_request(),
            request_wall_clock_seconds: default_request_wall_clock_seconds(),
            embed_retry_attempts: default_embed_retry_attempts(),
            embed_backoff_base_ms: default_embed_backoff_base_ms(),
            chunk_target_tokens: default_chunk_target_tokens(),
            chunk_max_tokens: default_chunk_max_tokens(),
            embedder_endpoint: None,
            embedder_timeout_seconds: default_embedder_timeout_seconds(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context_token_budget == 0 {
            return Err(ConfigError::Settings(
                "contextTokenBudget must be greater than zero".to_string(),
            ));
        }
        if self.chunk_target_tokens == 0 {
            return Err(ConfigError::Settings(
                "chunkTargetTokens must be greater than zero".to_string(),
            ));
        }
        if self.chunk_max_tokens < self.chunk_target_tokens {
            return Err(ConfigError::Settings(format!(
                "chunkMaxTokens ({}) must be at least chunkTargetTokens ({})",
                self.chunk_max_tokens, self.chunk_target_tokens
            )));
        }
        if self.embed_retry_attempts == 0 {
            return Err(ConfigError::Settings(
                "embedRetryAttempts must be at least 1".to_string(),
            ));
        }
        if self.request_wall_clock_seconds == 0 {
            return Err(ConfigError::Settings(
                "requestWallClockSeconds must be greater than zero".to_string(),
            ));
        }
        if let Some(endpoint) = &self.embedder_endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ConfigError::Settings(format!(
                    "embedderEndpoint must be an http(s) url, got `{endpoint}`"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::load(&dir.path().join(SETTINGS_FILE_NAME)).expect("load");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_yaml_fills_remaining_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "contextTokenBudget: 2000\nsemanticTopK: 3\n").expect("write");
        let settings = Settings::load(&path).expect("load");
        assert_eq!(settings.context_token_budget, 2000);
        assert_eq!(settings.semantic_top_k, 3);
        assert_eq!(settings.embed_retry_attempts, 3);
    }

    #[test]
    fn invalid_chunk_bounds_are_rejected() {
        let settings = Settings {
            chunk_target_tokens: 500,
            chunk_max_tokens: 400,
            ..Settings::default()
        };
        let err = settings.validate().expect_err("must fail");
        assert!(err.to_string().contains("chunkMaxTokens"));
    }

    #[test]
    fn embedder_endpoint_must_be_http() {
        let settings = Settings {
            embedder_endpoint: Some("ftp://example".to_string()),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
