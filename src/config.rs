use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clients::openai::DEFAULT_API_BASE;
use crate::error::{AttrGenError, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "configs/attribute_generation.yaml";
pub const CONFIG_ENV_VAR: &str = "ATTRGEN_CONFIG";
const MAX_RETRIES_CEILING: u32 = 10;

/// Pipeline configuration loaded from YAML, then env overrides, then CLI flags
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub model_name: String,
    pub system_prompt: String,
    pub keys_path: PathBuf,
    pub max_concurrent_per_key: usize,
    pub max_retries: u32,
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub run_concept_generation: bool,
    pub run_value_generation: bool,
    pub concepts_per_object: usize,
    pub values_per_concept: usize,
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`)
    pub api_base: String,
    pub temperature: f32,
    pub request_timeout_ms: u64,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Optional provider-side request quota per key
    pub requests_per_minute_per_key: Option<u32>,
    /// Write a checkpoint after this many completed requests (0 = only at phase end)
    pub save_every: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model_name: "gpt-4o-mini".to_string(),
            system_prompt: "You are a helpful assistant that describes visual attributes of everyday objects.".to_string(),
            keys_path: PathBuf::from("configs/keys.yaml"),
            max_concurrent_per_key: 4,
            max_retries: 3,
            input_file: PathBuf::from("assets/objects.json"),
            output_file: PathBuf::from("assets/attributes.json"),
            run_concept_generation: true,
            run_value_generation: true,
            concepts_per_object: 5,
            values_per_concept: 5,
            api_base: DEFAULT_API_BASE.to_string(),
            temperature: 0.7,
            request_timeout_ms: 60_000,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            requests_per_minute_per_key: None,
            save_every: 50,
        }
    }
}

/// Load `ATTRGEN_ENV_FILE`, or `.env` from the working directory. Variables
/// already set in the process win.
pub fn load_env_file() {
    if let Ok(env_path) = std::env::var("ATTRGEN_ENV_FILE") {
        let _ = dotenvy::from_path(env_path);
    } else {
        let _ = dotenvy::dotenv();
    }
}

/// Pick the config path: explicit argument, then `ATTRGEN_CONFIG`, then the default.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    std::env::var(CONFIG_ENV_VAR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl GenerationConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read the YAML file, apply env overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| AttrGenError::io(path, e))?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Env-first overrides for the settings most often changed between runs.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("ATTRGEN_MODEL")
            && !model.trim().is_empty()
        {
            self.model_name = model;
            tracing::debug!("ATTRGEN_MODEL env override applied");
        }
        if let Ok(base) = std::env::var("ATTRGEN_API_BASE")
            && !base.trim().is_empty()
        {
            self.api_base = base;
            tracing::debug!("ATTRGEN_API_BASE env override applied");
        }
        if let Ok(keys) = std::env::var("ATTRGEN_KEYS_PATH")
            && !keys.trim().is_empty()
        {
            self.keys_path = PathBuf::from(keys);
        }
        if let Some(retries) = std::env::var("ATTRGEN_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            self.max_retries = retries;
        }
        if let Some(concurrency) = std::env::var("ATTRGEN_MAX_CONCURRENT_PER_KEY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.max_concurrent_per_key = concurrency;
        }
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(AttrGenError::config("model_name must not be empty"));
        }
        if self.max_concurrent_per_key == 0 {
            return Err(AttrGenError::config("max_concurrent_per_key must be at least 1"));
        }
        if self.concepts_per_object == 0 {
            return Err(AttrGenError::config("concepts_per_object must be at least 1"));
        }
        if self.values_per_concept == 0 {
            return Err(AttrGenError::config("values_per_concept must be at least 1"));
        }
        if !self.run_concept_generation && !self.run_value_generation {
            return Err(AttrGenError::config(
                "both run_concept_generation and run_value_generation are disabled; nothing to do",
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(AttrGenError::config("temperature must be between 0.0 and 2.0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(AttrGenError::config("request_timeout_ms must be positive"));
        }
        if self.requests_per_minute_per_key == Some(0) {
            return Err(AttrGenError::config(
                "requests_per_minute_per_key must be positive when set",
            ));
        }
        if self.max_retries > MAX_RETRIES_CEILING {
            tracing::warn!(
                "max_retries {} exceeds max {}, clamping",
                self.max_retries,
                MAX_RETRIES_CEILING
            );
            self.max_retries = MAX_RETRIES_CEILING;
        }
        if self.retry_max_delay_ms < self.retry_initial_delay_ms {
            tracing::warn!(
                "retry_max_delay_ms {} is below retry_initial_delay_ms {}, raising it",
                self.retry_max_delay_ms,
                self.retry_initial_delay_ms
            );
            self.retry_max_delay_ms = self.retry_initial_delay_ms;
        }
        if !self.api_base.starts_with("http://") && !self.api_base.starts_with("https://") {
            tracing::warn!(
                "API base '{}' doesn't start with http:// or https://",
                self.api_base
            );
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: 2.0,
        }
    }
}
