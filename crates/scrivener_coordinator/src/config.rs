//! Worker configuration
//!
//! Reads `config.toml` from `$SCRIVENER_HOME` (or an explicit path). Every
//! field has a default, so a missing file means an all-default configuration.

use scrivener_protocol::defaults::{
    DEFAULT_CHARS_PER_TOKEN, DEFAULT_LOCK_DURATION_SECS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_STATE_STORE_URL, DEFAULT_WORKER_CONCURRENCY,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::generation::GenerationSettings;
use crate::params::ParamSpec;

/// Error type for config operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrivenerConfig {
    /// State store URL (`sqlite:<path>`)
    #[serde(default = "default_state_store")]
    pub state_store: String,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub assembler: AssemblerConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for ScrivenerConfig {
    fn default() -> Self {
        Self {
            state_store: default_state_store(),
            worker: WorkerConfig::default(),
            generation: GenerationConfig::default(),
            output: OutputConfig::default(),
            assembler: AssemblerConfig::default(),
            providers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum in-flight jobs per process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How long a claim is held before the job is redelivered
    #[serde(default = "default_lock_duration")]
    pub lock_duration_secs: u64,

    /// Sleep between claims when the queue is empty
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Attempts per job, used for jobs enqueued by `submit`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay; each further retry waits 4x longer
    #[serde(default = "default_backoff_base")]
    pub retry_backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub retry_backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lock_duration_secs: default_lock_duration(),
            poll_interval_ms: default_poll_interval(),
            max_attempts: default_max_attempts(),
            retry_backoff_base_ms: default_backoff_base(),
            retry_backoff_max_ms: default_backoff_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_min_output_chars")]
    pub min_output_chars: usize,

    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            min_output_chars: default_min_output_chars(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

impl GenerationConfig {
    pub fn settings(&self) -> GenerationSettings {
        GenerationSettings {
            min_output_chars: self.min_output_chars,
            chars_per_token: self.chars_per_token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Artifact root for the filesystem sink
    #[serde(default = "default_output_root")]
    pub root: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblerConfig {
    /// Directory holding tenant files, addressed by file id
    #[serde(default = "default_files_root")]
    pub files_root: PathBuf,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            files_root: default_files_root(),
        }
    }
}

/// An OpenAI-compatible endpoint and the models served through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    /// Base URL up to and including the version segment, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    /// Environment variable holding the API key (none for local servers)
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Supported generation parameters
    #[serde(default)]
    pub params: Vec<ParamSpec>,

    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Id referenced by workflow definitions
    pub id: String,

    /// Name sent to the API (defaults to `id`)
    #[serde(default)]
    pub api_name: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub context_window: u64,

    #[serde(default)]
    pub max_output_tokens: Option<u64>,

    /// Model-level parameter defaults
    #[serde(default)]
    pub defaults: Map<String, Value>,
}

impl ScrivenerConfig {
    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.worker.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_attempts must be at least 1".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            for model in &provider.models {
                if !seen.insert(model.id.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "model id '{}' is configured more than once",
                        model.id
                    )));
                }
                if model.context_window == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "model '{}' has a zero context window",
                        model.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Load configuration from a file. A missing file yields the defaults.
pub fn load_config(config_path: &Path) -> Result<ScrivenerConfig> {
    if !config_path.exists() {
        return Ok(ScrivenerConfig::default());
    }

    let content = std::fs::read_to_string(config_path)?;
    let config: ScrivenerConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// `$SCRIVENER_HOME/config.toml`
pub fn default_config_path() -> PathBuf {
    scrivener_logging::scrivener_home().join("config.toml")
}

fn default_state_store() -> String {
    DEFAULT_STATE_STORE_URL.to_string()
}
fn default_concurrency() -> usize {
    DEFAULT_WORKER_CONCURRENCY
}
fn default_lock_duration() -> u64 {
    DEFAULT_LOCK_DURATION_SECS
}
fn default_poll_interval() -> u64 {
    500
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_base() -> u64 {
    4_000
}
fn default_backoff_max() -> u64 {
    300_000
}
fn default_min_output_chars() -> usize {
    1
}
fn default_chars_per_token() -> usize {
    DEFAULT_CHARS_PER_TOKEN
}
fn default_output_root() -> PathBuf {
    scrivener_logging::scrivener_home().join("outputs")
}
fn default_files_root() -> PathBuf {
    scrivener_logging::scrivener_home().join("files")
}
fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamKind;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
state_store = "sqlite:/var/lib/scrivener/state.sqlite"

[worker]
concurrency = 64
max_attempts = 5

[[providers]]
name = "openai"
base_url = "https://api.openai.com/v1"
api_key_env = "OPENAI_API_KEY"

[[providers.params]]
key = "temperature"
kind = "float"
min = 0.0
max = 2.0
default = 0.7

[[providers.models]]
id = "gpt-4o-mini"
context_window = 128000
max_output_tokens = 16384

[providers.models.defaults]
temperature = 0.3
"#;

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config, ScrivenerConfig::default());
        assert_eq!(config.worker.lock_duration_secs, DEFAULT_LOCK_DURATION_SECS);
    }

    #[test]
    fn test_parse_sample() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.worker.concurrency, 64);
        assert_eq!(config.worker.max_attempts, 5);
        assert_eq!(config.worker.poll_interval_ms, 500);

        let provider = &config.providers[0];
        assert!(provider.enabled);
        assert_eq!(provider.params[0].kind, ParamKind::Float);
        let model = &provider.models[0];
        assert_eq!(model.context_window, 128_000);
        assert_eq!(model.defaults["temperature"], serde_json::json!(0.3));
    }

    #[test]
    fn test_duplicate_model_ids_rejected() {
        let mut config: ScrivenerConfig = toml::from_str(SAMPLE).unwrap();
        let dup = config.providers[0].clone();
        config.providers.push(dup);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = ScrivenerConfig::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
