use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration loaded from sessionlens.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub heuristics: HeuristicsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Optional TOML file replacing the built-in section schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_path: Option<PathBuf>,
}

/// Wire protocol spoken by a provider endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Ollama /api/chat
    Ollama,
    /// OpenAI-compatible /v1/chat/completions
    Openai,
}

/// One AI backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider identifier used in logs and reports
    pub id: String,
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    #[serde(default = "default_provider_url")]
    pub url: String,
    pub model: String,
    /// Environment variable holding the API key (openai kind)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Output ceiling requested from the provider
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Token bucket refill rate shared by all jobs
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Token bucket capacity
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Ollama
}

fn default_provider_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_burst() -> u32 {
    4
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of jobs processed concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Finished jobs kept in memory; older ones are answered from the report store
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retain_finished: default_retain_finished(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_retain_finished() -> usize {
    256
}

/// Hierarchical timeouts: call < pass < job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_call_seconds")]
    pub call_seconds: u64,
    #[serde(default = "default_pass_seconds")]
    pub pass_seconds: u64,
    #[serde(default = "default_job_seconds")]
    pub job_seconds: u64,
    /// Factor applied to the call timeout when retrying a timed-out field
    #[serde(default = "default_timeout_retry_multiplier")]
    pub timeout_retry_multiplier: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_seconds: default_call_seconds(),
            pass_seconds: default_pass_seconds(),
            job_seconds: default_job_seconds(),
            timeout_retry_multiplier: default_timeout_retry_multiplier(),
        }
    }
}

impl TimeoutConfig {
    pub fn call(&self) -> Duration {
        Duration::from_secs(self.call_seconds)
    }

    pub fn pass(&self) -> Duration {
        Duration::from_secs(self.pass_seconds)
    }

    pub fn job(&self) -> Duration {
        Duration::from_secs(self.job_seconds)
    }
}

fn default_call_seconds() -> u64 {
    60
}

fn default_pass_seconds() -> u64 {
    120
}

fn default_job_seconds() -> u64 {
    900
}

fn default_timeout_retry_multiplier() -> f64 {
    2.0
}

/// Gap-filling retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum targeted passes per job
    #[serde(default = "default_max_targeted_passes")]
    pub max_targeted_passes: u32,
    /// Maximum targeted attempts on any single field
    #[serde(default = "default_max_attempts_per_gap")]
    pub max_attempts_per_gap: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
    /// Consecutive quota errors after which a provider is excluded for the job
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_targeted_passes: default_max_targeted_passes(),
            max_attempts_per_gap: default_max_attempts_per_gap(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
        }
    }
}

fn default_max_targeted_passes() -> u32 {
    5
}

fn default_max_attempts_per_gap() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_backoff_jitter_ms() -> u64 {
    250
}

fn default_circuit_breaker_threshold() -> u32 {
    3
}

/// Tunable thresholds for confidence and cause inference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeuristicsConfig {
    /// Output at or above this share of the token ceiling counts as truncated
    #[serde(default = "default_token_limit_ratio")]
    pub token_limit_ratio: f64,
    /// Transcript excerpt budget for a targeted call
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
    /// Floor for the excerpt budget when shrinking after token-limit gaps
    #[serde(default = "default_min_excerpt_chars")]
    pub min_excerpt_chars: usize,
    /// Values equal to (or containing, for long markers) these are placeholders
    #[serde(default = "default_placeholder_markers")]
    pub placeholder_markers: Vec<String>,
    /// Phrases that lower confidence without rejecting the value
    #[serde(default = "default_boilerplate_markers")]
    pub boilerplate_markers: Vec<String>,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            token_limit_ratio: default_token_limit_ratio(),
            excerpt_chars: default_excerpt_chars(),
            min_excerpt_chars: default_min_excerpt_chars(),
            placeholder_markers: default_placeholder_markers(),
            boilerplate_markers: default_boilerplate_markers(),
        }
    }
}

fn default_token_limit_ratio() -> f64 {
    0.95
}

fn default_excerpt_chars() -> usize {
    6000
}

fn default_min_excerpt_chars() -> usize {
    800
}

fn default_placeholder_markers() -> Vec<String> {
    [
        "n/a",
        "na",
        "none",
        "null",
        "tbd",
        "todo",
        "unknown",
        "not available",
        "not applicable",
        "no data",
        "...",
        "lorem ipsum",
        "not enough information",
        "insufficient information",
        "not mentioned in the transcript",
        "cannot be determined",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_boilerplate_markers() -> Vec<String> {
    [
        "as an ai",
        "i cannot",
        "i'm sorry",
        "based on the provided transcript",
        "it is important to note",
        "overall, the session",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Report store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON file holding finalized jobs
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("reports.json")
}

impl Config {
    /// Load config from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e))?;
        toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))
    }

    /// Try to load config from sessionlens.toml in the given directory
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let config_path = dir.join("sessionlens.toml");
        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Merge CLI overrides into the config
    pub fn with_overrides(mut self, workers: Option<usize>, budget: Option<u32>) -> Self {
        if let Some(w) = workers {
            self.queue.workers = w;
        }
        if let Some(b) = budget {
            self.retry.max_targeted_passes = b;
        }
        self
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.requests_per_minute == 0 || provider.burst == 0 {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}' needs a non-zero rate limit",
                    provider.id
                )));
            }
        }
        if self.queue.workers == 0 {
            return Err(ConfigError::Invalid("queue.workers must be at least 1".to_string()));
        }
        let t = &self.timeouts;
        if !(t.call_seconds < t.pass_seconds && t.pass_seconds < t.job_seconds) {
            return Err(ConfigError::TimeoutHierarchy {
                call: t.call_seconds,
                pass: t.pass_seconds,
                job: t.job_seconds,
            });
        }
        if t.timeout_retry_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "timeouts.timeout_retry_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, std::io::Error),
    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, toml::de::Error),
    #[error("No providers configured")]
    NoProviders,
    #[error("Timeouts must satisfy call < pass < job (got {call}s, {pass}s, {job}s)")]
    TimeoutHierarchy { call: u64, pass: u64, job: u64 },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            kind: ProviderKind::Ollama,
            url: default_provider_url(),
            model: "qwen3".to_string(),
            api_key_env: None,
            max_output_tokens: 4096,
            requests_per_minute: 60,
            burst: 4,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.providers.is_empty());
        assert_eq!(config.queue.workers, 4);
        assert_eq!(config.timeouts.call_seconds, 60);
        assert_eq!(config.timeouts.pass_seconds, 120);
        assert_eq!(config.timeouts.job_seconds, 900);
        assert_eq!(config.retry.max_targeted_passes, 5);
        assert_eq!(config.retry.circuit_breaker_threshold, 3);
        assert_eq!(config.store.path, PathBuf::from("reports.json"));
        assert!(config.heuristics.placeholder_markers.contains(&"tbd".to_string()));
    }

    #[test]
    fn test_config_with_overrides() {
        let config = Config::default().with_overrides(Some(8), Some(2));
        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.retry.max_targeted_passes, 2);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[queue]
workers = 2

[timeouts]
call_seconds = 30

[[providers]]
id = "local"
model = "qwen3:14b"

[[providers]]
id = "cloud"
kind = "openai"
url = "https://api.example.com"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
requests_per_minute = 20
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.timeouts.call_seconds, 30);
        assert_eq!(config.timeouts.pass_seconds, 120); // default
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].kind, ProviderKind::Ollama);
        assert_eq!(config.providers[0].url, "http://localhost:11434");
        assert_eq!(config.providers[1].kind, ProviderKind::Openai);
        assert_eq!(config.providers[1].requests_per_minute, 20);
        assert_eq!(config.providers[1].burst, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_providers() {
        assert!(matches!(Config::default().validate(), Err(ConfigError::NoProviders)));
    }

    #[test]
    fn test_validate_rejects_bad_timeout_hierarchy() {
        let mut config = Config::default();
        config.providers.push(provider("a"));
        config.timeouts.call_seconds = 200;
        assert!(matches!(config.validate(), Err(ConfigError::TimeoutHierarchy { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut config = Config::default();
        config.providers.push(provider("a"));
        config.providers.push(provider("a"));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
