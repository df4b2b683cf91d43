
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    pub pool: PoolConfig,
    pub provider: ProviderConfig,
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Tuning for the processor pool and the per-batch token budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    pub processor_count: usize,
    pub batch_size: usize,
    pub min_delay_between_batches_ms: u64,
    pub dynamic_delay: bool,
    pub max_runtime_hours: f64,
    pub stagger_start_ms: u64,
    pub rate_limit_recovery_wait_ms: u64,
    pub max_rate_limit_retries: u32,
    pub max_token_budget: u64,
    pub avg_tokens_per_job: u64,
    pub safety_margin: f64,
    pub min_priority: i64,
    pub status_interval_secs: u64,
    pub stuck_job_timeout_secs: u64,
}

/// Connection settings for the embedding provider, including its published
/// rate limits. The limits feed the pool's delay calculation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub timeout_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid provider endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid processor count: {0} (must be between 1 and 64)")]
    InvalidProcessorCount(usize),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(usize),
    #[error("Invalid safety margin: {0} (must be between 0 and 1)")]
    InvalidSafetyMargin(f64),
    #[error("Invalid rate limit: requests and tokens per minute must be non-zero")]
    InvalidRateLimit,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Default for PoolConfig {
    #[inline]
    fn default() -> Self {
        Self {
            processor_count: 4,
            batch_size: 10,
            min_delay_between_batches_ms: 1000,
            dynamic_delay: true,
            max_runtime_hours: 6.0,
            stagger_start_ms: 2000,
            rate_limit_recovery_wait_ms: 70_000,
            max_rate_limit_retries: 3,
            max_token_budget: 100_000,
            avg_tokens_per_job: 2000,
            safety_margin: 0.85,
            min_priority: 0,
            status_interval_secs: 30,
            stuck_job_timeout_secs: 300,
        }
    }
}

impl Default for ProviderConfig {
    #[inline]
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: None,
            requests_per_minute: 3000,
            tokens_per_minute: 1_000_000,
            timeout_seconds: 30,
        }
    }
}

impl Config {
    #[inline]
    pub fn config_dir_path(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| Self::default_config_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    #[inline]
    pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".embedq"))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.config_dir_path().join("config.toml")
    }

    #[inline]
    pub fn database_path(&self) -> PathBuf {
        env::var("EMBEDQ_DATABASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.config_dir_path().join("embedq.db"))
    }

    /// Load configuration: TOML file if present, then environment overrides.
    #[inline]
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        let config_path = config.config_file_path();
        if config_path.exists() {
            let content = fs::read_to_string(&config_path).with_context(|| {
                format!("Failed to read config file: {}", config_path.display())
            })?;
            config = toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?;
        }

        config.apply_env_overrides();

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.config_dir_path();
        fs::create_dir_all(&config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Environment variables take precedence over the config file.
    #[inline]
    pub fn apply_env_overrides(&mut self) {
        apply_env("PROCESSOR_COUNT", &mut self.pool.processor_count);
        apply_env("BATCH_SIZE", &mut self.pool.batch_size);
        apply_env(
            "MIN_DELAY_BETWEEN_BATCHES_MS",
            &mut self.pool.min_delay_between_batches_ms,
        );
        apply_env("DYNAMIC_DELAY", &mut self.pool.dynamic_delay);
        apply_env("MAX_RUNTIME_HOURS", &mut self.pool.max_runtime_hours);
        apply_env("STAGGER_START_MS", &mut self.pool.stagger_start_ms);
        apply_env(
            "RATE_LIMIT_RECOVERY_WAIT_MS",
            &mut self.pool.rate_limit_recovery_wait_ms,
        );
        apply_env(
            "MAX_RATE_LIMIT_RETRIES",
            &mut self.pool.max_rate_limit_retries,
        );
        apply_env("MAX_TOKEN_BUDGET", &mut self.pool.max_token_budget);
        apply_env("AVG_TOKENS_PER_JOB", &mut self.pool.avg_tokens_per_job);
        apply_env("SAFETY_MARGIN", &mut self.pool.safety_margin);

        if let Ok(endpoint) = env::var("EMBEDDING_API_URL") {
            self.provider.endpoint = endpoint;
        }
        if let Ok(model) = env::var("EMBEDDING_MODEL") {
            self.provider.model = model;
        }
        if let Ok(key) = env::var("EMBEDDING_API_KEY") {
            self.provider.api_key = Some(key);
        }
        apply_env("EMBEDDING_RPM", &mut self.provider.requests_per_minute);
        apply_env("EMBEDDING_TPM", &mut self.provider.tokens_per_minute);
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.provider.validate()
    }
}

impl PoolConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processor_count == 0 || self.processor_count > 64 {
            return Err(ConfigError::InvalidProcessorCount(self.processor_count));
        }
        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }
        if self.safety_margin <= 0.0 || self.safety_margin > 1.0 {
            return Err(ConfigError::InvalidSafetyMargin(self.safety_margin));
        }
        Ok(())
    }
}

impl ProviderConfig {
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint_url()?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }
        if self.requests_per_minute == 0 || self.tokens_per_minute == 0 {
            return Err(ConfigError::InvalidRateLimit);
        }
        Ok(())
    }

    #[inline]
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.endpoint).map_err(|_| ConfigError::InvalidEndpoint(self.endpoint.clone()))
    }
}

fn apply_env<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring unparseable value for {}: {}", key, raw),
        }
    }
}
