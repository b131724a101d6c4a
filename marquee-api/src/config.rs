//! Configuration for the recommendation API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use marquee_common::env::{parse_var, present, process_env};
use marquee_common::{LoggingConfig, load_config, parse_config};
use marquee_metrics::ExporterConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Common(#[from] marquee_common::Error),
    #[error("Metrics config: {0}")]
    Metrics(#[from] marquee_metrics::ConfigError),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete API configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Supabase connection settings.
    #[serde(default)]
    pub supabase: SupabaseConfig,

    /// Remote-write exporter settings.
    #[serde(default)]
    pub metrics: ExporterConfig,

    /// Loki log shipping settings.
    #[serde(default)]
    pub loki: LokiConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (default: "0.0.0.0:8000").
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Supabase project settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    #[serde(default)]
    pub url: Option<String>,

    /// API key, sent both as `apikey` and as a bearer token.
    #[serde(default, skip_serializing)]
    pub key: Option<String>,

    /// Minimum similarity for a match (default: 0.4).
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,

    /// Request timeout in seconds (default: 10).
    #[serde(default = "default_supabase_timeout")]
    pub timeout_secs: u64,
}

fn default_match_threshold() -> f64 {
    0.4
}

fn default_supabase_timeout() -> u64 {
    10
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            key: None,
            match_threshold: default_match_threshold(),
            timeout_secs: default_supabase_timeout(),
        }
    }
}

impl fmt::Debug for SupabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseConfig")
            .field("url", &self.url)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("match_threshold", &self.match_threshold)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Loki push settings.
///
/// Log shipping is enabled only when URL, username and password are all set.
#[derive(Clone, Serialize, Deserialize)]
pub struct LokiConfig {
    /// Push endpoint, e.g. `https://logs.example.net/loki/api/v1/push`.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Value of the `environment` stream label (default: "production").
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Lines buffered before new ones are dropped (default: 1024).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Most lines sent in one push (default: 100).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Longest a line waits before being sent, in ms (default: 1000).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    1000
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            environment: default_environment(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl fmt::Debug for LokiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LokiConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("environment", &self.environment)
            .field("queue_capacity", &self.queue_capacity)
            .field("batch_size", &self.batch_size)
            .field("flush_interval_ms", &self.flush_interval_ms)
            .finish()
    }
}

impl LokiConfig {
    /// Whether URL, username and password are all present.
    pub fn is_enabled(&self) -> bool {
        present(&self.url).is_some()
            && present(&self.username).is_some()
            && present(&self.password).is_some()
    }
}

impl SupabaseConfig {
    /// URL and key, when both are present.
    pub fn connection(&self) -> Option<(&str, &str)> {
        Some((present(&self.url)?, present(&self.key)?))
    }
}

impl ApiConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: ApiConfig = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ApiConfig = parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(&process_env)
    }

    /// Apply overrides from a variable lookup, then re-validate.
    pub fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SUPABASE_URL") {
            self.supabase.url = Some(url);
        }
        if let Some(key) = lookup("SUPABASE_KEY") {
            self.supabase.key = Some(key);
        }
        if let Some(threshold) = parse_var(lookup, "SUPABASE_MATCH_THRESHOLD")? {
            self.supabase.match_threshold = threshold;
        }

        self.metrics.apply_env(lookup)?;

        if let Some(url) = lookup("LOKI_URL") {
            self.loki.url = Some(url);
        }
        if let Some(username) = lookup("LOKI_USERNAME") {
            self.loki.username = Some(username);
        }
        if let Some(password) = lookup("LOKI_PASSWORD") {
            self.loki.password = Some(password);
        }
        if let Some(environment) = lookup("ENVIRONMENT") {
            self.loki.environment = environment;
        }

        self.validate()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.server.listen
            )));
        }

        if !(0.0..=1.0).contains(&self.supabase.match_threshold) {
            return Err(ConfigError::Validation(
                "match_threshold must be between 0 and 1".to_string(),
            ));
        }

        if self.supabase.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "supabase timeout_secs must be > 0".to_string(),
            ));
        }

        if self.loki.queue_capacity == 0 || self.loki.batch_size == 0 {
            return Err(ConfigError::Validation(
                "loki queue_capacity and batch_size must be > 0".to_string(),
            ));
        }

        if self.loki.flush_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "loki flush_interval_ms must be > 0".to_string(),
            ));
        }

        self.metrics.validate()?;
        Ok(())
    }
}
