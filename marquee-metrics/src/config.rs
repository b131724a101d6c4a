//! Configuration for the remote-write exporter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use marquee_common::env::{parse_var, present, process_env};

/// Environment variable holding the remote-write endpoint URL.
pub const ENV_ENDPOINT: &str = "METRICS_ENDPOINT";
/// Environment variable holding the Basic auth username.
pub const ENV_USERNAME: &str = "METRICS_USERNAME";
/// Environment variable holding the Basic auth password.
pub const ENV_PASSWORD: &str = "METRICS_PASSWORD";
/// Environment variable holding the push interval in seconds.
pub const ENV_PUSH_INTERVAL: &str = "METRICS_PUSH_INTERVAL";
/// Environment variable holding the request timeout in seconds.
pub const ENV_TIMEOUT: &str = "METRICS_TIMEOUT";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Environment error: {0}")]
    Env(#[from] marquee_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Basic auth credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Remote-write exporter settings.
///
/// The exporter is enabled only when the endpoint, username and password are
/// all present; anything less leaves it disabled without being an error.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Remote-write endpoint URL.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Basic auth username.
    #[serde(default)]
    pub username: Option<String>,

    /// Basic auth password.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Seconds between pushes (default: 15).
    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,

    /// Per-request timeout in seconds (default: 10).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Value of the `job` label attached to every series (default: "movie-api").
    #[serde(default = "default_job")]
    pub job: String,

    /// Labels added to every series that does not already carry them.
    #[serde(default)]
    pub default_labels: HashMap<String, String>,
}

fn default_push_interval() -> u64 {
    15
}

fn default_timeout() -> u64 {
    10
}

fn default_job() -> String {
    "movie-api".to_string()
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            username: None,
            password: None,
            push_interval_secs: default_push_interval(),
            timeout_secs: default_timeout(),
            job: default_job(),
            default_labels: HashMap::new(),
        }
    }
}

impl fmt::Debug for ExporterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("push_interval_secs", &self.push_interval_secs)
            .field("timeout_secs", &self.timeout_secs)
            .field("job", &self.job)
            .field("default_labels", &self.default_labels)
            .finish()
    }
}

impl ExporterConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(process_env)
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields with any variables the lookup provides.
    pub fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = Some(endpoint);
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.username = Some(username);
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.password = Some(password);
        }
        if let Some(interval) = parse_var(lookup, ENV_PUSH_INTERVAL)? {
            self.push_interval_secs = interval;
        }
        if let Some(timeout) = parse_var(lookup, ENV_TIMEOUT)? {
            self.timeout_secs = timeout;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.push_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "push_interval_secs must be >= 1".to_string(),
            ));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "timeout_secs must be >= 1".to_string(),
            ));
        }

        if let Some(endpoint) = present(&self.endpoint) {
            let url = reqwest::Url::parse(endpoint).map_err(|e| {
                ConfigError::Validation(format!("Invalid endpoint '{}': {}", endpoint, e))
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ConfigError::Validation(format!(
                    "Endpoint must use http or https: {}",
                    endpoint
                )));
            }
        }

        Ok(())
    }

    /// Whether endpoint, username and password are all present.
    pub fn is_enabled(&self) -> bool {
        present(&self.endpoint).is_some()
            && present(&self.username).is_some()
            && present(&self.password).is_some()
    }

    /// The endpoint, when present.
    pub fn endpoint(&self) -> Option<&str> {
        present(&self.endpoint)
    }

    /// The credential pair, when both halves are present.
    pub fn credentials(&self) -> Option<Credentials> {
        match (present(&self.username), &self.password) {
            (Some(username), Some(password)) if !password.is_empty() => Some(Credentials {
                username: username.to_string(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Push interval as a [`Duration`].
    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs)
    }

    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    const FULL: &[(&str, &str)] = &[
        ("METRICS_ENDPOINT", "https://prometheus.example.com/api/prom/push"),
        ("METRICS_USERNAME", "12345"),
        ("METRICS_PASSWORD", "secret"),
    ];

    #[test]
    fn test_defaults() {
        let config = ExporterConfig::default();
        assert_eq!(config.push_interval_secs, 15);
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.job, "movie-api");
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_from_lookup_full() {
        let config = ExporterConfig::from_lookup(lookup_from(FULL)).unwrap();

        assert!(config.is_enabled());
        assert_eq!(
            config.endpoint(),
            Some("https://prometheus.example.com/api/prom/push")
        );
        let creds = config.credentials().unwrap();
        assert_eq!(creds.username, "12345");
        assert_eq!(creds.password, "secret");
        assert_eq!(config.push_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_missing_any_required_field_disables() {
        for skip in ["METRICS_ENDPOINT", "METRICS_USERNAME", "METRICS_PASSWORD"] {
            let vars: Vec<(&str, &str)> =
                FULL.iter().copied().filter(|(k, _)| *k != skip).collect();
            let config = ExporterConfig::from_lookup(lookup_from(&vars)).unwrap();
            assert!(!config.is_enabled(), "{} missing should disable", skip);
        }
    }

    #[test]
    fn test_blank_value_disables() {
        let mut config = ExporterConfig::from_lookup(lookup_from(FULL)).unwrap();
        config.username = Some("   ".to_string());
        assert!(!config.is_enabled());
        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_interval_and_timeout_from_env() {
        let mut vars = FULL.to_vec();
        vars.push(("METRICS_PUSH_INTERVAL", "30"));
        vars.push(("METRICS_TIMEOUT", "3"));
        let config = ExporterConfig::from_lookup(lookup_from(&vars)).unwrap();

        assert_eq!(config.push_interval(), Duration::from_secs(30));
        assert_eq!(config.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = ExporterConfig::from_lookup(lookup_from(&[("METRICS_PUSH_INTERVAL", "0")]));
        assert!(result.unwrap_err().to_string().contains("push_interval_secs"));
    }

    #[test]
    fn test_unparseable_interval_rejected() {
        let result =
            ExporterConfig::from_lookup(lookup_from(&[("METRICS_PUSH_INTERVAL", "fast")]));
        assert!(matches!(result, Err(ConfigError::Env(_))));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let result = ExporterConfig::from_lookup(lookup_from(&[("METRICS_ENDPOINT", "not a url")]));
        assert!(result.unwrap_err().to_string().contains("Invalid endpoint"));

        let result =
            ExporterConfig::from_lookup(lookup_from(&[("METRICS_ENDPOINT", "ftp://host/push")]));
        assert!(result.unwrap_err().to_string().contains("http or https"));
    }

    #[test]
    fn test_parse_json5() {
        let json = r#"{
            endpoint: "http://localhost:9090/api/v1/write",
            username: "user",
            password: "pass",
            push_interval_secs: 5,
            job: "recs",
            default_labels: { environment: "staging" },
        }"#;

        let config = ExporterConfig::parse(json).unwrap();
        assert!(config.is_enabled());
        assert_eq!(config.push_interval_secs, 5);
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.job, "recs");
        assert_eq!(
            config.default_labels.get("environment"),
            Some(&"staging".to_string())
        );
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ExporterConfig::from_lookup(lookup_from(FULL)).unwrap();
        let rendered = format!("{:?} {:?}", config, config.credentials().unwrap());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
