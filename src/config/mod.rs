//! Configuration module for reqtrace
//!
//! YAML configuration with environment variable expansion and validation.
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! ```yaml
//! agent:
//!   service_name: "${SERVICE_NAME:-reqtrace}"
//! sampling:
//!   strategy: parent_based
//!   ratio: 0.25
//! transactions:
//!   ignore_urls: ["/health"]
//! ```

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static! {
    static ref ENV_PLACEHOLDER: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}")
            .expect("placeholder pattern is valid");
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in ENV_PLACEHOLDER.captures_iter(s) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let var_name = &cap[1];

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// `deserialize_with` helper expanding environment variables in one value
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub transactions: TransactionsConfig,
    #[serde(default)]
    pub reporter: ReporterConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

const SAMPLING_STRATEGIES: &[&str] = &["always", "never", "ratio", "parent_based"];
const REPORTER_KINDS: &[&str] = &["log", "none"];

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.enabled && self.agent.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "agent.service_name must not be empty".into(),
            ));
        }

        if self.agent.framework_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "agent.framework_name must not be empty".into(),
            ));
        }

        if !SAMPLING_STRATEGIES.contains(&self.sampling.strategy.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid sampling strategy '{}': must be one of {}",
                self.sampling.strategy,
                SAMPLING_STRATEGIES.join(", ")
            )));
        }

        if !(0.0..=1.0).contains(&self.sampling.ratio) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid sampling ratio {}: must be between 0.0 and 1.0",
                self.sampling.ratio
            )));
        }

        for (i, rule) in self.sampling.rules.iter().enumerate() {
            if !(0.0..=1.0).contains(&rule.sample_rate) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid sample_rate {} in sampling rule {}: must be between 0.0 and 1.0",
                    rule.sample_rate, i
                )));
            }
        }

        if !REPORTER_KINDS.contains(&self.reporter.kind.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid reporter kind '{}': must be one of {}",
                self.reporter.kind,
                REPORTER_KINDS.join(", ")
            )));
        }

        validate_address("server.address", &self.server.address)?;
        if self.metrics.enabled {
            validate_address("metrics.address", &self.metrics.address)?;
        }

        Ok(())
    }
}

fn validate_address(field: &str, address: &str) -> Result<(), ConfigError> {
    address.parse::<SocketAddr>().map(|_| ()).map_err(|e| {
        ConfigError::ValidationError(format!("Invalid {} '{}': {}", field, address, e))
    })
}

// ============================================================================
// Sections
// ============================================================================

/// Agent identity and master switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Service name (supports ${VAR} expansion)
    #[serde(
        default = "default_service_name",
        deserialize_with = "deserialize_with_env"
    )]
    pub service_name: String,
    /// Framework tagged on every transaction
    #[serde(default = "default_framework_name")]
    pub framework_name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: default_service_name(),
            framework_name: default_framework_name(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_service_name() -> String {
    "reqtrace".to_string()
}

fn default_framework_name() -> String {
    "hyper".to_string()
}

/// Sampling configuration
///
/// - `always`: sample every request
/// - `never`: sample nothing
/// - `ratio`: sample based on `ratio`, deterministic on the trace id
/// - `parent_based`: follow the inbound `traceparent` flag, `ratio` for roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_sampling_strategy")]
    pub strategy: String,
    #[serde(default = "default_sampling_ratio")]
    pub ratio: f64,
    /// Checked in order before the strategy; first match wins
    #[serde(default)]
    pub rules: Vec<SamplingRuleConfig>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: default_sampling_strategy(),
            ratio: default_sampling_ratio(),
            rules: Vec::new(),
        }
    }
}

fn default_sampling_strategy() -> String {
    "parent_based".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

/// Per-path/method sampling override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingRuleConfig {
    /// Exact path, or a prefix ending in `/*`
    #[serde(default)]
    pub path_pattern: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    pub sample_rate: f64,
}

/// Transaction capture settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionsConfig {
    /// Paths that never get a transaction (`/*` suffix for prefixes)
    #[serde(default)]
    pub ignore_urls: Vec<String>,
    /// Copy request headers into transaction metadata
    #[serde(default)]
    pub capture_headers: bool,
}

/// Where ended transactions go
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterConfig {
    /// `log` or `none`
    #[serde(default = "default_reporter_kind")]
    pub kind: String,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            kind: default_reporter_kind(),
        }
    }
}

fn default_reporter_kind() -> String {
    "log".to_string()
}

/// Demo server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

fn default_server_address() -> String {
    "127.0.0.1:8080".to_string()
}

/// Diagnostic logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Prometheus endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent.framework_name, "hyper");
        assert_eq!(config.sampling.strategy, "parent_based");
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.agent.enabled);
        assert_eq!(config.reporter.kind, "log");
        assert_eq!(config.server.address, "127.0.0.1:8080");
    }

    #[test]
    fn test_validation_rejects_bad_ratio() {
        let mut config = Config::default();
        config.sampling.ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_rule_rate() {
        let mut config = Config::default();
        config.sampling.rules.push(SamplingRuleConfig {
            path_pattern: Some("/internal/*".into()),
            method: None,
            sample_rate: -0.1,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_strategy() {
        let mut config = Config::default();
        config.sampling.strategy = "sometimes".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_reporter() {
        let mut config = Config::default();
        config.reporter.kind = "kafka".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_address() {
        let mut config = Config::default();
        config.server.address = "localhost".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.metrics.address = "nowhere".into();
        assert!(config.validate().is_err());
        config.metrics.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_service_name() {
        let mut config = Config::default();
        config.agent.service_name = "  ".into();
        assert!(config.validate().is_err());

        config.agent.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_expand_env_vars_with_default() {
        std::env::set_var("REQTRACE_TEST_SERVICE", "orders");
        std::env::remove_var("REQTRACE_TEST_MISSING");

        assert_eq!(
            expand_env_vars("svc-${REQTRACE_TEST_SERVICE}"),
            "svc-orders"
        );
        assert_eq!(
            expand_env_vars("${REQTRACE_TEST_MISSING:-fallback}"),
            "fallback"
        );
        assert_eq!(
            expand_env_vars("${REQTRACE_TEST_MISSING}"),
            "${REQTRACE_TEST_MISSING}"
        );

        std::env::remove_var("REQTRACE_TEST_SERVICE");
    }

    #[test]
    #[serial]
    fn test_service_name_expanded_on_deserialize() {
        std::env::set_var("REQTRACE_TEST_NAME", "checkout");
        let config: Config =
            serde_yaml::from_str("agent:\n  service_name: \"${REQTRACE_TEST_NAME}\"\n").unwrap();
        assert_eq!(config.agent.service_name, "checkout");
        std::env::remove_var("REQTRACE_TEST_NAME");
    }
}
