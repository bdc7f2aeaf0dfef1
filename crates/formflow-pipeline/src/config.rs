//! Configuration for the extraction pipeline

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// TOML could not be parsed
    #[error("Failed to parse TOML: {0}")]
    Parse(String),

    /// TOML could not be produced
    #[error("Failed to serialize to TOML: {0}")]
    Serialize(String),

    /// Configuration file could not be read
    #[error("Failed to read config file: {0}")]
    Io(String),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Retry bounds for one kind of external call
///
/// `max_retries` is the maximum number of attempts, the first one included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts when the callee keeps rate limiting us
    pub max_retries: u32,

    /// Maximum retries after other transient failures (timeouts, network)
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,

    /// Delay before the first retry (milliseconds)
    pub base_backoff_ms: u64,

    /// Upper bound on any single delay (milliseconds)
    pub max_backoff_ms: u64,

    /// Upper bound on the summed delays of one call (milliseconds)
    pub max_total_wait_ms: u64,

    /// Bound on a single attempt (seconds)
    pub call_timeout_secs: u64,
}

fn default_transient_retries() -> u32 {
    2
}

impl RetryPolicy {
    /// Defaults for analysis calls
    pub fn analysis() -> Self {
        Self {
            max_retries: 5,
            transient_retries: 2,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_total_wait_ms: 120_000,
            call_timeout_secs: 120,
        }
    }

    /// Defaults for record store and artifact store calls
    pub fn persistence() -> Self {
        Self {
            max_retries: 3,
            transient_retries: 2,
            base_backoff_ms: 100,
            max_backoff_ms: 2_000,
            max_total_wait_ms: 10_000,
            call_timeout_secs: 30,
        }
    }

    /// Delay before the first retry
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    /// Cap on a single delay
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Cap on the summed delays of one call
    pub fn max_total_wait(&self) -> Duration {
        Duration::from_millis(self.max_total_wait_ms)
    }

    /// Bound on a single attempt
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Exponential delay before retry number `retry` (1-based), capped
    ///
    /// ```
    /// use formflow_pipeline::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::persistence();
    /// assert_eq!(policy.backoff(1), Duration::from_millis(100));
    /// assert_eq!(policy.backoff(3), Duration::from_millis(400));
    /// assert_eq!(policy.backoff(30), Duration::from_millis(2_000));
    /// ```
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        let delay = self.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}.max_retries must be greater than 0",
                section
            )));
        }
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}.base_backoff_ms must be greater than 0",
                section
            )));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "{}.base_backoff_ms cannot exceed max_backoff_ms",
                section
            )));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}.call_timeout_secs must be greater than 0",
                section
            )));
        }
        Ok(())
    }
}

/// Configuration for a job orchestrator
///
/// Passed by value into the orchestrator; nothing is read from the
/// environment. Missing top-level keys and sections fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pages per form
    pub chunk_span: u32,

    /// Maximum chunks in flight at once
    pub concurrency_limit: usize,

    /// Analysis model identifier
    pub model_id: String,

    /// Lifetime of readable artifact locators (seconds)
    pub artifact_ttl_secs: u64,

    /// Retry bounds for the analysis gateway
    pub analysis: RetryPolicy,

    /// Retry bounds for record and artifact persistence
    pub persistence: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_span: 2,
            concurrency_limit: 3,
            model_id: "prebuilt-layout".to_string(),
            artifact_ttl_secs: 3600,
            analysis: RetryPolicy::analysis(),
            persistence: RetryPolicy::persistence(),
        }
    }
}

impl PipelineConfig {
    /// Aggressive preset: more parallelism, short waits, gives up early
    pub fn aggressive() -> Self {
        Self {
            concurrency_limit: 8,
            analysis: RetryPolicy {
                max_retries: 3,
                transient_retries: 1,
                base_backoff_ms: 200,
                max_backoff_ms: 5_000,
                max_total_wait_ms: 20_000,
                call_timeout_secs: 60,
            },
            persistence: RetryPolicy {
                max_retries: 2,
                transient_retries: 1,
                base_backoff_ms: 50,
                max_backoff_ms: 500,
                max_total_wait_ms: 2_000,
                call_timeout_secs: 10,
            },
            ..Self::default()
        }
    }

    /// Lenient preset: gentle on a strict rate limit, patient retries
    pub fn lenient() -> Self {
        Self {
            concurrency_limit: 1,
            analysis: RetryPolicy {
                max_retries: 10,
                transient_retries: 4,
                base_backoff_ms: 1_000,
                max_backoff_ms: 60_000,
                max_total_wait_ms: 600_000,
                call_timeout_secs: 300,
            },
            persistence: RetryPolicy {
                max_retries: 5,
                transient_retries: 3,
                base_backoff_ms: 200,
                max_backoff_ms: 5_000,
                max_total_wait_ms: 30_000,
                call_timeout_secs: 60,
            },
            ..Self::default()
        }
    }

    /// Lifetime of readable artifact locators
    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_span == 0 {
            return Err(ConfigError::Invalid(
                "chunk_span must be greater than 0".to_string(),
            ));
        }
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid(
                "concurrency_limit must be greater than 0".to_string(),
            ));
        }
        if self.model_id.trim().is_empty() {
            return Err(ConfigError::Invalid("model_id must not be empty".to_string()));
        }
        if self.artifact_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "artifact_ttl_secs must be greater than 0".to_string(),
            ));
        }
        self.analysis.validate("analysis")?;
        self.persistence.validate("persistence")?;
        Ok(())
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::Io(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_span, 2);
        assert_eq!(config.concurrency_limit, 3);
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(PipelineConfig::aggressive().validate().is_ok());
        assert!(PipelineConfig::lenient().validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_span_rejected() {
        let config = PipelineConfig {
            chunk_span: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = PipelineConfig {
            concurrency_limit: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let mut config = PipelineConfig::default();
        config.persistence.base_backoff_ms = config.persistence.max_backoff_ms + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("persistence.base_backoff_ms"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            chunk_span = 4
            model_id = "custom-invoice"

            [analysis]
            max_retries = 7
            base_backoff_ms = 250
            max_backoff_ms = 8000
            max_total_wait_ms = 60000
            call_timeout_secs = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.chunk_span, 4);
        assert_eq!(config.concurrency_limit, 3);
        assert_eq!(config.model_id, "custom-invoice");
        assert_eq!(config.analysis.max_retries, 7);
        assert_eq!(config.analysis.transient_retries, 2);
        assert_eq!(config.persistence, RetryPolicy::persistence());
    }

    #[test]
    fn test_invalid_toml_values_rejected() {
        assert!(matches!(
            PipelineConfig::from_toml("concurrency_limit = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            PipelineConfig::from_toml("chunk_span = \"two\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = PipelineConfig::lenient();
        let toml_str = config.to_toml().unwrap();
        let parsed = PipelineConfig::from_toml(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "concurrency_limit = 5\n").unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.concurrency_limit, 5);

        let missing = PipelineConfig::from_file(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::analysis();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(4), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(7), Duration::from_millis(30_000));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(30_000));
    }
}
