//! Application configuration.
//!
//! Aggregates retry, business and trust settings into a single [`CoreConfig`]
//! that can be loaded from a YAML file or environment variables.

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ACCORD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ACCORD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ACCORD_LOG";

/// Transaction retry and backoff settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum transaction attempts before giving up.
    pub max_attempts: usize,
    /// Initial backoff delay in milliseconds.
    pub min_delay_ms: u64,
    /// Backoff delay ceiling in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            min_delay_ms: 10,
            max_delay_ms: 2000,
        }
    }
}

/// Domain-level tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusinessConfig {
    /// Offset of the business timezone from UTC, in hours. Monthly usage
    /// windows roll over at local midnight in this zone.
    pub utc_offset_hours: i32,
    /// Minutes a pending merge job stays committable.
    pub merge_job_ttl_minutes: i64,
    /// Maximum orphaned records picked up per absorb pass.
    pub absorb_limit: usize,
    /// Records per unconditional write batch during absorb.
    pub absorb_chunk: usize,
}

impl Default for BusinessConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: 9,
            merge_job_ttl_minutes: 10,
            absorb_limit: 500,
            absorb_chunk: 400,
        }
    }
}

/// Identity providers trusted enough to skip phone verification.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Provider ids whose sign-ins count as verified identities.
    pub sns_providers: Vec<String>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            sns_providers: vec!["google.com".to_string(), "apple.com".to_string()],
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Transaction retry settings.
    pub retry: RetryConfig,
    /// Business tunables.
    pub business: BusinessConfig,
    /// Trusted identity providers.
    pub trust: TrustConfig,
}

impl CoreConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `ACCORD_CONFIG` environment variable (if set)
    /// 4. Environment variables with the `ACCORD` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: CoreConfig = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing. Retries stay bounded but the backoff floor
    /// drops to zero so contention tests run fast.
    pub fn for_test() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 10,
                min_delay_ms: 0,
                max_delay_ms: 10,
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CoreConfig::default();
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.business.utc_offset_hours, 9);
        assert_eq!(config.business.merge_job_ttl_minutes, 10);
        assert_eq!(
            config.trust.sns_providers,
            vec!["google.com".to_string(), "apple.com".to_string()]
        );
    }

    #[test]
    fn test_config_for_test() {
        let config = CoreConfig::for_test();
        assert_eq!(config.retry.min_delay_ms, 0);
        assert_eq!(config.business.absorb_limit, 500);
    }
}
