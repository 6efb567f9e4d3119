//! Configuration for the execution engine
//!
//! Defaults can be overridden from environment variables or a YAML document.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::warn;

use crate::CoreError;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tenant the engine executes for
    #[serde(default = "default_tenant_id")]
    pub tenant_id: u64,

    /// Maximum number of units of work running at once
    #[serde(default = "default_work_concurrency")]
    pub work_concurrency: usize,

    /// How many times a unit of work failing with a transient error is retried
    #[serde(default = "default_max_work_retries")]
    pub max_work_retries: u32,

    /// Initial delay before a retry, doubled on each attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound for the retry delay
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    /// Capacity of the flow node dispatch queue
    #[serde(default = "default_dispatch_channel_capacity")]
    pub dispatch_channel_capacity: usize,
}

fn default_tenant_id() -> u64 {
    1
}

fn default_work_concurrency() -> usize {
    8
}

fn default_max_work_retries() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    10
}

fn default_max_retry_backoff_ms() -> u64 {
    1000
}

fn default_dispatch_channel_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tenant_id: default_tenant_id(),
            work_concurrency: default_work_concurrency(),
            max_work_retries: default_max_work_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            dispatch_channel_capacity: default_dispatch_channel_capacity(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults overridden by environment variables
    pub fn load() -> Result<Self, CoreError> {
        let mut config = Self::default();

        override_from_env("TOKENFLOW_TENANT_ID", &mut config.tenant_id);
        override_from_env("TOKENFLOW_WORK_CONCURRENCY", &mut config.work_concurrency);
        override_from_env("TOKENFLOW_MAX_WORK_RETRIES", &mut config.max_work_retries);
        override_from_env("TOKENFLOW_RETRY_BACKOFF_MS", &mut config.retry_backoff_ms);
        override_from_env(
            "TOKENFLOW_MAX_RETRY_BACKOFF_MS",
            &mut config.max_retry_backoff_ms,
        );
        override_from_env(
            "TOKENFLOW_DISPATCH_CHANNEL_CAPACITY",
            &mut config.dispatch_channel_capacity,
        );

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CoreError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.work_concurrency == 0 {
            return Err(CoreError::ConfigurationError(
                "work_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.dispatch_channel_capacity == 0 {
            return Err(CoreError::ConfigurationError(
                "dispatch_channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (starting at 1)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let millis = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_retry_backoff_ms);
        Duration::from_millis(millis)
    }
}

fn override_from_env<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", name, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_yaml_fills_missing_fields_with_defaults() {
        let config = EngineConfig::from_yaml_str("work_concurrency: 2\ntenant_id: 9\n").unwrap();

        assert_eq!(
            config,
            EngineConfig {
                tenant_id: 9,
                work_concurrency: 2,
                ..EngineConfig::default()
            }
        );
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = EngineConfig {
            tenant_id: 3,
            work_concurrency: 16,
            max_work_retries: 2,
            retry_backoff_ms: 5,
            max_retry_backoff_ms: 80,
            dispatch_channel_capacity: 64,
        };

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("work_concurrency: 16"));
        assert_eq!(EngineConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_load_without_overrides_validates() {
        let config = EngineConfig::load().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let result = EngineConfig::from_yaml_str("work_concurrency: 0\n");
        assert!(matches!(result, Err(CoreError::ConfigurationError(_))));
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = EngineConfig {
            retry_backoff_ms: 10,
            max_retry_backoff_ms: 50,
            ..EngineConfig::default()
        };

        assert_eq!(config.retry_delay(1), Duration::from_millis(10));
        assert_eq!(config.retry_delay(2), Duration::from_millis(20));
        assert_eq!(config.retry_delay(3), Duration::from_millis(40));
        assert_eq!(config.retry_delay(4), Duration::from_millis(50));
    }
}
