//! Orchestrator configuration
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::HierarchyError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Per-agent mailbox bound
    pub mailbox_capacity: usize,
    pub ledger: LedgerConfig,
    pub health: HealthThresholds,
    pub consumer: ConsumerConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Pending append requests queued in front of the ledger writer
    pub channel_capacity: usize,
    /// Emit a checkpoint block after this many routing blocks
    pub checkpoint_interval: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthThresholds {
    pub warning_queue_depth: usize,
    pub degraded_queue_depth: usize,
    pub warning_failure_rate: f64,
    pub degraded_failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerConfig {
    pub retry_backoff_ms: u64,
    /// Backoff stops growing after this many attempts
    pub max_retries: u32,
    /// Write a decision block for every processed hop
    pub log_decisions: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            ledger: LedgerConfig::default(),
            health: HealthThresholds::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            checkpoint_interval: Some(1000),
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_queue_depth: 50,
            degraded_queue_depth: 100,
            warning_failure_rate: 0.05,
            degraded_failure_rate: 0.10,
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 50,
            max_retries: 5,
            log_decisions: false,
        }
    }
}

impl ConsumerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Linear backoff, capped at `max_retries` steps
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff() * attempt.clamp(1, self.max_retries.max(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Invalid hierarchy: {0}")]
    Hierarchy(#[from] HierarchyError),
}

impl OrchestratorConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mailbox_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.ledger.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ledger.channel_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.ledger.checkpoint_interval == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "ledger.checkpoint_interval",
                reason: "must be greater than zero when set".to_string(),
            });
        }
        let health = &self.health;
        if health.warning_queue_depth > health.degraded_queue_depth {
            return Err(ConfigError::InvalidValue {
                field: "health.warning_queue_depth",
                reason: "must not exceed health.degraded_queue_depth".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&health.warning_failure_rate)
            || !(0.0..=1.0).contains(&health.degraded_failure_rate)
            || health.warning_failure_rate > health.degraded_failure_rate
        {
            return Err(ConfigError::InvalidValue {
                field: "health.warning_failure_rate",
                reason: "failure rates must lie in [0, 1] with warning <= degraded".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.mailbox_capacity, 64);
        assert_eq!(config.ledger.checkpoint_interval, Some(1000));
    }

    #[test]
    fn test_partial_override() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            mailbox_capacity = 2

            [ledger]
            checkpoint_interval = 10

            [consumer]
            retry_backoff_ms = 5
            log_decisions = true
            "#,
        )
        .unwrap();

        assert_eq!(config.mailbox_capacity, 2);
        assert_eq!(config.ledger.checkpoint_interval, Some(10));
        assert_eq!(config.ledger.channel_capacity, 1024);
        assert_eq!(config.consumer.retry_backoff(), Duration::from_millis(5));
        assert_eq!(config.consumer.max_retries, 5);
        assert!(config.consumer.log_decisions);
    }

    #[test]
    fn test_backoff_is_capped() {
        let consumer = ConsumerConfig {
            retry_backoff_ms: 10,
            max_retries: 3,
            log_decisions: false,
        };
        assert_eq!(consumer.backoff_for(1), Duration::from_millis(10));
        assert_eq!(consumer.backoff_for(3), Duration::from_millis(30));
        assert_eq!(consumer.backoff_for(40), Duration::from_millis(30));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = OrchestratorConfig::from_toml_str("mailbox_capacity = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { field: "mailbox_capacity", .. }
        ));
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let err = OrchestratorConfig::from_toml_str(
            r#"
            [health]
            warning_queue_depth = 200
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            OrchestratorConfig::from_toml_str("mailbox_size = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadre.toml");
        std::fs::write(&path, "mailbox_capacity = 8\n").unwrap();

        let config = OrchestratorConfig::from_path(&path).unwrap();
        assert_eq!(config.mailbox_capacity, 8);
    }
}
