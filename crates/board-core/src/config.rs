//! Session configuration.
//!
//! Every tunable of a collaboration session, with defaults. Loadable from
//! YAML; missing keys take their default.
//!
//! ```yaml
//! lock_ttl_ms: 30000
//! max_collaborators: 4
//! signaling_backoff:
//!   max_delay_ms: 10000
//! ```

use crate::lock::LockConfig;
use crate::peer::PeerConfig;
use crate::presence::PresenceConfig;
use crate::signaling::ReconnectConfig;
use crate::sync::SyncConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("backoff_factor must be at least 1.0 (got {0})")]
    BackoffFactor(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub lock_ttl_ms: u64,
    pub negotiation_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub liveness_timeout_ms: u64,
    pub presence_interval_ms: u64,
    pub presence_heartbeat_ms: u64,
    pub away_after_ms: u64,
    pub snapshot_interval_ms: u64,
    pub history_capacity: usize,
    pub conflict_log_capacity: usize,
    pub max_collaborators: usize,
    pub signaling_backoff: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 30_000,
            negotiation_timeout_ms: 15_000,
            retry_delay_ms: 1_000,
            liveness_timeout_ms: 10_000,
            presence_interval_ms: 50,
            presence_heartbeat_ms: 2_000,
            away_after_ms: 60_000,
            snapshot_interval_ms: 5_000,
            history_capacity: 100,
            conflict_log_capacity: 100,
            max_collaborators: 10,
            signaling_backoff: BackoffConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        // An empty file is a valid "all defaults" config
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero: [(&'static str, u64); 10] = [
            ("lock_ttl_ms", self.lock_ttl_ms),
            ("negotiation_timeout_ms", self.negotiation_timeout_ms),
            ("liveness_timeout_ms", self.liveness_timeout_ms),
            ("presence_interval_ms", self.presence_interval_ms),
            ("presence_heartbeat_ms", self.presence_heartbeat_ms),
            ("away_after_ms", self.away_after_ms),
            ("snapshot_interval_ms", self.snapshot_interval_ms),
            ("history_capacity", self.history_capacity as u64),
            ("conflict_log_capacity", self.conflict_log_capacity as u64),
            ("max_collaborators", self.max_collaborators as u64),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field: *field });
        }
        if self.signaling_backoff.initial_delay_ms == 0 {
            return Err(ConfigError::Zero {
                field: "signaling_backoff.initial_delay_ms",
            });
        }
        if self.signaling_backoff.backoff_factor < 1.0 {
            return Err(ConfigError::BackoffFactor(
                self.signaling_backoff.backoff_factor,
            ));
        }
        Ok(())
    }

    pub fn lock(&self) -> LockConfig {
        LockConfig {
            ttl: Duration::from_millis(self.lock_ttl_ms),
        }
    }

    pub fn peer(&self) -> PeerConfig {
        PeerConfig {
            negotiation_timeout: Duration::from_millis(self.negotiation_timeout_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
        }
    }

    pub fn presence(&self) -> PresenceConfig {
        PresenceConfig {
            interval: Duration::from_millis(self.presence_interval_ms),
            heartbeat: Duration::from_millis(self.presence_heartbeat_ms),
        }
    }

    pub fn sync(&self) -> SyncConfig {
        SyncConfig {
            history_capacity: self.history_capacity,
            conflict_log_capacity: self.conflict_log_capacity,
        }
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.signaling_backoff.initial_delay_ms),
            max_delay: Duration::from_millis(self.signaling_backoff.max_delay_ms),
            backoff_factor: self.signaling_backoff.backoff_factor,
            max_attempts: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.lock_ttl_ms, 30_000);
        assert_eq!(config.max_collaborators, 10);
        assert_eq!(config.peer().negotiation_timeout, Duration::from_secs(15));
        assert_eq!(config.reconnect().max_delay, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = SessionConfig::from_yaml_str(
            "max_collaborators: 4\nsignaling_backoff:\n  max_delay_ms: 10000\n",
        )
        .unwrap();
        assert_eq!(config.max_collaborators, 4);
        assert_eq!(config.signaling_backoff.max_delay_ms, 10_000);
        assert_eq!(config.signaling_backoff.initial_delay_ms, 500);
        assert_eq!(config.lock_ttl_ms, 30_000);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(
            SessionConfig::from_yaml_str("  \n").unwrap(),
            SessionConfig::default()
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = SessionConfig::from_yaml_str("history_capacity: 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Zero {
                field: "history_capacity"
            }
        ));
    }

    #[test]
    fn test_shrinking_backoff_rejected() {
        let err =
            SessionConfig::from_yaml_str("signaling_backoff:\n  backoff_factor: 0.5").unwrap_err();
        assert!(matches!(err, ConfigError::BackoffFactor(_)));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            SessionConfig::from_yaml_str("lock_ttl_ms: [1, 2"),
            Err(ConfigError::Parse(_))
        ));
    }
}
