//! Client configuration, with defaults and environment overrides.

use crate::backoff::BackoffPolicy;
use crate::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;
use std::time::Duration;
use thiserror::Error;

pub const ENV_ENDPOINT: &str = "TRUSTMIRROR_ENDPOINT";
pub const ENV_HEARTBEAT_SECS: &str = "TRUSTMIRROR_HEARTBEAT_SECS";
pub const ENV_BACKOFF_BASE_MS: &str = "TRUSTMIRROR_BACKOFF_BASE_MS";
pub const ENV_BACKOFF_CAP_MS: &str = "TRUSTMIRROR_BACKOFF_CAP_MS";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "TRUSTMIRROR_MAX_RECONNECT_ATTEMPTS";
pub const ENV_RESYNC: &str = "TRUSTMIRROR_RESYNC";

/// Configuration errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse `{value}`: {reason}")]
    Parse {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What happens to mirrored collections when a connection re-opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncPolicy {
    /// Drop agents and trust samples on every reconnect and wait for the
    /// server's bulk snapshot. Entities deleted while offline cannot linger.
    ClearOnReconnect,
    /// Keep the pre-disconnect collections until a bulk update replaces them.
    RetainUntilBulk,
}

/// Configuration for one supervised connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint URL (default: ws://localhost:8080/ws)
    pub endpoint: String,

    /// Liveness probe interval (default: 30s)
    pub heartbeat_interval: Duration,

    /// Reconnect policy
    pub backoff: BackoffPolicy,

    /// Cross-reconnect consistency policy
    pub resync: ResyncPolicy,

    /// Anomaly alerts buffered per slow subscriber (default: 64)
    pub alert_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8080/ws".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            backoff: BackoffPolicy::default(),
            resync: ResyncPolicy::ClearOnReconnect,
            alert_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Sets the endpoint URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the resync policy.
    pub fn with_resync(mut self, resync: ResyncPolicy) -> Self {
        self.resync = resync;
        self
    }

    /// Builds a configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults. The result is validated.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            config.endpoint = endpoint.trim().to_string();
        }
        if let Some(secs) = parse_key::<u64, _>(&lookup, ENV_HEARTBEAT_SECS)? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_key::<u64, _>(&lookup, ENV_BACKOFF_BASE_MS)? {
            config.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_key::<u64, _>(&lookup, ENV_BACKOFF_CAP_MS)? {
            config.backoff.cap = Duration::from_millis(ms);
        }
        if let Some(max) = parse_key::<u32, _>(&lookup, ENV_MAX_RECONNECT_ATTEMPTS)? {
            config.backoff.max_attempts = max;
        }
        if let Some(value) = lookup(ENV_RESYNC) {
            config.resync = match value.trim().to_ascii_lowercase().as_str() {
                "clear" => ResyncPolicy::ClearOnReconnect,
                "retain" => ResyncPolicy::RetainUntilBulk,
                _ => {
                    return Err(ConfigError::Parse {
                        key: ENV_RESYNC,
                        value,
                        reason: "expected `clear` or `retain`".to_string(),
                    })
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::Invalid("endpoint is empty".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat interval must be > 0".to_string()));
        }
        if self.backoff.base.is_zero() {
            return Err(ConfigError::Invalid("backoff base must be > 0".to_string()));
        }
        if self.backoff.cap < self.backoff.base {
            return Err(ConfigError::Invalid(format!(
                "backoff cap {:?} is below base {:?}",
                self.backoff.cap, self.backoff.base
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_ratio) {
            return Err(ConfigError::Invalid(format!(
                "jitter ratio {} outside [0, 1]",
                self.backoff.jitter_ratio
            )));
        }
        if self.alert_capacity == 0 {
            return Err(ConfigError::Invalid("alert capacity must be > 0".to_string()));
        }
        Ok(())
    }
}

fn parse_key<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Parse {
                key,
                value: value.clone(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.backoff.max_attempts, 10);
        assert_eq!(config.resync, ResyncPolicy::ClearOnReconnect);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENV_ENDPOINT, " ws://sim.local:9000/stream "),
            (ENV_HEARTBEAT_SECS, "5"),
            (ENV_BACKOFF_BASE_MS, "250"),
            (ENV_BACKOFF_CAP_MS, "8000"),
            (ENV_MAX_RECONNECT_ATTEMPTS, "3"),
            (ENV_RESYNC, "Retain"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint, "ws://sim.local:9000/stream");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.backoff.base, Duration::from_millis(250));
        assert_eq!(config.backoff.cap, Duration::from_secs(8));
        assert_eq!(config.backoff.max_attempts, 3);
        assert_eq!(config.resync, ResyncPolicy::RetainUntilBulk);
    }

    #[test]
    fn test_parse_errors_name_the_key() {
        let err = ClientConfig::from_lookup(lookup(&[(ENV_MAX_RECONNECT_ATTEMPTS, "ten")])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { key: ENV_MAX_RECONNECT_ATTEMPTS, .. }));

        let err = ClientConfig::from_lookup(lookup(&[(ENV_RESYNC, "sometimes")])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { key: ENV_RESYNC, .. }));
    }

    #[test]
    fn test_validation_failures() {
        assert!(ClientConfig::from_lookup(lookup(&[(ENV_HEARTBEAT_SECS, "0")])).is_err());
        assert!(ClientConfig::from_lookup(lookup(&[(ENV_ENDPOINT, "  ")])).is_err());
        assert!(ClientConfig::from_lookup(lookup(&[
            (ENV_BACKOFF_BASE_MS, "5000"),
            (ENV_BACKOFF_CAP_MS, "1000"),
        ]))
        .is_err());
    }
}
