//! Environment-backed configuration for the socket controller.

use std::{env, time::Duration};

use chat_core::ParseRetryPolicy;
use thiserror::Error;
use url::Url;

const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 10_000;
const DEFAULT_MONITOR_INTERVAL_MS: u64 = 1_000;
const DEFAULT_NO_EVENT_THRESHOLD_MS: u64 = 30_000;
const DEFAULT_PARSE_RETRY_LIMIT: u32 = 3;
const DEFAULT_PARSE_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_LISTENER_BUFFER: usize = 256;
const DEFAULT_WSS_URL: &str = "wss://chat.example.com/connect";

/// Timer settings of the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Pause between two liveness evaluations, also used as start delay.
    pub monitor_interval: Duration,
    /// Pause after a liveness check before the next evaluation.
    pub health_check_interval: Duration,
    /// Silence after which the socket is considered dead.
    pub no_event_threshold: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_millis(DEFAULT_MONITOR_INTERVAL_MS),
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            no_event_threshold: Duration::from_millis(DEFAULT_NO_EVENT_THRESHOLD_MS),
        }
    }
}

/// Runtime configuration of [`crate::ChatSocket`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSocketConfig {
    /// API key sent with every connection.
    pub api_key: String,
    /// Socket endpoint (`ws` or `wss`).
    pub wss_url: Url,
    /// Health monitor timers.
    pub health: HealthConfig,
    /// Capped retry for undecodable frames.
    pub parse_retry: ParseRetryPolicy,
    /// Capacity of the listener delivery queue.
    pub listener_buffer: usize,
}

impl ChatSocketConfig {
    /// Build a configuration with default timers.
    pub fn new(api_key: impl Into<String>, wss_url: &str) -> Result<Self, ConfigError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ConfigError::MissingValue { key: "CHAT_API_KEY" });
        }
        Ok(Self {
            api_key,
            wss_url: parse_socket_url("CHAT_WSS_URL", wss_url)?,
            health: HealthConfig::default(),
            parse_retry: ParseRetryPolicy::default(),
            listener_buffer: DEFAULT_LISTENER_BUFFER,
        })
    }

    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_key = optional_trimmed_env("CHAT_API_KEY", &mut lookup)
            .ok_or(ConfigError::MissingValue { key: "CHAT_API_KEY" })?;
        let wss_url = optional_trimmed_env("CHAT_WSS_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_WSS_URL.to_owned());

        let health = HealthConfig {
            monitor_interval: parse_millis(
                "CHAT_MONITOR_INTERVAL_MS",
                DEFAULT_MONITOR_INTERVAL_MS,
                &mut lookup,
            )?,
            health_check_interval: parse_millis(
                "CHAT_HEALTH_CHECK_INTERVAL_MS",
                DEFAULT_HEALTH_CHECK_INTERVAL_MS,
                &mut lookup,
            )?,
            no_event_threshold: parse_millis(
                "CHAT_NO_EVENT_THRESHOLD_MS",
                DEFAULT_NO_EVENT_THRESHOLD_MS,
                &mut lookup,
            )?,
        };
        let parse_retry_limit = parse_with_default(
            "CHAT_PARSE_RETRY_LIMIT",
            DEFAULT_PARSE_RETRY_LIMIT,
            &mut lookup,
        )?;
        let parse_retry_base_delay_ms = parse_with_default(
            "CHAT_PARSE_RETRY_BASE_DELAY_MS",
            DEFAULT_PARSE_RETRY_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let listener_buffer = parse_with_default(
            "CHAT_LISTENER_BUFFER",
            DEFAULT_LISTENER_BUFFER,
            &mut lookup,
        )?;
        if listener_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_LISTENER_BUFFER",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            api_key,
            wss_url: parse_socket_url("CHAT_WSS_URL", &wss_url)?,
            health,
            parse_retry: ParseRetryPolicy::new(parse_retry_base_delay_ms, parse_retry_limit),
            listener_buffer,
        })
    }

    /// Replace the health monitor timers; every interval must be non-zero.
    pub fn with_health(mut self, health: HealthConfig) -> Result<Self, ConfigError> {
        let timers = [
            ("CHAT_MONITOR_INTERVAL_MS", health.monitor_interval),
            ("CHAT_HEALTH_CHECK_INTERVAL_MS", health.health_check_interval),
            ("CHAT_NO_EVENT_THRESHOLD_MS", health.no_event_threshold),
        ];
        if let Some((key, _)) = timers.into_iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::InvalidValue {
                key,
                value: "0".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        self.health = health;
        Ok(self)
    }
}

/// Errors produced while parsing socket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required variable is absent or blank.
    #[error("missing required {key}")]
    MissingValue { key: &'static str },
    /// A variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_socket_url(key: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.to_owned(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: "scheme must be ws or wss".to_owned(),
        });
    }
    Ok(url)
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_millis<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let millis = parse_with_default(key, default, lookup)?;
    if millis == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be greater than 0".to_owned(),
        });
    }
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl FnMut(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn uses_defaults_when_only_api_key_is_set() {
        let config = ChatSocketConfig::from_lookup(lookup_from(&[("CHAT_API_KEY", "key")]))
            .expect("config should parse");
        assert_eq!(config.api_key, "key");
        assert_eq!(config.wss_url.scheme(), "wss");
        assert_eq!(config.health, HealthConfig::default());
        assert_eq!(config.parse_retry.max_attempts(), 3);
        assert_eq!(config.listener_buffer, 256);
    }

    #[test]
    fn requires_api_key() {
        let err = ChatSocketConfig::from_lookup(lookup_from(&[("CHAT_API_KEY", "  ")]))
            .expect_err("blank api key must fail");
        assert_eq!(err, ConfigError::MissingValue { key: "CHAT_API_KEY" });
    }

    #[test]
    fn rejects_non_socket_urls() {
        let err = ChatSocketConfig::from_lookup(lookup_from(&[
            ("CHAT_API_KEY", "key"),
            ("CHAT_WSS_URL", "https://chat.example.org"),
        ]))
        .expect_err("https must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_WSS_URL",
                ..
            }
        ));
    }

    #[test]
    fn parses_timer_overrides() {
        let config = ChatSocketConfig::from_lookup(lookup_from(&[
            ("CHAT_API_KEY", "key"),
            ("CHAT_WSS_URL", "ws://localhost:3030"),
            ("CHAT_HEALTH_CHECK_INTERVAL_MS", "2000"),
            ("CHAT_NO_EVENT_THRESHOLD_MS", "5000"),
            ("CHAT_PARSE_RETRY_LIMIT", "5"),
        ]))
        .expect("config should parse");
        assert_eq!(config.health.health_check_interval, Duration::from_secs(2));
        assert_eq!(config.health.no_event_threshold, Duration::from_secs(5));
        assert_eq!(config.parse_retry.max_attempts(), 5);
    }

    #[test]
    fn rejects_zero_and_garbage_numbers() {
        let err = ChatSocketConfig::from_lookup(lookup_from(&[
            ("CHAT_API_KEY", "key"),
            ("CHAT_MONITOR_INTERVAL_MS", "0"),
        ]))
        .expect_err("zero interval must fail");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = ChatSocketConfig::from_lookup(lookup_from(&[
            ("CHAT_API_KEY", "key"),
            ("CHAT_HEALTH_CHECK_INTERVAL_MS", "0"),
        ]))
        .expect_err("zero health check interval must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_HEALTH_CHECK_INTERVAL_MS",
                ..
            }
        ));

        let err = ChatSocketConfig::from_lookup(lookup_from(&[
            ("CHAT_API_KEY", "key"),
            ("CHAT_LISTENER_BUFFER", "lots"),
        ]))
        .expect_err("garbage must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_LISTENER_BUFFER",
                ..
            }
        ));
    }

    #[test]
    fn replacing_health_timers_rejects_zero_intervals() {
        let base = ChatSocketConfig::new("key", "ws://localhost:3030").expect("valid config");

        let err = base
            .clone()
            .with_health(HealthConfig {
                monitor_interval: Duration::ZERO,
                ..HealthConfig::default()
            })
            .expect_err("zero monitor interval must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_MONITOR_INTERVAL_MS",
                ..
            }
        ));

        let faster = HealthConfig {
            monitor_interval: Duration::from_millis(100),
            health_check_interval: Duration::from_millis(200),
            no_event_threshold: Duration::from_secs(1),
        };
        let config = base.with_health(faster).expect("non-zero timers are accepted");
        assert_eq!(config.health, faster);
    }
}
