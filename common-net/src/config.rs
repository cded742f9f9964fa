use std::{env, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::BoxError;

const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PING_INTERVAL_MS: u64 = 5_000;
const DEFAULT_LATENCY_SMOOTHING: f64 = 0.2;
const DEFAULT_MEDIA_QUEUE_CAPACITY: usize = 64;

/// Session tuning shared by every node. A `ping_interval_ms` of 0 disables
/// the periodic ping (the robot only answers pings).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    pub liveness_timeout_ms: u64,
    pub negotiation_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub latency_smoothing: f64,
    pub media_queue_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: DEFAULT_LIVENESS_TIMEOUT_MS,
            negotiation_timeout_ms: DEFAULT_NEGOTIATION_TIMEOUT_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            latency_smoothing: DEFAULT_LATENCY_SMOOTHING,
            media_queue_capacity: DEFAULT_MEDIA_QUEUE_CAPACITY,
        }
    }
}

impl SessionSettings {
    /// Reads `<PREFIX>_LIVENESS_TIMEOUT_MS`, `<PREFIX>_NEGOTIATION_TIMEOUT_MS`,
    /// `<PREFIX>_PING_INTERVAL_MS`, `<PREFIX>_LATENCY_SMOOTHING` and
    /// `<PREFIX>_MEDIA_QUEUE_CAPACITY`, falling back to `defaults`.
    pub fn from_env(prefix: &str, defaults: SessionSettings) -> Result<Self, BoxError> {
        let settings = Self {
            liveness_timeout_ms: env_or(
                &format!("{prefix}_LIVENESS_TIMEOUT_MS"),
                defaults.liveness_timeout_ms,
            )?,
            negotiation_timeout_ms: env_or(
                &format!("{prefix}_NEGOTIATION_TIMEOUT_MS"),
                defaults.negotiation_timeout_ms,
            )?,
            ping_interval_ms: env_or(
                &format!("{prefix}_PING_INTERVAL_MS"),
                defaults.ping_interval_ms,
            )?,
            latency_smoothing: env_or(
                &format!("{prefix}_LATENCY_SMOOTHING"),
                defaults.latency_smoothing,
            )?,
            media_queue_capacity: env_or(
                &format!("{prefix}_MEDIA_QUEUE_CAPACITY"),
                defaults.media_queue_capacity,
            )?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn without_ping(mut self) -> Self {
        self.ping_interval_ms = 0;
        self
    }

    pub fn validate(&self) -> Result<(), BoxError> {
        if !(self.latency_smoothing > 0.0 && self.latency_smoothing <= 1.0) {
            return Err(format!(
                "latency_smoothing must be in (0, 1], got {}",
                self.latency_smoothing
            )
            .into());
        }
        if self.media_queue_capacity == 0 {
            return Err("media_queue_capacity must be positive".into());
        }
        if self.liveness_timeout_ms == 0 || self.negotiation_timeout_ms == 0 {
            return Err("timeouts must be positive".into());
        }
        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }
}

/// Parse `key` from the environment, or return `default` when unset.
pub fn env_or<T>(key: &str, default: T) -> Result<T, BoxError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|err| format!("{key}={raw:?}: {err}").into()),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = SessionSettings::default();
        assert_eq!(settings.liveness_timeout(), Duration::from_secs(30));
        assert_eq!(settings.ping_interval(), Some(Duration::from_secs(5)));
        assert!((settings.latency_smoothing - 0.2).abs() < f64::EPSILON);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_ping_interval_disables_ping() {
        assert_eq!(SessionSettings::default().without_ping().ping_interval(), None);
    }

    #[test]
    fn smoothing_out_of_range_is_rejected() {
        let settings = SessionSettings {
            latency_smoothing: 1.5,
            ..SessionSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: SessionSettings =
            serde_json::from_str(r#"{"liveness_timeout_ms": 500}"#).expect("json");
        assert_eq!(settings.liveness_timeout_ms, 500);
        assert_eq!(settings.negotiation_timeout_ms, DEFAULT_NEGOTIATION_TIMEOUT_MS);
    }

    #[test]
    fn env_or_reports_bad_values() {
        env::set_var("COMMON_NET_TEST_BAD_U64", "abc");
        assert!(env_or::<u64>("COMMON_NET_TEST_BAD_U64", 1).is_err());
        assert_eq!(env_or::<u64>("COMMON_NET_TEST_UNSET_U64", 7).expect("default"), 7);
    }
}
