use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Configuration for one managed selector loop.
///
/// Timeouts deserialize from integer milliseconds (`connect_timeout_ms`,
/// `stop_timeout_ms`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// How long an outbound connect may stay pending before it is failed.
    #[serde(
        rename = "connect_timeout_ms",
        default = "default_connect_timeout",
        deserialize_with = "duration_ms"
    )]
    pub connect_timeout: Duration,

    /// Bound on shutdown waits: the caller's wait for the `Stop` change,
    /// and the loop's wait for each endpoint closer.
    #[serde(
        rename = "stop_timeout_ms",
        default = "default_stop_timeout",
        deserialize_with = "duration_ms"
    )]
    pub stop_timeout: Duration,

    /// Nice-value delta applied to the loop thread (Linux only, 0 = leave).
    #[serde(default)]
    pub priority_delta: i32,

    /// Capacity of the readiness event buffer.
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            stop_timeout: default_stop_timeout(),
            priority_delta: 0,
            events_capacity: default_events_capacity(),
        }
    }
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_events_capacity() -> usize {
    1024
}

fn duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert_eq!(config.priority_delta, 0);
        assert_eq!(config.events_capacity, 1024);
    }

    #[test]
    fn deserializes_from_toml() {
        let config: Config =
            toml::from_str("connect_timeout_ms = 50\nstop_timeout_ms = 200\npriority_delta = -2\n")
                .unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(50));
        assert_eq!(config.stop_timeout, Duration::from_millis(200));
        assert_eq!(config.priority_delta, -2);
        assert_eq!(config.events_capacity, 1024);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(toml::from_str::<Config>("select_timeout_ms = 50\n").is_err());
    }
}
