use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use firestick_core::backoff::ReconnectConfig;
use firestick_core::store::DEFAULT_RECENT_JOBS_LIMIT;

use crate::error::ConfigError;

/// Client configuration loaded from environment variables.
///
/// All fields have defaults suitable for a backend on the local machine.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend base URL, without trailing slash.
    pub base_url: String,
    /// Logical application (tenant) name sent as `app`, if any.
    pub app: Option<String>,
    /// When `false`, the push channel is treated as unsupported and jobs
    /// are followed by polling.
    pub push_enabled: bool,
    /// Interval between snapshot fetches while polling.
    pub poll_interval: Duration,
    /// Deadline for probe calls (health, embedding info).
    pub probe_timeout: Duration,
    /// Reconnect backoff schedule for the push channel.
    pub reconnect: ReconnectConfig,
    /// Size of the recent-jobs history.
    pub recent_jobs_limit: usize,
    /// Where preferences are persisted. `None` keeps them in memory.
    pub prefs_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            app: None,
            push_enabled: true,
            poll_interval: Duration::from_millis(1500),
            probe_timeout: Duration::from_millis(4000),
            reconnect: ReconnectConfig::default(),
            recent_jobs_limit: DEFAULT_RECENT_JOBS_LIMIT,
            prefs_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default                 |
    /// |------------------------------------|-------------------------|
    /// | `FIRESTICK_BASE_URL`               | `http://localhost:8080` |
    /// | `FIRESTICK_APP`                    | unset                   |
    /// | `FIRESTICK_PUSH_ENABLED`           | `true`                  |
    /// | `FIRESTICK_POLL_INTERVAL_MS`       | `1500`                  |
    /// | `FIRESTICK_PROBE_TIMEOUT_MS`       | `4000`                  |
    /// | `FIRESTICK_RECONNECT_INITIAL_MS`   | `1000`                  |
    /// | `FIRESTICK_RECONNECT_MAX_MS`       | `15000`                 |
    /// | `FIRESTICK_RECONNECT_MULTIPLIER`   | `1.8`                   |
    /// | `FIRESTICK_MAX_RECONNECT_ATTEMPTS` | unset (unbounded)       |
    /// | `FIRESTICK_RECENT_JOBS_LIMIT`      | `10`                    |
    /// | `FIRESTICK_PREFS_PATH`             | unset (in memory)       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let base_url = get("FIRESTICK_BASE_URL")
            .unwrap_or(defaults.base_url)
            .trim_end_matches('/')
            .to_string();

        let push_enabled = parse_or(
            get("FIRESTICK_PUSH_ENABLED"),
            "FIRESTICK_PUSH_ENABLED",
            "a boolean",
            defaults.push_enabled,
        )?;

        let poll_interval_ms: u64 = parse_or(
            get("FIRESTICK_POLL_INTERVAL_MS"),
            "FIRESTICK_POLL_INTERVAL_MS",
            "a positive u64",
            defaults.poll_interval.as_millis() as u64,
        )?;
        let probe_timeout_ms: u64 = parse_or(
            get("FIRESTICK_PROBE_TIMEOUT_MS"),
            "FIRESTICK_PROBE_TIMEOUT_MS",
            "a positive u64",
            defaults.probe_timeout.as_millis() as u64,
        )?;
        let initial_ms: u64 = parse_or(
            get("FIRESTICK_RECONNECT_INITIAL_MS"),
            "FIRESTICK_RECONNECT_INITIAL_MS",
            "a positive u64",
            defaults.reconnect.initial_delay.as_millis() as u64,
        )?;
        let max_ms: u64 = parse_or(
            get("FIRESTICK_RECONNECT_MAX_MS"),
            "FIRESTICK_RECONNECT_MAX_MS",
            "a positive u64",
            defaults.reconnect.max_delay.as_millis() as u64,
        )?;
        let multiplier: f64 = parse_or(
            get("FIRESTICK_RECONNECT_MULTIPLIER"),
            "FIRESTICK_RECONNECT_MULTIPLIER",
            "a number >= 1.0",
            defaults.reconnect.multiplier,
        )?;
        let max_attempts = get("FIRESTICK_MAX_RECONNECT_ATTEMPTS")
            .map(|v| parse_value(v, "FIRESTICK_MAX_RECONNECT_ATTEMPTS", "a u32"))
            .transpose()?;
        let recent_jobs_limit: usize = parse_or(
            get("FIRESTICK_RECENT_JOBS_LIMIT"),
            "FIRESTICK_RECENT_JOBS_LIMIT",
            "a positive integer",
            defaults.recent_jobs_limit,
        )?;

        if poll_interval_ms == 0 {
            return Err(invalid("FIRESTICK_POLL_INTERVAL_MS", "a positive u64", "0"));
        }
        if probe_timeout_ms == 0 {
            return Err(invalid("FIRESTICK_PROBE_TIMEOUT_MS", "a positive u64", "0"));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(invalid(
                "FIRESTICK_RECONNECT_MULTIPLIER",
                "a number >= 1.0",
                &multiplier.to_string(),
            ));
        }
        if recent_jobs_limit == 0 {
            return Err(invalid("FIRESTICK_RECENT_JOBS_LIMIT", "a positive integer", "0"));
        }

        Ok(Self {
            base_url,
            app: get("FIRESTICK_APP"),
            push_enabled,
            poll_interval: Duration::from_millis(poll_interval_ms),
            probe_timeout: Duration::from_millis(probe_timeout_ms),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms.max(initial_ms)),
                multiplier,
                max_attempts,
            },
            recent_jobs_limit,
            prefs_path: get("FIRESTICK_PREFS_PATH").map(PathBuf::from),
        })
    }
}

fn parse_or<T: FromStr>(
    value: Option<String>,
    var: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    value.map_or(Ok(default), |v| parse_value(v, var, expected))
}

fn parse_value<T: FromStr>(
    value: String,
    var: &'static str,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        var,
        expected,
        value,
    })
}

fn invalid(var: &'static str, expected: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        expected,
        value: value.to_string(),
    }
}
