//! Runtime settings, loaded from `STREAMFORGE_*` environment variables.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} is required")]
    Missing(&'static str),
}

/// Which queue backend to run against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackendKind {
    #[default]
    Memory,
    Redis,
    Cloud,
}

impl FromStr for QueueBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" | "inmemory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "cloud" | "sqs" => Ok(Self::Cloud),
            other => Err(format!("unknown queue backend `{other}`")),
        }
    }
}

/// Effective pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub queue_backend: QueueBackendKind,
    pub redis_url: Option<String>,
    pub cloud_queue_url: String,
    pub queue_name: String,
    pub max_attempts: u32,
    pub backoff_base: f64,
    pub backoff_unit: Duration,
    pub max_backoff: Duration,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub reserve_timeout: Duration,
    pub worker_concurrency: usize,
    pub generation_timeout: Option<Duration>,
    pub default_model: String,
    pub bind_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue_backend: QueueBackendKind::Memory,
            redis_url: None,
            cloud_queue_url: "local://queues".to_string(),
            queue_name: "default".to_string(),
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            reserve_timeout: Duration::from_secs(1),
            worker_concurrency: 4,
            generation_timeout: None,
            default_model: "echo-1".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl Settings {
    pub fn with_queue_backend(mut self, backend: QueueBackendKind) -> Self {
        self.queue_backend = backend;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an explicit key/value map (tests, embedding).
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let queue_backend = parse(&get, "STREAMFORGE_QUEUE_BACKEND")?.unwrap_or(defaults.queue_backend);
        let redis_url = get("STREAMFORGE_REDIS_URL");
        if queue_backend == QueueBackendKind::Redis && redis_url.is_none() {
            return Err(ConfigError::Missing("STREAMFORGE_REDIS_URL"));
        }

        let max_attempts: u32 =
            parse(&get, "STREAMFORGE_QUEUE_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(invalid("STREAMFORGE_QUEUE_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        let backoff_base: f64 =
            parse(&get, "STREAMFORGE_QUEUE_BACKOFF_BASE")?.unwrap_or(defaults.backoff_base);
        if !backoff_base.is_finite() || backoff_base < 1.0 {
            return Err(invalid(
                "STREAMFORGE_QUEUE_BACKOFF_BASE",
                &backoff_base.to_string(),
                "must be a finite number >= 1",
            ));
        }
        let worker_concurrency: usize =
            parse(&get, "STREAMFORGE_WORKER_CONCURRENCY")?.unwrap_or(defaults.worker_concurrency);
        if worker_concurrency == 0 {
            return Err(invalid("STREAMFORGE_WORKER_CONCURRENCY", "0", "must be at least 1"));
        }

        Ok(Self {
            queue_backend,
            redis_url,
            cloud_queue_url: get("STREAMFORGE_CLOUD_QUEUE_URL").unwrap_or(defaults.cloud_queue_url),
            queue_name: get("STREAMFORGE_QUEUE_NAME").unwrap_or(defaults.queue_name),
            max_attempts,
            backoff_base,
            backoff_unit: parse::<f64>(&get, "STREAMFORGE_QUEUE_BACKOFF_UNIT_SECS")?
                .map(secs_f64)
                .unwrap_or(defaults.backoff_unit),
            max_backoff: parse(&get, "STREAMFORGE_QUEUE_MAX_BACKOFF_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_backoff),
            visibility_timeout: parse(&get, "STREAMFORGE_QUEUE_VISIBILITY_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            poll_interval: parse(&get, "STREAMFORGE_WORKER_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            reserve_timeout: parse(&get, "STREAMFORGE_WORKER_RESERVE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reserve_timeout),
            worker_concurrency,
            generation_timeout: parse::<f64>(&get, "STREAMFORGE_GENERATION_TIMEOUT_SECS")?
                .filter(|secs| *secs > 0.0)
                .map(secs_f64),
            default_model: get("STREAMFORGE_DEFAULT_MODEL").unwrap_or(defaults.default_model),
            bind_addr: get("STREAMFORGE_BIND_ADDR").unwrap_or(defaults.bind_addr),
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn secs_f64(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(Settings::from_map(&HashMap::new()).unwrap(), Settings::default());
    }

    #[test]
    fn reads_overrides() {
        let settings = Settings::from_map(&vars(&[
            ("STREAMFORGE_QUEUE_BACKEND", "redis"),
            ("STREAMFORGE_REDIS_URL", "redis://127.0.0.1/"),
            ("STREAMFORGE_QUEUE_NAME", "gen"),
            ("STREAMFORGE_QUEUE_MAX_ATTEMPTS", "5"),
            ("STREAMFORGE_QUEUE_BACKOFF_BASE", "3"),
            ("STREAMFORGE_WORKER_POLL_INTERVAL_MS", "250"),
            ("STREAMFORGE_GENERATION_TIMEOUT_SECS", "1.5"),
        ]))
        .unwrap();

        assert_eq!(settings.queue_backend, QueueBackendKind::Redis);
        assert_eq!(settings.queue_name, "gen");
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.backoff_base, 3.0);
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.generation_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn redis_backend_requires_url() {
        assert_eq!(
            Settings::from_map(&vars(&[("STREAMFORGE_QUEUE_BACKEND", "redis")])),
            Err(ConfigError::Missing("STREAMFORGE_REDIS_URL"))
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Settings::from_map(&vars(&[("STREAMFORGE_QUEUE_BACKEND", "kafka")])),
            Err(ConfigError::Invalid { key: "STREAMFORGE_QUEUE_BACKEND", .. })
        ));
        assert!(matches!(
            Settings::from_map(&vars(&[("STREAMFORGE_QUEUE_MAX_ATTEMPTS", "0")])),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            Settings::from_map(&vars(&[("STREAMFORGE_QUEUE_BACKOFF_BASE", "abc")])),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let settings = Settings::from_map(&vars(&[("STREAMFORGE_QUEUE_NAME", "  ")])).unwrap();
        assert_eq!(settings.queue_name, "default");
    }
}
