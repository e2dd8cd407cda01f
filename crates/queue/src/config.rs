use std::time::Duration;

use easel_core::job::{DEFAULT_GENERATE_TIMEOUT, DEFAULT_LONG_JOB_TIMEOUT};

/// Errors from reading configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Queue and backend settings loaded from environment variables.
///
/// All fields have defaults suitable for a diffusion server running on
/// the same machine.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Base URL of the diffusion server.
    pub backend_url: String,
    /// Maximum number of jobs waiting in the buffer.
    pub capacity: usize,
    /// Cadence of the worker loop and of progress polling.
    pub poll_interval: Duration,
    /// Ceiling for generate / reroll / variation / raw jobs.
    pub generate_timeout: Duration,
    /// Watchdog for upscale and image-to-image jobs.
    pub long_job_timeout: Duration,
    /// How long the worker waits for the backend at startup.
    pub ready_timeout: Duration,
    /// Upper bound on a single HTTP request to the backend.
    pub request_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:7860".into(),
            capacity: 24,
            poll_interval: Duration::from_secs(1),
            generate_timeout: DEFAULT_GENERATE_TIMEOUT,
            long_job_timeout: DEFAULT_LONG_JOB_TIMEOUT,
            ready_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(600),
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                 |
    /// |--------------------------------|-------------------------|
    /// | `BACKEND_URL`                  | `http://127.0.0.1:7860` |
    /// | `QUEUE_CAPACITY`               | `24`                    |
    /// | `QUEUE_POLL_INTERVAL_MS`       | `1000`                  |
    /// | `GENERATE_TIMEOUT_SECS`        | `60`                    |
    /// | `LONG_JOB_TIMEOUT_SECS`        | `300`                   |
    /// | `BACKEND_READY_TIMEOUT_SECS`   | `120`                   |
    /// | `BACKEND_REQUEST_TIMEOUT_SECS` | `600`                   |
    ///
    /// Timeouts of zero are raised to the smallest usable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reading from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backend_url = lookup("BACKEND_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or(defaults.backend_url);

        let capacity = parse_u64(&lookup, "QUEUE_CAPACITY", defaults.capacity as u64)?.max(1);

        let poll_ms = parse_u64(
            &lookup,
            "QUEUE_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?;

        let generate_secs = parse_u64(
            &lookup,
            "GENERATE_TIMEOUT_SECS",
            defaults.generate_timeout.as_secs(),
        )?;

        let long_job_secs = parse_u64(
            &lookup,
            "LONG_JOB_TIMEOUT_SECS",
            defaults.long_job_timeout.as_secs(),
        )?;

        let ready_secs = parse_u64(
            &lookup,
            "BACKEND_READY_TIMEOUT_SECS",
            defaults.ready_timeout.as_secs(),
        )?;

        let request_secs = parse_u64(
            &lookup,
            "BACKEND_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
        )?;

        Ok(Self {
            backend_url,
            capacity: capacity as usize,
            // A zero period would make the interval timer panic.
            poll_interval: Duration::from_millis(poll_ms.max(1)),
            // A zero timeout would fail every job the moment it starts.
            generate_timeout: Duration::from_secs(generate_secs.max(1)),
            long_job_timeout: Duration::from_secs(long_job_secs.max(1)),
            ready_timeout: Duration::from_secs(ready_secs),
            request_timeout: Duration::from_secs(request_secs.max(1)),
        })
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            expected: "a non-negative integer",
            value,
        }),
    }
}
