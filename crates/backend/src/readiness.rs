//! Exponential-backoff wait for a backend to come up.
//!
//! The worker calls [`wait_until_ready`] at startup so the queue only
//! starts accepting jobs once the diffusion server answers its ping.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Delay after the first failed probe.
    pub initial_delay: Duration,
    /// Upper bound on the delay between probes.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Give up after this long. `None` waits forever.
    pub deadline: Option<Duration>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            deadline: Some(Duration::from_secs(120)),
        }
    }
}

/// How a readiness wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    Cancelled,
}

/// Next backoff delay, clamped to [`ReadinessConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReadinessConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Probe `backend` until it answers, the deadline passes, or `cancel`
/// fires.
pub async fn wait_until_ready(
    backend: &dyn Backend,
    config: &ReadinessConfig,
    cancel: &CancellationToken,
) -> Readiness {
    let started = Instant::now();
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        tokio::select! {
            _ = cancel.cancelled() => return Readiness::Cancelled,
            result = backend.ping() => match result {
                Ok(()) => {
                    tracing::info!(attempt, "Backend is ready");
                    return Readiness::Ready;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Backend not ready",
                    );
                }
            }
        }

        if let Some(deadline) = config.deadline {
            if started.elapsed() + delay > deadline {
                tracing::error!(attempt, deadline_secs = deadline.as_secs(), "Backend readiness deadline passed");
                return Readiness::TimedOut;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Readiness::Cancelled,
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, config);
    }
}
