//! Job kinds and the job status state machine.
//!
//! A job moves `Queued -> Running -> {Completed, Interrupted, Errored,
//! TimedOut}`, or `Queued -> Cancelled` when it is removed before the
//! worker picks it up. Terminal states never transition again.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

/// Default ceiling for straightforward generation requests.
pub const DEFAULT_GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default watchdog for long-running image jobs (upscale, img2img).
pub const DEFAULT_LONG_JOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// What a job asks the backend to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Generate,
    Reroll,
    Variation,
    Upscale,
    ImageToImage,
    Raw,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Generate,
        JobKind::Reroll,
        JobKind::Variation,
        JobKind::Upscale,
        JobKind::ImageToImage,
        JobKind::Raw,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Generate => "generate",
            JobKind::Reroll => "reroll",
            JobKind::Variation => "variation",
            JobKind::Upscale => "upscale",
            JobKind::ImageToImage => "image_to_image",
            JobKind::Raw => "raw",
        }
    }

    /// Whether this kind falls under the long-running watchdog rather
    /// than the plain generation ceiling.
    pub fn is_long_running(self) -> bool {
        matches!(self, JobKind::Upscale | JobKind::ImageToImage)
    }

    /// Pick the timeout for this kind from the two configured ceilings.
    pub fn timeout(self, generate: Duration, long_running: Duration) -> Duration {
        if self.is_long_running() {
            long_running
        } else {
            generate
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::Unknown {
                entity: "job kind",
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Interrupted,
    Errored,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Interrupted => "interrupted",
            JobStatus::Errored => "errored",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
