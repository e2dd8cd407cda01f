//! Event type constants for queue lifecycle updates.
//!
//! Carried in `QueueEvent::event_type` so the presentation layer can
//! route updates without matching on the enum.

/// A job was accepted into the buffer (carries its position).
pub const MSG_TYPE_JOB_QUEUED: &str = "job_queued";

/// The worker picked up a job and is preparing the backend.
pub const MSG_TYPE_JOB_STARTED: &str = "job_started";

/// Progress update during generation (fraction + eta).
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";

/// Job completed and produced a composed image.
pub const MSG_TYPE_JOB_COMPLETED: &str = "job_completed";

/// Job failed with an error.
pub const MSG_TYPE_JOB_FAILED: &str = "job_failed";

/// Job was interrupted while running.
pub const MSG_TYPE_JOB_INTERRUPTED: &str = "job_interrupted";

/// Job exceeded its per-kind ceiling and was force-interrupted.
pub const MSG_TYPE_JOB_TIMED_OUT: &str = "job_timed_out";

/// Job was removed before it ever ran.
pub const MSG_TYPE_JOB_CANCELLED: &str = "job_cancelled";
