//! Per-backend serialized request queue.
//!
//! [`RequestQueue`] holds a bounded FIFO of pending jobs and runs them one
//! at a time on a dedicated worker task: reconcile the backend's models,
//! generate while a progress loop observes, then compose the result.
//! Every transition is published on the [`easel_events::EventBus`].

pub mod config;
pub mod job;
mod progress;
pub mod queue;

pub use config::{ConfigError, QueueConfig};
pub use job::{Job, JobOutcome, JobRequest, Ticket};
pub use queue::{QueueError, RequestQueue};
