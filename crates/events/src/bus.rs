//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans [`QueueEvent`]s out to any number of subscribers
//! (the presentation layer, loggers, tests). It is shared via
//! `Arc<EventBus>`.

use std::sync::Arc;

use chrono::Utc;
use easel_core::job_events::{
    MSG_TYPE_JOB_CANCELLED, MSG_TYPE_JOB_COMPLETED, MSG_TYPE_JOB_FAILED,
    MSG_TYPE_JOB_INTERRUPTED, MSG_TYPE_JOB_PROGRESS, MSG_TYPE_JOB_QUEUED, MSG_TYPE_JOB_STARTED,
    MSG_TYPE_JOB_TIMED_OUT,
};
use easel_core::types::{JobId, SubmitterId, Timestamp};
use serde::Serialize;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// QueueEvent
// ---------------------------------------------------------------------------

/// Something that happened to a job.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEvent {
    pub job_id: JobId,
    pub submitter: SubmitterId,
    #[serde(flatten)]
    pub kind: QueueEventKind,
    pub timestamp: Timestamp,
}

/// Per-transition payload of a [`QueueEvent`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEventKind {
    /// Accepted into the buffer at this 1-based position.
    Queued { position: usize },
    Started,
    Progress {
        percent: i16,
        eta_secs: Option<u64>,
    },
    /// The composed PNG. Not serialized; consumers read it in-process.
    Completed {
        #[serde(skip)]
        image: Arc<Vec<u8>>,
    },
    Failed { error: String },
    Interrupted,
    TimedOut,
    Cancelled,
}

impl QueueEvent {
    pub fn new(job_id: JobId, submitter: impl Into<SubmitterId>, kind: QueueEventKind) -> Self {
        Self {
            job_id,
            submitter: submitter.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Stable event-type string, e.g. `"job_completed"`.
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            QueueEventKind::Queued { .. } => MSG_TYPE_JOB_QUEUED,
            QueueEventKind::Started => MSG_TYPE_JOB_STARTED,
            QueueEventKind::Progress { .. } => MSG_TYPE_JOB_PROGRESS,
            QueueEventKind::Completed { .. } => MSG_TYPE_JOB_COMPLETED,
            QueueEventKind::Failed { .. } => MSG_TYPE_JOB_FAILED,
            QueueEventKind::Interrupted => MSG_TYPE_JOB_INTERRUPTED,
            QueueEventKind::TimedOut => MSG_TYPE_JOB_TIMED_OUT,
            QueueEventKind::Cancelled => MSG_TYPE_JOB_CANCELLED,
        }
    }

    /// True for events after which the job produces nothing further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            QueueEventKind::Completed { .. }
                | QueueEventKind::Failed { .. }
                | QueueEventKind::Interrupted
                | QueueEventKind::TimedOut
                | QueueEventKind::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out event bus.
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// Slow receivers that fall behind observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: QueueEvent) {
        tracing::trace!(
            job_id = %event.job_id,
            event_type = event.event_type(),
            "Publishing queue event",
        );
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
