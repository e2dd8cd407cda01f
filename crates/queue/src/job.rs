//! Job request, queued job, and terminal outcome types.

use std::sync::Arc;

use chrono::Utc;
use easel_core::error::CoreError;
use easel_core::job::{JobKind, JobStatus};
use easel_core::selection::{AuxiliaryRequest, ModelSelection};
use easel_core::types::{JobId, SubmitterId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// What a submitter asks the queue to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: JobKind,
    /// Backend parameters (prompt, steps, ...). Passed through untouched.
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub models: ModelSelection,
    #[serde(default)]
    pub auxiliary: AuxiliaryRequest,
    pub submitter: SubmitterId,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl JobRequest {
    pub fn new(kind: JobKind, submitter: impl Into<SubmitterId>) -> Self {
        Self {
            kind,
            payload: empty_payload(),
            models: ModelSelection::default(),
            auxiliary: AuxiliaryRequest::default(),
            submitter: submitter.into(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_models(mut self, models: ModelSelection) -> Self {
        self.models = models;
        self
    }

    pub fn with_auxiliary(mut self, auxiliary: AuxiliaryRequest) -> Self {
        self.auxiliary = auxiliary;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.submitter.trim().is_empty() {
            return Err(CoreError::Validation("Submitter id is required".into()));
        }
        if !self.payload.is_object() {
            return Err(CoreError::Validation(
                "Payload must be a JSON object".into(),
            ));
        }
        self.models.validate()?;
        self.auxiliary.validate()
    }
}

/// A request accepted into the queue.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub request: JobRequest,
    pub created_at: Timestamp,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            id: Uuid::now_v7(),
            request,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.request.kind
    }

    pub fn submitter(&self) -> &str {
        &self.request.submitter
    }
}

/// How a job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// The composed PNG (or the single raw image).
    Completed { image: Arc<Vec<u8>> },
    Interrupted,
    TimedOut,
    Errored { error: String },
    /// Removed before it ever ran.
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Interrupted => JobStatus::Interrupted,
            JobOutcome::TimedOut => JobStatus::TimedOut,
            JobOutcome::Errored { .. } => JobStatus::Errored,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Receipt handed back by [`RequestQueue::add`](crate::RequestQueue::add).
#[derive(Debug)]
pub struct Ticket {
    pub job_id: JobId,
    /// 1-based position among the jobs waiting at submission time.
    pub position: usize,
    /// Resolves exactly once with the job's terminal outcome.
    pub outcome: oneshot::Receiver<JobOutcome>,
}
