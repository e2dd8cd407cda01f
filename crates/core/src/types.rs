/// Jobs are keyed by time-ordered v7 UUIDs.
pub type JobId = uuid::Uuid;

/// Opaque chat-platform user identifier of whoever submitted a job.
pub type SubmitterId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
