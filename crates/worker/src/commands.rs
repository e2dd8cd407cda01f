//! Line-delimited JSON commands read from stdin.
//!
//! ```text
//! {"op":"submit","kind":"generate","submitter":"alice","payload":{"prompt":"a cat"}}
//! {"op":"remove","job_id":"...","submitter":"alice"}
//! {"op":"interrupt","job_id":"...","submitter":"alice"}
//! {"op":"refresh"}
//! {"op":"status"}
//! ```

use std::sync::Arc;

use easel_backend::Catalogs;
use easel_core::types::{JobId, SubmitterId};
use easel_queue::{JobRequest, RequestQueue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Submit(JobRequest),
    Remove {
        job_id: JobId,
        submitter: SubmitterId,
    },
    Interrupt {
        job_id: JobId,
        submitter: SubmitterId,
    },
    /// Rescan every resource catalog.
    Refresh,
    Status,
}

/// One reply line per command.
#[derive(Debug, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Queued { job_id: JobId, position: usize },
    Ok,
    Refreshed { catalogs: Vec<CatalogCount> },
    Status { waiting: usize, running: bool },
    Error { message: String },
}

#[derive(Debug, Serialize)]
pub struct CatalogCount {
    pub kind: String,
    pub entries: Option<usize>,
    pub error: Option<String>,
}

pub fn parse(line: &str) -> Result<Command, serde_json::Error> {
    serde_json::from_str(line)
}

pub async fn execute(command: Command, queue: &RequestQueue, catalogs: &Arc<Catalogs>) -> Reply {
    match command {
        Command::Submit(request) => match queue.add(request).await {
            // The worker reports outcomes through the event bus, so the
            // ticket's receiver is not needed here.
            Ok(ticket) => Reply::Queued {
                job_id: ticket.job_id,
                position: ticket.position,
            },
            Err(e) => Reply::Error {
                message: e.to_string(),
            },
        },
        Command::Remove { job_id, submitter } => match queue.remove(job_id, &submitter).await {
            Ok(()) => Reply::Ok,
            Err(e) => Reply::Error {
                message: e.to_string(),
            },
        },
        Command::Interrupt { job_id, submitter } => {
            match queue.interrupt(job_id, &submitter).await {
                Ok(()) => Reply::Ok,
                Err(e) => Reply::Error {
                    message: e.to_string(),
                },
            }
        }
        Command::Refresh => {
            let catalogs = catalogs
                .refresh_all()
                .await
                .into_iter()
                .map(|(kind, result)| match result {
                    Ok(count) => CatalogCount {
                        kind: kind.to_string(),
                        entries: Some(count),
                        error: None,
                    },
                    Err(e) => CatalogCount {
                        kind: kind.to_string(),
                        entries: None,
                        error: Some(e.to_string()),
                    },
                })
                .collect();
            Reply::Refreshed { catalogs }
        }
        Command::Status => Reply::Status {
            waiting: queue.len().await,
            running: queue.is_running().await,
        },
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use easel_core::job::JobKind;

    use super::*;

    #[test]
    fn parse_submit_with_payload() {
        let command = parse(
            r#"{"op":"submit","kind":"upscale","submitter":"alice","payload":{"upscaling_resize":2},"models":{"checkpoint":"anyv4"}}"#,
        )
        .unwrap();
        assert_matches!(command, Command::Submit(request) => {
            assert_eq!(request.kind, JobKind::Upscale);
            assert_eq!(request.submitter, "alice");
            assert_eq!(request.payload["upscaling_resize"], 2);
            assert_eq!(request.models.checkpoint.as_deref(), Some("anyv4"));
        });
    }

    #[test]
    fn parse_interrupt() {
        let command = parse(
            r#"{"op":"interrupt","job_id":"01890a5d-ac96-774b-bcce-b302099a8057","submitter":"bob"}"#,
        )
        .unwrap();
        assert_matches!(command, Command::Interrupt { submitter, .. } if submitter == "bob");
    }

    #[test]
    fn parse_unit_commands() {
        assert_matches!(parse(r#"{"op":"refresh"}"#), Ok(Command::Refresh));
        assert_matches!(parse(r#"{"op":"status"}"#), Ok(Command::Status));
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(parse(r#"{"op":"paint"}"#).is_err());
        assert!(parse("not json").is_err());
    }

    #[test]
    fn replies_are_tagged() {
        let json = serde_json::to_value(Reply::Status {
            waiting: 3,
            running: true,
        })
        .unwrap();
        assert_eq!(json["reply"], "status");
        assert_eq!(json["waiting"], 3);
    }
}
