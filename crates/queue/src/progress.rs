//! Progress observation for the running job.
//!
//! Runs as its own task next to the generation call so slow generations
//! never block progress reporting. Stops when `done` is cancelled.

use std::sync::Arc;
use std::time::Duration;

use easel_backend::Backend;
use easel_core::types::{JobId, SubmitterId};
use easel_events::{EventBus, QueueEvent, QueueEventKind};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub(crate) async fn observe(
    backend: Arc<dyn Backend>,
    events: Arc<EventBus>,
    job_id: JobId,
    submitter: SubmitterId,
    poll_interval: Duration,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<(i16, Option<u64>)> = None;

    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let progress = tokio::select! {
            biased;
            _ = done.cancelled() => break,
            result = backend.get_progress() => result,
        };

        match progress {
            Ok(progress) => {
                let current = (progress.percent(), progress.eta_secs());
                // Only republish when something visible changed.
                if last == Some(current) {
                    continue;
                }
                last = Some(current);
                events.publish(QueueEvent::new(
                    job_id,
                    submitter.clone(),
                    QueueEventKind::Progress {
                        percent: current.0,
                        eta_secs: current.1,
                    },
                ));
            }
            Err(e) => {
                tracing::debug!(%job_id, error = %e, "Progress poll failed");
            }
        }
    }

    tracing::trace!(%job_id, "Progress observer stopped");
}
