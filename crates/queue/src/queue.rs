//! The serialized request queue and its worker loop.
//!
//! Producers call [`RequestQueue::add`]; a single worker task started with
//! [`RequestQueue::start`] polls on a fixed cadence and runs at most one
//! job at a time, matching the backend's single-job constraint.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use easel_backend::reconcile::ReconcileError;
use easel_backend::{Backend, BackendError, GenerationRequest, ModelReconciler};
use easel_core::compositor::tile_images;
use easel_core::error::CoreError;
use easel_core::types::{JobId, SubmitterId};
use easel_events::{EventBus, QueueEvent, QueueEventKind};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::job::{Job, JobOutcome, JobRequest, Ticket};
use crate::progress;

/// Errors returned synchronously by queue operations.
///
/// Job-level failures never show up here; they arrive as a
/// [`JobOutcome`] on the job's own ticket.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full ({capacity} jobs waiting)")]
    QueueFull { capacity: usize },

    #[error("Backend is unavailable: {0}")]
    BackendUnavailable(#[source] BackendError),

    #[error(transparent)]
    InvalidRequest(#[from] CoreError),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {0} belongs to another submitter")]
    NotOwner(JobId),

    /// `remove` was called on the running job.
    #[error("Job {0} is already running and can only be interrupted")]
    NotQueued(JobId),

    #[error("No job is running")]
    NothingToInterrupt,

    #[error("Job {0} is not the running job")]
    NotRunning(JobId),
}

struct PendingJob {
    job: Job,
    outcome_tx: oneshot::Sender<JobOutcome>,
}

struct RunningJob {
    id: JobId,
    submitter: SubmitterId,
    /// Taken by the first `interrupt` call.
    interrupt_tx: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingJob>,
    /// Ids in `pending` flagged by `remove`; discarded at dequeue.
    cancelled: HashSet<JobId>,
    running: Option<RunningJob>,
}

impl QueueState {
    fn waiting(&self) -> impl Iterator<Item = &PendingJob> {
        self.pending
            .iter()
            .filter(move |entry| !self.cancelled.contains(&entry.job.id))
    }
}

/// Why a running job was stopped before it could finish on its own.
#[derive(Debug, Clone, Copy)]
enum Stop {
    Shutdown,
    Interrupted,
    TimedOut,
}

/// Run one phase of a job unless shutdown, an interrupt, or the job's
/// deadline comes first. The phase future is dropped when it loses.
///
/// `interrupt_rx` must not have completed yet: the caller stops the job
/// as soon as this returns `Err(Stop::Interrupted)`.
async fn until_stopped<F: Future>(
    phase: F,
    shutdown: &CancellationToken,
    interrupt_rx: &mut oneshot::Receiver<()>,
    deadline: &mut Pin<Box<Sleep>>,
) -> Result<F::Output, Stop> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(Stop::Shutdown),
        Ok(()) = &mut *interrupt_rx => Err(Stop::Interrupted),
        _ = deadline.as_mut() => Err(Stop::TimedOut),
        output = phase => Ok(output),
    }
}

/// Bounded FIFO of jobs for one backend, drained by one worker task.
pub struct RequestQueue {
    backend: Arc<dyn Backend>,
    reconciler: Arc<ModelReconciler>,
    events: Arc<EventBus>,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

impl RequestQueue {
    pub fn new(
        backend: Arc<dyn Backend>,
        reconciler: Arc<ModelReconciler>,
        events: Arc<EventBus>,
        config: QueueConfig,
    ) -> Self {
        Self {
            backend,
            reconciler,
            events,
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Accept a job into the buffer.
    ///
    /// Pings the backend first; a dead backend or a full buffer is
    /// reported immediately and the job never takes a slot.
    pub async fn add(&self, request: JobRequest) -> Result<Ticket, QueueError> {
        request.validate()?;

        if let Err(e) = self.backend.ping().await {
            tracing::warn!(error = %e, "Rejecting job, backend unreachable");
            return Err(QueueError::BackendUnavailable(e));
        }

        let job = Job::new(request);
        let job_id = job.id;
        let kind = job.kind();
        let submitter = job.request.submitter.clone();
        let (outcome_tx, outcome) = oneshot::channel();

        let position = {
            let mut state = self.state.lock().await;
            if state.pending.len() >= self.config.capacity {
                tracing::warn!(capacity = self.config.capacity, "Rejecting job, queue full");
                return Err(QueueError::QueueFull {
                    capacity: self.config.capacity,
                });
            }
            state.pending.push_back(PendingJob { job, outcome_tx });
            state.waiting().count()
        };

        tracing::info!(%job_id, %kind, %submitter, position, "Job queued");
        self.events.publish(QueueEvent::new(
            job_id,
            submitter,
            QueueEventKind::Queued { position },
        ));

        Ok(Ticket {
            job_id,
            position,
            outcome,
        })
    }

    /// Cancel a job that has not started yet.
    ///
    /// The job keeps its slot until the worker reaches it and discards it
    /// without calling the backend. Removing the running job is not
    /// supported; use [`interrupt`](Self::interrupt).
    pub async fn remove(&self, job_id: JobId, requester: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        if let Some(running) = state.running.as_ref().filter(|r| r.id == job_id) {
            if running.submitter != requester {
                return Err(QueueError::NotOwner(job_id));
            }
            return Err(QueueError::NotQueued(job_id));
        }

        let entry = state
            .pending
            .iter()
            .find(|entry| entry.job.id == job_id)
            .ok_or(QueueError::NotFound(job_id))?;
        if entry.job.submitter() != requester {
            return Err(QueueError::NotOwner(job_id));
        }

        if state.cancelled.insert(job_id) {
            tracing::info!(%job_id, "Job cancelled before start");
        }
        Ok(())
    }

    /// Ask the running job to stop.
    ///
    /// The worker calls the backend's interrupt once and reports the job
    /// as `Interrupted`. Repeated calls for the same job are no-ops.
    pub async fn interrupt(&self, job_id: JobId, requester: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let running = state
            .running
            .as_mut()
            .ok_or(QueueError::NothingToInterrupt)?;

        if running.id != job_id {
            return Err(QueueError::NotRunning(job_id));
        }
        if running.submitter != requester {
            return Err(QueueError::NotOwner(job_id));
        }

        if let Some(tx) = running.interrupt_tx.take() {
            tracing::info!(%job_id, "Interrupt requested");
            let _ = tx.send(());
        }
        Ok(())
    }

    /// 1-based position of a waiting job, ignoring cancelled entries.
    pub async fn position(&self, job_id: JobId) -> Option<usize> {
        let state = self.state.lock().await;
        let index = state.waiting().position(|entry| entry.job.id == job_id);
        index.map(|index| index + 1)
    }

    /// Number of jobs waiting (not counting cancelled or running ones).
    pub async fn len(&self) -> usize {
        self.state.lock().await.waiting().count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running.is_some()
    }

    /// Spawn the worker loop. It runs until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.run(cancel).await })
    }

    /// Worker loop: on every tick, if idle, run the next waiting job.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            capacity = self.config.capacity,
            "Request queue started",
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Request queue shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Some((entry, interrupt_rx)) = self.next_job().await {
                        self.run_job(entry, interrupt_rx, &cancel).await;
                    }
                }
            }
        }

        self.cancel_all_pending().await;
    }

    // ---- private helpers ----

    /// Dequeue the next job that was not cancelled and mark it running.
    ///
    /// Cancelled jobs found on the way are finished without touching the
    /// backend.
    async fn next_job(&self) -> Option<(PendingJob, oneshot::Receiver<()>)> {
        let mut state = self.state.lock().await;
        loop {
            let entry = state.pending.pop_front()?;
            if state.cancelled.remove(&entry.job.id) {
                self.finish(entry, JobOutcome::Cancelled);
                continue;
            }

            let (interrupt_tx, interrupt_rx) = oneshot::channel();
            state.running = Some(RunningJob {
                id: entry.job.id,
                submitter: entry.job.request.submitter.clone(),
                interrupt_tx: Some(interrupt_tx),
            });
            return Some((entry, interrupt_rx));
        }
    }

    async fn run_job(
        &self,
        entry: PendingJob,
        mut interrupt_rx: oneshot::Receiver<()>,
        shutdown: &CancellationToken,
    ) {
        let job = &entry.job;
        tracing::info!(
            job_id = %job.id,
            kind = %job.kind(),
            submitter = job.submitter(),
            "Job started",
        );
        self.events.publish(QueueEvent::new(
            job.id,
            job.request.submitter.clone(),
            QueueEventKind::Started,
        ));

        let outcome = self.execute(job, &mut interrupt_rx, shutdown).await;

        // `interrupt` sends under the state lock, so once `running` is
        // cleared any request that was accepted is visible here.
        self.state.lock().await.running = None;
        let outcome = match outcome {
            JobOutcome::Completed { .. } if interrupt_rx.try_recv().is_ok() => {
                self.stop(job, Stop::Interrupted).await
            }
            outcome => outcome,
        };
        self.finish(entry, outcome);
    }

    /// Reconcile models, generate, then compose the results.
    ///
    /// One deadline covers all three phases, and each of them gives way to
    /// shutdown or an interrupt.
    async fn execute(
        &self,
        job: &Job,
        interrupt_rx: &mut oneshot::Receiver<()>,
        shutdown: &CancellationToken,
    ) -> JobOutcome {
        let mut deadline = Box::pin(tokio::time::sleep(self.timeout_for(job)));

        let request = match until_stopped(self.prepare(job), shutdown, interrupt_rx, &mut deadline)
            .await
        {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                return JobOutcome::Errored {
                    error: e.to_string(),
                }
            }
            Err(stop) => return self.stop(job, stop).await,
        };

        let done = CancellationToken::new();
        let observer = tokio::spawn(progress::observe(
            Arc::clone(&self.backend),
            Arc::clone(&self.events),
            job.id,
            job.request.submitter.clone(),
            self.config.poll_interval,
            done.clone(),
        ));
        let generated = until_stopped(
            self.backend.generate(&request),
            shutdown,
            interrupt_rx,
            &mut deadline,
        )
        .await;
        done.cancel();
        if let Err(e) = observer.await {
            tracing::warn!(job_id = %job.id, error = %e, "Progress observer panicked");
        }

        let images = match generated {
            Ok(Ok(images)) => images,
            Ok(Err(e)) => {
                return JobOutcome::Errored {
                    error: e.to_string(),
                }
            }
            Err(stop) => return self.stop(job, stop).await,
        };

        match until_stopped(self.compose(job.id, images), shutdown, interrupt_rx, &mut deadline)
            .await
        {
            Ok(outcome) => outcome,
            Err(stop) => self.stop(job, stop).await,
        }
    }

    /// Tell the backend to stop and map the reason to an outcome.
    async fn stop(&self, job: &Job, stop: Stop) -> JobOutcome {
        self.interrupt_backend(job.id).await;
        match stop {
            Stop::Shutdown | Stop::Interrupted => JobOutcome::Interrupted,
            Stop::TimedOut => {
                let timeout = self.timeout_for(job);
                tracing::warn!(
                    job_id = %job.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Job exceeded its time limit",
                );
                JobOutcome::TimedOut
            }
        }
    }

    fn timeout_for(&self, job: &Job) -> Duration {
        job.kind()
            .timeout(self.config.generate_timeout, self.config.long_job_timeout)
    }

    /// Reconcile backend models and resolve the auxiliary unit.
    async fn prepare(&self, job: &Job) -> Result<GenerationRequest, ReconcileError> {
        let config = self
            .reconciler
            .prepare(self.backend.as_ref(), &job.request.models)
            .await?;
        tracing::debug!(
            job_id = %job.id,
            checkpoint = ?config.checkpoint,
            vae = ?config.vae,
            "Backend prepared",
        );

        let auxiliary = self
            .reconciler
            .resolve_auxiliary(&job.request.auxiliary)
            .await?;

        Ok(GenerationRequest {
            kind: job.kind(),
            payload: job.request.payload.clone(),
            auxiliary,
        })
    }

    async fn compose(&self, job_id: JobId, images: Vec<Vec<u8>>) -> JobOutcome {
        let count = images.len();
        match tokio::task::spawn_blocking(move || tile_images(images)).await {
            Ok(Ok(image)) => {
                tracing::debug!(%job_id, count, bytes = image.len(), "Result images composed");
                JobOutcome::Completed {
                    image: Arc::new(image),
                }
            }
            Ok(Err(e)) => JobOutcome::Errored {
                error: e.to_string(),
            },
            Err(e) => JobOutcome::Errored {
                error: format!("Compositor task failed: {e}"),
            },
        }
    }

    async fn interrupt_backend(&self, job_id: JobId) {
        if let Err(e) = self.backend.interrupt().await {
            tracing::warn!(%job_id, error = %e, "Backend interrupt failed");
        }
    }

    /// Log, publish, and deliver a terminal outcome.
    fn finish(&self, entry: PendingJob, outcome: JobOutcome) {
        let PendingJob { job, outcome_tx } = entry;

        let kind = match &outcome {
            JobOutcome::Completed { image } => {
                tracing::info!(job_id = %job.id, bytes = image.len(), "Job completed");
                QueueEventKind::Completed {
                    image: Arc::clone(image),
                }
            }
            JobOutcome::Errored { error } => {
                tracing::error!(job_id = %job.id, error = %error, "Job failed");
                QueueEventKind::Failed {
                    error: error.clone(),
                }
            }
            JobOutcome::Interrupted => {
                tracing::info!(job_id = %job.id, "Job interrupted");
                QueueEventKind::Interrupted
            }
            JobOutcome::TimedOut => {
                tracing::info!(job_id = %job.id, "Job timed out");
                QueueEventKind::TimedOut
            }
            JobOutcome::Cancelled => {
                tracing::info!(job_id = %job.id, "Cancelled job discarded");
                QueueEventKind::Cancelled
            }
        };

        self.events
            .publish(QueueEvent::new(job.id, job.request.submitter, kind));
        // The submitter may have dropped its ticket.
        let _ = outcome_tx.send(outcome);
    }

    /// On shutdown, every job still waiting is reported as cancelled.
    async fn cancel_all_pending(&self) {
        let drained: Vec<PendingJob> = {
            let mut state = self.state.lock().await;
            state.cancelled.clear();
            state.pending.drain(..).collect()
        };
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Cancelling jobs left in queue");
        }
        for entry in drained {
            self.finish(entry, JobOutcome::Cancelled);
        }
    }
}
