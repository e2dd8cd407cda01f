//! Queue behaviour against an in-memory backend.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use easel_backend::backend::RefreshOutcome;
use easel_backend::catalog::NamedResource;
use easel_backend::messages::{BackendConfig, ConfigUpdate, Progress};
use easel_backend::{
    Backend, BackendError, Catalogs, GenerationRequest, ModelReconciler, ResourceKind,
    ResourceSource,
};
use easel_core::job::{JobKind, JobStatus};
use easel_core::selection::AuxiliaryRequest;
use easel_core::types::JobId;
use easel_events::{EventBus, QueueEvent, QueueEventKind};
use easel_queue::{JobOutcome, JobRequest, QueueConfig, QueueError, RequestQueue, Ticket};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde_json::json;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeBackend {
    alive: AtomicBool,
    config_delay: Duration,
    generate_delay: Duration,
    /// Signalled each time `generate` returns.
    generated: Notify,
    images: Vec<Vec<u8>>,
    prompts: Mutex<Vec<String>>,
    generate_calls: AtomicUsize,
    interrupt_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl FakeBackend {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            config_delay: Duration::ZERO,
            generate_delay: Duration::ZERO,
            generated: Notify::new(),
            images: vec![png(8, 6)],
            prompts: Mutex::new(Vec::new()),
            generate_calls: AtomicUsize::new(0),
            interrupt_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            generate_delay: delay,
            ..Self::new()
        }
    }

    /// `get_config` stalls, so the job hangs while reconciling models.
    fn stalled_config(delay: Duration) -> Self {
        Self {
            config_delay: delay,
            ..Self::new()
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Api {
                status: 502,
                body: "bad gateway".into(),
            })
        }
    }

    async fn get_config(&self) -> Result<BackendConfig, BackendError> {
        tokio::time::sleep(self.config_delay).await;
        Ok(BackendConfig::default())
    }

    async fn update_config(&self, _update: &ConfigUpdate) -> Result<(), BackendError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Vec<u8>>, BackendError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request.payload["prompt"].as_str().unwrap_or_default().to_string();
        self.prompts.lock().unwrap().push(prompt);
        tokio::time::sleep(self.generate_delay).await;
        self.generated.notify_one();
        Ok(self.images.clone())
    }

    async fn get_progress(&self) -> Result<Progress, BackendError> {
        Ok(Progress {
            progress: 0.5,
            eta_relative: 3.0,
            ..Default::default()
        })
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.interrupt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeSource;

#[async_trait]
impl ResourceSource for FakeSource {
    async fn list(&self, kind: ResourceKind) -> Result<Vec<NamedResource>, BackendError> {
        let names: &[&str] = match kind {
            ResourceKind::ControlType => &["Canny", "Depth"],
            ResourceKind::ControlModel => &["control_v11p_sd15_canny [d14c016b]"],
            _ => &[],
        };
        Ok(names.iter().map(|n| NamedResource::new(*n, *n)).collect())
    }

    async fn refresh(&self, _kind: ResourceKind) -> Result<RefreshOutcome, BackendError> {
        Ok(RefreshOutcome::Unsupported)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([40, 80, 120, 255]));
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

fn test_config(capacity: usize) -> QueueConfig {
    QueueConfig {
        capacity,
        poll_interval: Duration::from_millis(10),
        generate_timeout: Duration::from_secs(5),
        long_job_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn build_queue(backend: Arc<FakeBackend>, config: QueueConfig) -> Arc<RequestQueue> {
    let catalogs = Arc::new(Catalogs::new(Arc::new(FakeSource)));
    Arc::new(RequestQueue::new(
        backend,
        Arc::new(ModelReconciler::new(catalogs)),
        Arc::new(EventBus::default()),
        config,
    ))
}

fn request(submitter: &str, prompt: &str) -> JobRequest {
    JobRequest::new(JobKind::Generate, submitter).with_payload(json!({ "prompt": prompt }))
}

async fn outcome(ticket: Ticket) -> JobOutcome {
    tokio::time::timeout(Duration::from_secs(5), ticket.outcome)
        .await
        .expect("job should finish in time")
        .expect("outcome sender should not be dropped")
}

/// Wait for an event about `job_id` matching `pred`.
async fn wait_for(
    rx: &mut broadcast::Receiver<QueueEvent>,
    job_id: JobId,
    pred: impl Fn(&QueueEventKind) -> bool,
) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if event.job_id == job_id && pred(&event.kind) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

// ---------------------------------------------------------------------------
// Add
// ---------------------------------------------------------------------------

#[tokio::test]
async fn third_add_to_capacity_two_queue_is_rejected() {
    let queue = build_queue(Arc::new(FakeBackend::new()), test_config(2));

    let first = queue.add(request("alice", "one")).await.unwrap();
    let second = queue.add(request("alice", "two")).await.unwrap();
    let third = queue.add(request("alice", "three")).await;

    assert_eq!(first.position, 1);
    assert_eq!(second.position, 2);
    assert_matches!(third, Err(QueueError::QueueFull { capacity: 2 }));
    assert_eq!(queue.len().await, 2);
}

#[tokio::test]
async fn dead_backend_rejects_add_without_taking_a_slot() {
    let backend = Arc::new(FakeBackend::new());
    backend.alive.store(false, Ordering::SeqCst);
    let queue = build_queue(backend, test_config(4));

    let result = queue.add(request("alice", "one")).await;

    assert_matches!(result, Err(QueueError::BackendUnavailable(_)));
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn invalid_request_is_rejected() {
    let queue = build_queue(Arc::new(FakeBackend::new()), test_config(4));
    let result = queue.add(request("", "one")).await;
    assert_matches!(result, Err(QueueError::InvalidRequest(_)));
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn jobs_run_in_submission_order() {
    let backend = Arc::new(FakeBackend::new());
    let queue = build_queue(Arc::clone(&backend), test_config(8));

    let tickets = vec![
        queue.add(request("alice", "a")).await.unwrap(),
        queue.add(request("bob", "b")).await.unwrap(),
        queue.add(request("carol", "c")).await.unwrap(),
    ];

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());

    for ticket in tickets {
        assert_matches!(outcome(ticket).await, JobOutcome::Completed { .. });
    }
    assert_eq!(backend.prompts(), vec!["a", "b", "c"]);
    assert_eq!(backend.update_calls.load(Ordering::SeqCst), 0);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn cancelled_job_never_reaches_backend() {
    let backend = Arc::new(FakeBackend::new());
    let queue = build_queue(Arc::clone(&backend), test_config(8));

    let kept = queue.add(request("alice", "kept")).await.unwrap();
    let dropped = queue.add(request("alice", "dropped")).await.unwrap();
    queue.remove(dropped.job_id, "alice").await.unwrap();

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());

    assert_matches!(outcome(kept).await, JobOutcome::Completed { .. });
    let dropped_outcome = outcome(dropped).await;
    assert_eq!(dropped_outcome.status(), JobStatus::Cancelled);
    assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.prompts(), vec!["kept"]);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn four_results_are_composed_into_a_grid() {
    let backend = Arc::new(FakeBackend {
        images: vec![png(8, 6), png(8, 6), png(8, 6), png(8, 6)],
        ..FakeBackend::new()
    });
    let queue = build_queue(backend, test_config(4));
    let ticket = queue.add(request("alice", "grid")).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());

    let image = match outcome(ticket).await {
        JobOutcome::Completed { image } => image,
        other => panic!("expected completion, got {other:?}"),
    };
    let composed = image::load_from_memory(&image).unwrap();
    assert_eq!((composed.width(), composed.height()), (16, 12));

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn progress_is_published_while_generating() {
    let backend = Arc::new(FakeBackend::slow(Duration::from_millis(150)));
    let queue = build_queue(backend, test_config(4));
    let mut events = queue.events().subscribe();
    let ticket = queue.add(request("alice", "slow")).await.unwrap();
    let job_id = ticket.job_id;

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());

    let event = wait_for(&mut events, job_id, |kind| {
        matches!(kind, QueueEventKind::Progress { .. })
    })
    .await;
    assert_matches!(
        event.kind,
        QueueEventKind::Progress {
            percent: 50,
            eta_secs: Some(3)
        }
    );
    assert_matches!(outcome(ticket).await, JobOutcome::Completed { .. });

    cancel.cancel();
    handle.await.unwrap();
}

// ---------------------------------------------------------------------------
// Interrupt / timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupting_running_job_calls_backend_once() {
    let backend = Arc::new(FakeBackend::slow(Duration::from_secs(30)));
    let queue = build_queue(Arc::clone(&backend), test_config(4));
    let mut events = queue.events().subscribe();
    let ticket = queue.add(request("alice", "long")).await.unwrap();
    let job_id = ticket.job_id;

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());

    wait_for(&mut events, job_id, |kind| matches!(kind, QueueEventKind::Started)).await;
    queue.interrupt(job_id, "alice").await.unwrap();
    // A second request for the same job is a no-op.
    queue.interrupt(job_id, "alice").await.ok();

    assert_matches!(outcome(ticket).await, JobOutcome::Interrupted);
    assert_eq!(backend.interrupt_calls.load(Ordering::SeqCst), 1);

    let terminal = wait_for(&mut events, job_id, |_| true).await;
    let mut last = terminal;
    while let Ok(event) = events.try_recv() {
        if event.job_id == job_id {
            last = event;
        }
    }
    assert_matches!(last.kind, QueueEventKind::Interrupted);
    assert!(!queue.is_running().await);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn interrupt_with_nothing_running_fails() {
    let queue = build_queue(Arc::new(FakeBackend::new()), test_config(4));
    let result = queue.interrupt(Uuid::now_v7(), "alice").await;
    assert_matches!(result, Err(QueueError::NothingToInterrupt));
}

#[tokio::test]
async fn slow_job_times_out_and_is_interrupted() {
    let backend = Arc::new(FakeBackend::slow(Duration::from_secs(30)));
    let config = QueueConfig {
        generate_timeout: Duration::from_millis(50),
        ..test_config(4)
    };
    let queue = build_queue(Arc::clone(&backend), config);
    let ticket = queue.add(request("alice", "stuck")).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());

    assert_matches!(outcome(ticket).await, JobOutcome::TimedOut);
    assert_eq!(backend.interrupt_calls.load(Ordering::SeqCst), 1);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn shutdown_interrupts_running_and_cancels_waiting_jobs() {
    let backend = Arc::new(FakeBackend::slow(Duration::from_secs(30)));
    let queue = build_queue(Arc::clone(&backend), test_config(4));
    let mut events = queue.events().subscribe();
    let running = queue.add(request("alice", "running")).await.unwrap();
    let waiting = queue.add(request("bob", "waiting")).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());
    wait_for(&mut events, running.job_id, |kind| {
        matches!(kind, QueueEventKind::Started)
    })
    .await;

    cancel.cancel();
    handle.await.unwrap();

    assert_matches!(outcome(running).await, JobOutcome::Interrupted);
    assert_matches!(outcome(waiting).await, JobOutcome::Cancelled);
    assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stalled_model_reconcile_times_out() {
    let backend = Arc::new(FakeBackend::stalled_config(Duration::from_secs(30)));
    let config = QueueConfig {
        generate_timeout: Duration::from_millis(100),
        ..test_config(4)
    };
    let queue = build_queue(Arc::clone(&backend), config);
    let stuck = queue.add(request("alice", "stuck")).await.unwrap();
    let next = queue.add(request("bob", "next")).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());

    assert_matches!(outcome(stuck).await, JobOutcome::TimedOut);
    // The queue moves on instead of staying wedged behind the stalled job.
    assert_matches!(outcome(next).await, JobOutcome::TimedOut);
    assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 0);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn interrupt_during_model_reconcile_stops_job() {
    let backend = Arc::new(FakeBackend::stalled_config(Duration::from_secs(30)));
    let queue = build_queue(Arc::clone(&backend), test_config(4));
    let mut events = queue.events().subscribe();
    let ticket = queue.add(request("alice", "reconciling")).await.unwrap();
    let job_id = ticket.job_id;

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());

    wait_for(&mut events, job_id, |kind| matches!(kind, QueueEventKind::Started)).await;
    queue.interrupt(job_id, "alice").await.unwrap();

    assert_matches!(outcome(ticket).await, JobOutcome::Interrupted);
    assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 0);
    assert!(!queue.is_running().await);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn shutdown_during_model_reconcile_interrupts_job() {
    let backend = Arc::new(FakeBackend::stalled_config(Duration::from_secs(30)));
    let queue = build_queue(Arc::clone(&backend), test_config(4));
    let mut events = queue.events().subscribe();
    let ticket = queue.add(request("alice", "reconciling")).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());
    wait_for(&mut events, ticket.job_id, |kind| {
        matches!(kind, QueueEventKind::Started)
    })
    .await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should stop promptly")
        .unwrap();

    assert_matches!(outcome(ticket).await, JobOutcome::Interrupted);
    assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn interrupt_while_composing_discards_result() {
    // Large enough that tiling takes a while after `generate` returns.
    let backend = Arc::new(FakeBackend {
        images: (0..9).map(|_| png(1024, 1024)).collect(),
        ..FakeBackend::new()
    });
    let queue = build_queue(Arc::clone(&backend), test_config(4));
    let mut events = queue.events().subscribe();
    let ticket = queue.add(request("alice", "grid")).await.unwrap();
    let job_id = ticket.job_id;

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());

    backend.generated.notified().await;
    let interrupted = queue.interrupt(job_id, "alice").await;
    let result = outcome(ticket).await;

    // An accepted interrupt always wins over the finished images; a
    // rejected one can only mean the job had already left the queue.
    match interrupted {
        Ok(()) => {
            assert_matches!(result, JobOutcome::Interrupted);
            assert_eq!(backend.interrupt_calls.load(Ordering::SeqCst), 1);
            let terminal = wait_for(&mut events, job_id, |kind| {
                matches!(kind, QueueEventKind::Interrupted | QueueEventKind::Completed { .. })
            })
            .await;
            assert_matches!(terminal.kind, QueueEventKind::Interrupted);
        }
        Err(e) => {
            assert_matches!(e, QueueError::NothingToInterrupt);
            assert_matches!(result, JobOutcome::Completed { .. });
        }
    }

    cancel.cancel();
    handle.await.unwrap();
}

// ---------------------------------------------------------------------------
// Ownership and bookkeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn only_submitter_may_remove_or_interrupt() {
    let backend = Arc::new(FakeBackend::slow(Duration::from_secs(30)));
    let queue = build_queue(backend, test_config(4));
    let mut events = queue.events().subscribe();
    let running = queue.add(request("alice", "first")).await.unwrap();
    let waiting = queue.add(request("alice", "second")).await.unwrap();

    assert_matches!(
        queue.remove(waiting.job_id, "mallory").await,
        Err(QueueError::NotOwner(_))
    );

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());
    wait_for(&mut events, running.job_id, |kind| {
        matches!(kind, QueueEventKind::Started)
    })
    .await;

    assert_matches!(
        queue.interrupt(running.job_id, "mallory").await,
        Err(QueueError::NotOwner(_))
    );
    assert_matches!(
        queue.remove(running.job_id, "alice").await,
        Err(QueueError::NotQueued(_))
    );
    assert_matches!(
        queue.interrupt(waiting.job_id, "alice").await,
        Err(QueueError::NotRunning(_))
    );

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn positions_skip_cancelled_jobs() {
    let queue = build_queue(Arc::new(FakeBackend::new()), test_config(8));
    let a = queue.add(request("alice", "a")).await.unwrap();
    let b = queue.add(request("bob", "b")).await.unwrap();
    let c = queue.add(request("carol", "c")).await.unwrap();

    queue.remove(b.job_id, "bob").await.unwrap();

    assert_eq!(queue.position(a.job_id).await, Some(1));
    assert_eq!(queue.position(b.job_id).await, None);
    assert_eq!(queue.position(c.job_id).await, Some(2));
    assert_eq!(queue.len().await, 2);
    assert_matches!(
        queue.remove(Uuid::now_v7(), "alice").await,
        Err(QueueError::NotFound(_))
    );
}

#[tokio::test]
async fn unresolvable_auxiliary_model_fails_before_generation() {
    let backend = Arc::new(FakeBackend::new());
    let queue = build_queue(Arc::clone(&backend), test_config(4));
    let job = request("alice", "pose").with_auxiliary(AuxiliaryRequest {
        enabled: true,
        control_type: Some("canny".into()),
        module: None,
        model: Some("openpose".into()),
    });
    let ticket = queue.add(job).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = queue.start(cancel.clone());

    assert_matches!(outcome(ticket).await, JobOutcome::Errored { error } if error.contains("openpose"));
    assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 0);

    cancel.cancel();
    handle.await.unwrap();
}
