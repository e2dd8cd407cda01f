mod commands;

use std::sync::Arc;

use anyhow::Context;
use easel_backend::api::StableDiffusionApi;
use easel_backend::readiness::{wait_until_ready, Readiness, ReadinessConfig};
use easel_backend::{Catalogs, ModelReconciler};
use easel_events::{EventBus, QueueEvent, QueueEventKind};
use easel_queue::{QueueConfig, RequestQueue};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::Reply;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "easel_worker=debug,easel_queue=debug,easel_backend=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = QueueConfig::from_env().context("Invalid queue configuration")?;
    tracing::info!(backend_url = %config.backend_url, capacity = config.capacity, "Worker starting");

    let api = Arc::new(
        StableDiffusionApi::new(config.backend_url.clone(), config.request_timeout)
            .context("Failed to build backend HTTP client")?,
    );
    let catalogs = Arc::new(Catalogs::new(api.clone()));
    let reconciler = Arc::new(ModelReconciler::new(Arc::clone(&catalogs)));
    let events = Arc::new(EventBus::default());

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let readiness = ReadinessConfig {
        deadline: Some(config.ready_timeout),
        ..Default::default()
    };
    match wait_until_ready(api.as_ref(), &readiness, &cancel).await {
        Readiness::Ready => {}
        Readiness::TimedOut => {
            anyhow::bail!("Backend at {} did not become ready", config.backend_url)
        }
        Readiness::Cancelled => return Ok(()),
    }

    let logger = tokio::spawn(log_events(events.subscribe(), cancel.clone()));
    let queue = Arc::new(RequestQueue::new(api, reconciler, events, config));
    let worker = queue.start(cancel.clone());

    read_commands(&queue, &catalogs, &cancel).await;
    cancel.cancelled().await;

    worker.await.context("Queue worker panicked")?;
    logger.await.context("Event logger panicked")?;
    tracing::info!("Worker stopped");
    Ok(())
}

/// Serve stdin commands until EOF or shutdown.
async fn read_commands(queue: &RequestQueue, catalogs: &Arc<Catalogs>, cancel: &CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("Command input closed; running until shutdown");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read command input");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match commands::parse(&line) {
            Ok(command) => commands::execute(command, queue, catalogs).await,
            Err(e) => Reply::Error {
                message: format!("Invalid command: {e}"),
            },
        };
        match serde_json::to_string(&reply) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::error!(error = %e, "Failed to encode reply"),
        }
    }
}

/// Print every queue event as a JSON line and log it.
async fn log_events(mut rx: broadcast::Receiver<QueueEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };

        match event {
            Ok(event) => {
                match &event.kind {
                    QueueEventKind::Failed { error } => tracing::warn!(
                        job_id = %event.job_id,
                        submitter = %event.submitter,
                        error = %error,
                        "Job failed",
                    ),
                    QueueEventKind::Completed { image } => tracing::info!(
                        job_id = %event.job_id,
                        submitter = %event.submitter,
                        bytes = image.len(),
                        "Job delivered",
                    ),
                    _ => tracing::debug!(
                        job_id = %event.job_id,
                        event_type = event.event_type(),
                        "Queue event",
                    ),
                }
                if let Ok(json) = serde_json::to_string(&event) {
                    println!("{json}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
