use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use voucher_ocr::{
    app_state::AppState,
    config::{AppConfig, ConfigError},
    models::job::JobSnapshot,
    services::{
        intake::{RedisIntake, Submission},
        queue::{JobQueue, QueueError},
    },
    signals,
};

const POLL_INTERVAL_MS: u64 = 1000; // 1 second

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting voucher OCR worker");

    let config = AppConfig::from_env()?;
    let redis_url = config
        .redis_url
        .clone()
        .ok_or(ConfigError::Missing("REDIS_URL"))?;

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(%addr, "Prometheus scrape listener started");
    }
    describe_metrics();

    tracing::info!("Connecting to Redis job intake");
    let intake = Arc::new(RedisIntake::new(&redis_url)?);
    intake.health_check().await?;
    let orphaned = intake.requeue_orphaned().await?;
    if orphaned > 0 {
        tracing::warn!(count = orphaned, "Requeued submissions left by a previous worker");
    }

    let state = AppState::build(config).await?;

    let mirror = tokio::spawn(mirror_job_states(state.queue.clone(), intake.clone()));
    #[cfg(unix)]
    let reloader = tokio::spawn(reload_ban_list_on_hangup(state.clone()));

    tracing::info!("Worker ready, starting submission loop");

    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let idle = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            result = process_next_submission(&state, &intake) => match result {
                Ok(accepted) => !accepted,
                Err(e) => {
                    tracing::error!(error = %e, "Error taking submission, will retry");
                    true
                }
            },
        };

        if idle {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = sleep(Duration::from_millis(POLL_INTERVAL_MS)) => {}
            }
        }
    }

    // Finish active jobs, fail waiting ones, terminate the engine.
    if let Err(e) = state.queue.shutdown().await {
        tracing::error!(error = %e, "Engine shutdown failed");
    }

    mirror.abort();
    #[cfg(unix)]
    reloader.abort();
    for snapshot in state.queue.jobs() {
        if let Err(e) = intake.publish_state(&snapshot).await {
            tracing::error!(job_id = %snapshot.id, error = %e, "Failed to publish final job state");
        }
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("voucher_jobs_total", "Total extraction jobs submitted");
    metrics::describe_counter!("voucher_jobs_completed", "Total extraction jobs completed");
    metrics::describe_counter!("voucher_jobs_failed", "Total extraction jobs that failed");
    metrics::describe_counter!("voucher_jobs_stalled", "Job attempts abandoned after the timeout");
    metrics::describe_counter!("voucher_codes_found_total", "Voucher codes extracted across all jobs");
    metrics::describe_counter!("voucher_recognitions_total", "Recognition engine calls");
    metrics::describe_counter!(
        "voucher_recognition_failures_total",
        "Recognition engine calls that failed"
    );
    metrics::describe_histogram!(
        "voucher_job_processing_seconds",
        "Time spent on one job attempt"
    );
    metrics::describe_histogram!(
        "voucher_recognition_seconds",
        "Time spent in one recognition engine call"
    );
    metrics::describe_gauge!(
        "voucher_queue_depth",
        "Current number of jobs waiting for a worker"
    );
}

/// Take one submission off Redis and hand it to the job pool.
/// Returns Ok(true) if a submission was taken, Ok(false) if none was available.
async fn process_next_submission(
    state: &AppState,
    intake: &RedisIntake,
) -> Result<bool, Box<dyn std::error::Error>> {
    let claimed = match intake.next_submission().await? {
        Some(c) => c,
        None => return Ok(false),
    };
    let Submission { job_id, payload } = claimed.submission.clone();

    match state.queue.enqueue_with_id(job_id, payload).await {
        Ok(_) => {
            tracing::info!(job_id = %job_id, "Accepted submission");
        }
        Err(QueueError::ShuttingDown) => {
            // Leave it in the processing list; the next worker start requeues it.
            tracing::warn!(job_id = %job_id, "Queue shutting down, submission left for requeue");
            return Ok(true);
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Rejected submission");
        }
    }

    intake.acknowledge(&claimed).await?;
    Ok(true)
}

/// Mirror every job state change into Redis; drop finished jobs from memory
/// once their final state is published.
async fn mirror_job_states(queue: Arc<JobQueue>, intake: Arc<RedisIntake>) {
    let mut events = queue.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Job state mirror lagged, republishing all jobs");
                for snapshot in queue.jobs() {
                    publish(&queue, &intake, snapshot).await;
                }
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if let Some(snapshot) = queue.get_job_state(event.job_id()) {
            publish(&queue, &intake, snapshot).await;
        }
    }
}

async fn publish(queue: &JobQueue, intake: &RedisIntake, snapshot: JobSnapshot) {
    match intake.publish_state(&snapshot).await {
        Ok(()) => {
            if snapshot.status.is_terminal() {
                queue.forget(snapshot.id);
            }
        }
        Err(e) => {
            tracing::error!(job_id = %snapshot.id, error = %e, "Failed to publish job state");
        }
    }
}

#[cfg(unix)]
async fn reload_ban_list_on_hangup(state: AppState) {
    let Some(mut hangups) = signals::reload_signal() else {
        return;
    };
    while hangups.recv().await.is_some() {
        match state.ban_list.reload() {
            Ok(version) => tracing::info!(version, "Ban-list reloaded"),
            Err(e) => tracing::error!(error = %e, "Ban-list reload failed, keeping current version"),
        }
    }
}
