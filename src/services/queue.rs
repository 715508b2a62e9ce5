//! In-process job queue and bounded worker pool.
//!
//! Jobs move `waiting -> active -> completed | failed`. A job running longer
//! than the configured timeout is stalled: its attempt is abandoned and it is
//! put back to waiting, up to `max_stalled_count` times, after which it fails.
//! Execution is therefore at-least-once under stall recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::job::{
    JobEvent, JobInput, JobOutcome, JobPayload, JobSnapshot, JobStatus, ValidationError,
};
use crate::services::engine::EngineError;
use crate::services::pipeline::{progress, VoucherPipeline};

const EVENT_CAPACITY: usize = 1024;

pub const SHUTDOWN_REASON: &str = "queue shut down before job started";

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub job_timeout: Duration,
    pub max_stalled_count: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            job_timeout: Duration::from_secs(600),
            max_stalled_count: 2,
        }
    }
}

struct QueueInner {
    pipeline: Arc<VoucherPipeline>,
    settings: QueueSettings,
    jobs: Mutex<HashMap<Uuid, JobSnapshot>>,
    waiting_tx: mpsc::UnboundedSender<Uuid>,
    waiting_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Uuid>>,
    events: broadcast::Sender<JobEvent>,
    accepting: AtomicBool,
    stop: watch::Sender<bool>,
}

pub struct JobQueue {
    inner: Arc<QueueInner>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Create the queue and spawn `settings.concurrency` workers.
    pub fn start(pipeline: Arc<VoucherPipeline>, settings: QueueSettings) -> Self {
        let (waiting_tx, waiting_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stop, _) = watch::channel(false);
        let concurrency = settings.concurrency.max(1);

        let inner = Arc::new(QueueInner {
            pipeline,
            settings,
            jobs: Mutex::new(HashMap::new()),
            waiting_tx,
            waiting_rx: tokio::sync::Mutex::new(waiting_rx),
            events,
            accepting: AtomicBool::new(true),
            stop,
        });

        let workers = (0..concurrency)
            .map(|worker| {
                let inner = inner.clone();
                tokio::spawn(async move { inner.worker_loop(worker).await })
            })
            .collect();

        info!(concurrency, "Job queue started");
        Self {
            inner,
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    /// Validate and enqueue a submission. Returns the new job id.
    pub async fn enqueue(&self, payload: JobPayload) -> Result<Uuid, QueueError> {
        self.enqueue_with_id(Uuid::new_v4(), payload).await
    }

    /// Enqueue under a caller-chosen id (the Redis intake assigns ids before
    /// the job reaches this process).
    pub async fn enqueue_with_id(&self, id: Uuid, payload: JobPayload) -> Result<Uuid, QueueError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        let input = JobInput::try_from(payload)?;

        let now = Utc::now();
        {
            let mut jobs = self.inner.jobs.lock();
            // `shutdown` stops accepting under this lock.
            if !self.inner.accepting.load(Ordering::SeqCst) {
                return Err(QueueError::ShuttingDown);
            }
            if jobs.contains_key(&id) {
                return Err(QueueError::DuplicateId(id));
            }
            jobs.insert(
                id,
                JobSnapshot {
                    id,
                    input,
                    status: JobStatus::Waiting,
                    progress: progress::QUEUED,
                    attempts: 0,
                    result: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            if self.inner.waiting_tx.send(id).is_err() {
                jobs.remove(&id);
                return Err(QueueError::ShuttingDown);
            }
        }

        metrics::counter!("voucher_jobs_total").increment(1);
        self.inner.update_depth_gauge();
        self.inner.emit(JobEvent::Waiting(id));
        info!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    pub fn get_job_state(&self, id: Uuid) -> Option<JobSnapshot> {
        self.inner.jobs.lock().get(&id).cloned()
    }

    /// Snapshots of every job still held in memory.
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.inner.jobs.lock().values().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Number of jobs waiting for a worker.
    pub fn waiting_count(&self) -> usize {
        self.inner.waiting_count()
    }

    /// Drop a finished job from memory. Returns its final snapshot; active
    /// and waiting jobs are kept.
    pub fn forget(&self, id: Uuid) -> Option<JobSnapshot> {
        let mut jobs = self.inner.jobs.lock();
        match jobs.get(&id) {
            Some(job) if job.status.is_terminal() => jobs.remove(&id),
            _ => None,
        }
    }

    /// Wait until job `id` reaches a terminal state.
    pub async fn wait_for(&self, id: Uuid) -> Option<JobSnapshot> {
        let mut events = self.subscribe();
        loop {
            let snapshot = self.get_job_state(id)?;
            if snapshot.status.is_terminal() {
                return Some(snapshot);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return self.get_job_state(id),
            }
        }
    }

    /// Stop accepting jobs, let active jobs finish, fail waiting ones, then
    /// terminate the engine. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let was_accepting = {
            let _jobs = self.inner.jobs.lock();
            self.inner.accepting.swap(false, Ordering::SeqCst)
        };
        if was_accepting {
            info!("Job queue shutting down");
        }
        self.inner.stop.send_replace(true);

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Queue worker panicked");
            }
        }

        let abandoned: Vec<Uuid> = {
            let jobs = self.inner.jobs.lock();
            jobs.values()
                .filter(|j| j.status == JobStatus::Waiting)
                .map(|j| j.id)
                .collect()
        };
        for id in abandoned {
            self.inner.finish_failed(id, SHUTDOWN_REASON.to_string()).await;
        }

        self.inner.pipeline.engine().shutdown().await
    }
}

impl QueueInner {
    async fn worker_loop(self: Arc<Self>, worker: usize) {
        let mut stop = self.stop.subscribe();
        loop {
            if *stop.borrow() {
                break;
            }
            let next = {
                let mut rx = self.waiting_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = stop.changed() => None,
                    id = rx.recv() => id,
                }
            };
            let Some(id) = next else {
                break;
            };
            self.execute(id).await;
        }
        debug!(worker, "Queue worker stopped");
    }

    async fn execute(self: &Arc<Self>, id: Uuid) {
        let input = {
            let mut jobs = self.jobs.lock();
            let Some(job) = jobs.get_mut(&id) else {
                return;
            };
            if job.status != JobStatus::Waiting {
                return;
            }
            job.status = JobStatus::Active;
            job.attempts += 1;
            job.updated_at = Utc::now();
            job.input.clone()
        };
        self.update_depth_gauge();
        self.emit(JobEvent::Active(id));
        info!(job_id = %id, input = %input.as_ref_str(), "Processing job");

        let started = Instant::now();
        let on_progress = |p: u8| self.set_progress(id, p);
        let run = self.pipeline.run(id, &input, &on_progress);
        let outcome = tokio::time::timeout(self.settings.job_timeout, run).await;
        metrics::histogram!("voucher_job_processing_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(result)) => {
                self.finish_completed(id, result).await;
            }
            Ok(Err(e)) => {
                self.finish_failed(id, e.to_string()).await;
            }
            Err(_) => self.handle_stall(id).await,
        }
    }

    async fn handle_stall(self: &Arc<Self>, id: Uuid) {
        let attempts = self
            .jobs
            .lock()
            .get(&id)
            .map(|j| j.attempts)
            .unwrap_or_default();
        metrics::counter!("voucher_jobs_stalled").increment(1);
        self.emit(JobEvent::Stalled { id, attempts });

        let limit = self.settings.max_stalled_count;
        if attempts > limit || !self.accepting.load(Ordering::SeqCst) {
            let reason = format!(
                "job stalled: exceeded {}s timeout {} time(s)",
                self.settings.job_timeout.as_secs(),
                attempts
            );
            self.finish_failed(id, reason).await;
            return;
        }

        warn!(job_id = %id, attempts, limit, "Job stalled, requeueing");
        {
            let mut jobs = self.jobs.lock();
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Waiting;
                job.progress = progress::QUEUED;
                job.updated_at = Utc::now();
            }
        }
        if self.waiting_tx.send(id).is_err() {
            self.finish_failed(id, SHUTDOWN_REASON.to_string()).await;
            return;
        }
        self.update_depth_gauge();
        self.emit(JobEvent::Waiting(id));
    }

    fn set_progress(&self, id: Uuid, value: u8) {
        let changed = {
            let mut jobs = self.jobs.lock();
            match jobs.get_mut(&id) {
                Some(job) if job.status == JobStatus::Active && value > job.progress => {
                    job.progress = value;
                    job.updated_at = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(JobEvent::Progress(id, value));
        }
    }

    async fn finish_completed(&self, id: Uuid, result: JobOutcome) {
        let vouchers = result.vouchers.len();
        let Some(input) = self.transition(id, |job| {
            job.status = JobStatus::Completed;
            job.progress = progress::DONE;
            job.result = Some(result);
        }) else {
            return;
        };

        metrics::counter!("voucher_jobs_completed").increment(1);
        info!(job_id = %id, vouchers, "Job completed");
        self.emit(JobEvent::Completed(id));
        self.pipeline.discard_staged_input(&input).await;
    }

    async fn finish_failed(&self, id: Uuid, reason: String) {
        let Some(input) = self.transition(id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(reason.clone());
        }) else {
            return;
        };

        metrics::counter!("voucher_jobs_failed").increment(1);
        warn!(job_id = %id, reason = %reason, "Job failed");
        self.update_depth_gauge();
        self.emit(JobEvent::Failed { id, reason });
        self.pipeline.discard_staged_input(&input).await;
    }

    /// Apply a terminal transition unless the job is already terminal.
    /// Returns the job's input when the transition happened.
    fn transition(&self, id: Uuid, apply: impl FnOnce(&mut JobSnapshot)) -> Option<JobInput> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&id)?;
        if job.status.is_terminal() {
            return None;
        }
        apply(job);
        job.updated_at = Utc::now();
        Some(job.input.clone())
    }

    fn waiting_count(&self) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|j| j.status == JobStatus::Waiting)
            .count()
    }

    fn update_depth_gauge(&self) {
        metrics::gauge!("voucher_queue_depth").set(self.waiting_count() as f64);
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid job payload: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job {0} already exists")]
    DuplicateId(Uuid),

    #[error("Job queue is shutting down")]
    ShuttingDown,
}
