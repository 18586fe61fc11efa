//! Import batch queue
//!
//! In-process priority queue with a bounded worker pool:
//! - Jobs are dispatched highest priority first, FIFO within a priority
//! - At most `concurrency` jobs run at once (semaphore permits)
//! - Failed jobs are retried with exponential backoff, then dead-lettered
//! - Follow-up jobs returned by a handler are enqueued on success
//!
//! `ImportQueue` owns the queue lifecycle: it is built lazily on first use,
//! shared by every caller, and can be shut down and built again.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ImportError, ImportResult};
use crate::services::job_records::JobRecords;
use crate::types::{
    JobHandle, JobOptions, JobOutcome, JobPayload, JobRecord, JobState, QueueOverview, QueueStats,
};

/// Executes queued jobs
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &JobPayload) -> anyhow::Result<JobOutcome>;
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of jobs running at once
    pub concurrency: usize,
    /// Terminal job records older than this are pruned
    pub record_max_age: chrono::Duration,
    /// Upper bound on retained job records
    pub max_records: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            record_max_age: chrono::Duration::hours(24),
            max_records: 1000,
        }
    }
}

struct PendingJob {
    id: Uuid,
    seq: u64,
    payload: JobPayload,
    opts: JobOptions,
}

impl PartialEq for PendingJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PendingJob {}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingJob {
    // Max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.opts
            .priority
            .cmp(&other.opts.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    pending: Mutex<BinaryHeap<PendingJob>>,
    next_seq: AtomicU64,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    records: JobRecords,
    handler: Arc<dyn JobHandler>,
    /// Jobs not yet terminal: pending, running or waiting for a retry
    outstanding: watch::Sender<usize>,
    shutdown: CancellationToken,
}

impl Shared {
    fn enqueue(&self, payload: JobPayload, opts: JobOptions) -> ImportResult<JobHandle> {
        if self.shutdown.is_cancelled() {
            return Err(ImportError::QueueUnavailable(
                "queue is shutting down".to_string(),
            ));
        }
        payload.validate().map_err(ImportError::InvalidJob)?;

        let id = Uuid::new_v4();
        let handle = JobHandle {
            job_id: id,
            job_type: payload.type_name().to_string(),
        };
        self.records.insert(JobRecord::new(id, &payload, &opts));
        self.outstanding.send_modify(|n| *n += 1);

        debug!(
            job_id = %id,
            connection_id = %payload.connection_id(),
            batch_index = ?payload.batch_index(),
            "Enqueued {} job",
            handle.job_type
        );

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().push(PendingJob {
            id,
            seq,
            payload,
            opts,
        });
        self.notify.notify_one();

        Ok(handle)
    }

    fn finish(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn discard(&self, job: &PendingJob, reason: &str) {
        warn!(
            job_id = %job.id,
            connection_id = %job.payload.connection_id(),
            batch_index = ?job.payload.batch_index(),
            "Discarding {} job: {}",
            job.payload.type_name(),
            reason
        );
        self.records.remove(job.id);
        self.finish();
    }
}

/// Running queue instance
pub struct BatchQueue {
    shared: Arc<Shared>,
    concurrency: usize,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BatchQueue {
    /// Build the queue and spawn its dispatcher on the current runtime
    pub fn start(handler: Arc<dyn JobHandler>, config: &QueueConfig) -> ImportResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ImportError::QueueUnavailable(e.to_string()))?;

        let concurrency = config.concurrency.max(1);
        let (outstanding, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            pending: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            notify: Notify::new(),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            records: JobRecords::new(config.record_max_age, config.max_records),
            handler,
            outstanding,
            shutdown: CancellationToken::new(),
        });

        let dispatcher = runtime.spawn(dispatch_loop(shared.clone()));
        info!("Import queue started (concurrency {})", concurrency);

        Ok(Self {
            shared,
            concurrency,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Validate and schedule a job
    pub fn enqueue(&self, payload: JobPayload, opts: JobOptions) -> ImportResult<JobHandle> {
        self.shared.enqueue(payload, opts)
    }

    /// Withdraw jobs that have not started yet. Returns how many were
    /// removed; running jobs and jobs waiting out a backoff are left alone.
    pub fn cancel_pending(&self, job_ids: &[Uuid]) -> usize {
        let withdrawn: Vec<PendingJob> = {
            let mut pending = self.shared.pending.lock();
            let (withdrawn, kept): (Vec<PendingJob>, Vec<PendingJob>) =
                pending.drain().partition(|job| job_ids.contains(&job.id));
            pending.extend(kept);
            withdrawn
        };
        for job in &withdrawn {
            self.shared.discard(job, "withdrawn before start");
        }
        withdrawn.len()
    }

    #[cfg(test)]
    pub fn record(&self, job_id: Uuid) -> Option<JobRecord> {
        self.shared.records.get(job_id)
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.records.stats()
    }

    pub fn dead_letters(&self) -> Vec<JobRecord> {
        self.shared.records.dead_letters()
    }

    pub fn overview(&self) -> QueueOverview {
        self.shared.records.prune();
        QueueOverview {
            stats: self.stats(),
            dead_letters: self.dead_letters(),
        }
    }

    /// Resolves once no job is pending, running or waiting for a retry
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop dispatching, wait for running jobs and drop whatever is left
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                warn!("Import queue dispatcher ended abnormally: {}", e);
            }
        }

        // Running jobs hold permits; taking all of them means none is left
        match self.shared.semaphore.acquire_many(self.concurrency as u32).await {
            Ok(permits) => permits.forget(),
            Err(e) => warn!("Import queue semaphore closed early: {}", e),
        }

        let leftover: Vec<PendingJob> = self.shared.pending.lock().drain().collect();
        if !leftover.is_empty() {
            warn!("Dropping {} pending jobs on shutdown", leftover.len());
        }
        for job in &leftover {
            self.shared.discard(job, "queue shut down");
        }

        self.shared.semaphore.close();
        info!("Import queue stopped");
    }
}

async fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        let permit = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            permit = shared.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = loop {
            let next = shared.pending.lock().pop();
            if let Some(job) = next {
                break Some(job);
            }
            tokio::select! {
                _ = shared.shutdown.cancelled() => break None,
                _ = shared.notify.notified() => {}
            }
        };

        let Some(job) = job else { break };
        tokio::spawn(run_job(shared.clone(), job, permit));
    }
    debug!("Import queue dispatcher stopped");
}

async fn run_job(shared: Arc<Shared>, job: PendingJob, permit: OwnedSemaphorePermit) {
    let attempt = shared
        .records
        .update(job.id, |r| {
            r.state = JobState::Running;
            r.attempts += 1;
        })
        .map(|r| r.attempts)
        .unwrap_or(1);

    let result = shared.handler.handle(&job.payload).await;
    drop(permit);

    match result {
        Ok(outcome) => {
            if let Some((payload, opts)) = outcome.follow_up {
                if let Err(e) = shared.enqueue(payload, opts) {
                    error!(
                        job_id = %job.id,
                        connection_id = %job.payload.connection_id(),
                        "Failed to enqueue follow-up job: {}",
                        e
                    );
                }
            }

            if job.opts.remove_on_complete {
                shared.records.remove(job.id);
            } else {
                shared.records.update(job.id, |r| {
                    r.state = JobState::Completed;
                    r.processed = Some(outcome.processed);
                    r.finished_at = Some(Utc::now());
                });
            }

            debug!(
                job_id = %job.id,
                connection_id = %job.payload.connection_id(),
                batch_index = ?job.payload.batch_index(),
                "Job completed ({} processed)",
                outcome.processed
            );
            shared.finish();
        }
        Err(e) if attempt < job.opts.attempts => {
            let delay = job.opts.backoff_for(attempt);
            shared.records.update(job.id, |r| {
                r.state = JobState::Retrying;
                r.last_error = Some(format!("{:#}", e));
            });
            warn!(
                job_id = %job.id,
                connection_id = %job.payload.connection_id(),
                batch_index = ?job.payload.batch_index(),
                "Job attempt {}/{} failed, retrying in {:?}: {:#}",
                attempt,
                job.opts.attempts,
                delay,
                e
            );
            retry_after(shared, job, delay).await;
        }
        Err(e) => {
            shared.records.update(job.id, |r| {
                r.state = JobState::DeadLettered;
                r.last_error = Some(format!("{:#}", e));
                r.finished_at = Some(Utc::now());
            });
            error!(
                job_id = %job.id,
                connection_id = %job.payload.connection_id(),
                batch_index = ?job.payload.batch_index(),
                "Job dead-lettered after {} attempts: {:#}",
                attempt,
                e
            );
            shared.finish();
        }
    }
}

async fn retry_after(shared: Arc<Shared>, job: PendingJob, delay: std::time::Duration) {
    tokio::select! {
        _ = shared.shutdown.cancelled() => {
            shared.discard(&job, "queue shut down during backoff");
            return;
        }
        _ = tokio::time::sleep(delay) => {}
    }

    let mut pending = shared.pending.lock();
    // Checked under the lock so shutdown's drain cannot miss this job
    if shared.shutdown.is_cancelled() {
        drop(pending);
        shared.discard(&job, "queue shut down during backoff");
        return;
    }
    shared.records.update(job.id, |r| r.state = JobState::Queued);
    pending.push(job);
    drop(pending);
    shared.notify.notify_one();
}

/// Lifecycle of the shared import queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
}

/// Lazily started, shared import queue
pub struct ImportQueue {
    handler: Arc<dyn JobHandler>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    slot: tokio::sync::Mutex<Option<Arc<BatchQueue>>>,
}

impl ImportQueue {
    pub fn new(handler: Arc<dyn JobHandler>, config: QueueConfig) -> Self {
        Self {
            handler,
            config,
            state: Mutex::new(QueueState::Uninitialized),
            slot: tokio::sync::Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> QueueState {
        *self.state.lock()
    }

    /// Running queue, starting it on first use. Concurrent callers wait for
    /// the first one and receive the same instance.
    pub async fn get_or_init(&self) -> ImportResult<Arc<BatchQueue>> {
        let mut slot = self.slot.lock().await;
        if let Some(queue) = slot.as_ref() {
            return Ok(queue.clone());
        }

        *self.state.lock() = QueueState::Initializing;
        match BatchQueue::start(self.handler.clone(), &self.config) {
            Ok(queue) => {
                let queue = Arc::new(queue);
                *slot = Some(queue.clone());
                *self.state.lock() = QueueState::Ready;
                Ok(queue)
            }
            Err(e) => {
                *self.state.lock() = QueueState::Uninitialized;
                error!("Failed to start import queue: {}", e);
                Err(e)
            }
        }
    }

    /// Running queue if one exists, without starting it
    pub async fn current(&self) -> Option<Arc<BatchQueue>> {
        self.slot.lock().await.clone()
    }

    /// Stop the running queue, if any. A later `get_or_init` starts a new one.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        let Some(queue) = slot.take() else {
            return;
        };

        *self.state.lock() = QueueState::ShuttingDown;
        queue.shutdown().await;
        *self.state.lock() = QueueState::Uninitialized;
    }
}
