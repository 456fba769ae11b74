//! Scheduler: dual-pipeline dispatcher with bounded concurrency.
//!
//! Two logical pipelines run concurrently, each owning its own semaphore
//! so one pipeline's saturation can never stall the other:
//!
//! - **model**: `metadata-fetch` + `model-file` tasks
//! - **image**: `preview-image` + `gallery-image` + `user-image` tasks
//!
//! Per dispatch the driver (a) acquires a pipeline permit, (b) claims the
//! next eligible task FIFO from the store, (c) acquires the appropriate
//! Rate Governor admission, (d) runs the Download Engine on a worker
//! task, and (e) records the outcome. In hybrid safe mode an additional
//! single-permit gate serializes both pipelines.
//!
//! Cancellation: workers observe the token at their next I/O yield point,
//! temp files stay on disk for resume, and owned tasks return to
//! `pending`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{DownloadEngine, Outcome};
use crate::error::EngineResult;
use crate::events::{Event, EventSink, Pipeline};
use crate::filter::BaseModelFilter;
use crate::ratelimit::RateGovernor;
use crate::store::{Task, TaskKind, TaskStatus, TaskStore};
use crate::supervisor::RecoverySupervisor;

/// Idle poll interval when a pipeline finds no eligible task.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Cadence of `pipeline.stats` events.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// All task kinds, for whole-batch drain checks.
const ALL_KINDS: &[TaskKind] = &[
    TaskKind::MetadataFetch,
    TaskKind::ModelFile,
    TaskKind::PreviewImage,
    TaskKind::GalleryImage,
    TaskKind::UserImage,
];

/// Shared state each worker needs.
struct WorkerCtx {
    store: Arc<TaskStore>,
    engine: Arc<DownloadEngine>,
    governor: Arc<RateGovernor>,
    supervisor: Arc<RecoverySupervisor>,
    serial: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    bytes: Arc<AtomicU64>,
}

/// Dual-pipeline dispatcher.
pub struct Scheduler {
    store: Arc<TaskStore>,
    engine: Arc<DownloadEngine>,
    governor: Arc<RateGovernor>,
    supervisor: Arc<RecoverySupervisor>,
    events: Arc<dyn EventSink>,
    filter: Arc<BaseModelFilter>,
    model_permits: usize,
    image_permits: usize,
    /// Hybrid-safe-mode gate: both pipelines funnel through one permit.
    serial: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    bytes: Arc<AtomicU64>,
    /// How long workers get to wind down after cancellation.
    shutdown_grace: Duration,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        engine: Arc<DownloadEngine>,
        governor: Arc<RateGovernor>,
        supervisor: Arc<RecoverySupervisor>,
        events: Arc<dyn EventSink>,
        filter: Arc<BaseModelFilter>,
        model_permits: usize,
        image_permits: usize,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            governor,
            supervisor,
            events,
            filter,
            model_permits: model_permits.max(1),
            image_permits: image_permits.max(1),
            serial: Arc::new(Semaphore::new(1)),
            active: Arc::new(AtomicUsize::new(0)),
            bytes: Arc::new(AtomicU64::new(0)),
            shutdown_grace,
        }
    }

    /// Runs both pipelines until the store drains, the supervisor halts,
    /// or the token cancels.
    pub async fn run(&self, cancel: &CancellationToken) -> EngineResult<()> {
        info!(
            model_permits = self.model_permits,
            image_permits = self.image_permits,
            "scheduler starting"
        );

        let stats_cancel = cancel.child_token();
        let stats = self.spawn_stats_loop(stats_cancel.clone());

        let (model, image) = tokio::join!(
            self.drive(Pipeline::Model, self.model_permits, cancel),
            self.drive(Pipeline::Image, self.image_permits, cancel),
        );

        stats_cancel.cancel();
        let _ = stats.await;

        model?;
        image?;
        info!("scheduler stopped");
        Ok(())
    }

    /// One pipeline's claim/dispatch loop.
    async fn drive(
        &self,
        pipeline: Pipeline,
        permits: usize,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            if cancel.is_cancelled() || self.supervisor.is_halted() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("pipeline semaphore closed")
                }
            };

            let task = match self.store.claim(pipeline.kinds(), 1) {
                Ok(mut claimed) => claimed.pop(),
                Err(e) => {
                    error!(pipeline = %pipeline, error = %e, "claim failed");
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL) => continue,
                    }
                }
            };

            let Some(task) = task else {
                drop(permit);
                if self.is_drained()? {
                    debug!(pipeline = %pipeline, "pipeline drained");
                    break;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                }
            };

            self.active.fetch_add(1, Ordering::SeqCst);
            let ctx = self.worker_ctx();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = permit;
                Self::run_worker(ctx, task, cancel).await;
            });

            // Reap finished workers without blocking the claim loop.
            while workers.try_join_next().is_some() {}
        }

        // Workers observe cancellation at their next I/O yield point; the
        // grace period bounds how long a wedged transfer can delay exit.
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(pipeline = %pipeline, "workers exceeded shutdown grace; aborting");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        Ok(())
    }

    /// Executes one claimed task and records the outcome.
    async fn run_worker(ctx: WorkerCtx, task: Task, cancel: CancellationToken) {
        // Hybrid safe mode: both pipelines share one effective slot.
        let _serial = if ctx.supervisor.is_safe_mode() {
            match Arc::clone(&ctx.serial).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => None,
            }
        } else {
            None
        };

        // File transfers consume the shared transfer budget; metadata
        // fetches are admitted on the API channel inside the client.
        let channel = task.kind.file_channel();
        let _admission = match channel {
            Some(channel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    Self::record_release(&ctx, &task);
                    return;
                }
                admission = ctx.governor.acquire(channel) => Some(admission),
            },
            None => None,
        };

        let outcome = ctx.engine.execute(&task, &cancel).await;
        let sample_channel = channel.unwrap_or(crate::ratelimit::Channel::ModelApi);

        match outcome {
            Outcome::Finished {
                status,
                attempts,
                error,
                bytes,
            } => {
                ctx.bytes.fetch_add(bytes, Ordering::Relaxed);
                match status {
                    TaskStatus::Failed | TaskStatus::Quarantined => {
                        let class = error
                            .as_ref()
                            .map(|(class, _)| *class)
                            .unwrap_or(crate::error::ErrorClass::Unknown);
                        ctx.supervisor.record_failure(sample_channel, class);
                    }
                    _ => ctx.supervisor.record_success(sample_channel),
                }
                if let Err(e) = ctx.store.complete(&task.id, status, attempts, error) {
                    error!(task_id = %task.id, error = %e, "failed to record outcome");
                }
            }
            Outcome::Requeued {
                delay,
                attempts,
                error,
            } => {
                ctx.supervisor.record_failure(sample_channel, error.0);
                if let Err(e) = ctx.store.requeue(&task.id, delay, attempts, Some(error)) {
                    error!(task_id = %task.id, error = %e, "failed to requeue");
                }
            }
            Outcome::Cancelled => {
                Self::record_release(&ctx, &task);
            }
        }

        ctx.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_release(ctx: &WorkerCtx, task: &Task) {
        debug!(task_id = %task.id, "task cancelled; returning to pending");
        if let Err(e) = ctx.store.release(&task.id) {
            warn!(task_id = %task.id, error = %e, "failed to release task");
        }
        ctx.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// The batch is drained when nothing is open anywhere and no worker
    /// is still running (an in-flight metadata fetch can mint new work).
    fn is_drained(&self) -> EngineResult<bool> {
        if self.active.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        Ok(self.store.open_count(ALL_KINDS)? == 0)
    }

    fn worker_ctx(&self) -> WorkerCtx {
        WorkerCtx {
            store: Arc::clone(&self.store),
            engine: Arc::clone(&self.engine),
            governor: Arc::clone(&self.governor),
            supervisor: Arc::clone(&self.supervisor),
            serial: Arc::clone(&self.serial),
            active: Arc::clone(&self.active),
            bytes: Arc::clone(&self.bytes),
        }
    }

    /// Periodic `pipeline.stats` emission.
    fn spawn_stats_loop(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let events = Arc::clone(&self.events);
        let filter = Arc::clone(&self.filter);
        let supervisor = Arc::clone(&self.supervisor);
        let active = Arc::clone(&self.active);
        let bytes = Arc::clone(&self.bytes);

        tokio::spawn(async move {
            let mut last_bytes = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(STATS_INTERVAL) => {}
                }

                let total_bytes = bytes.load(Ordering::Relaxed);
                let throughput_mbps = ((total_bytes - last_bytes) as f64 * 8.0)
                    / (STATS_INTERVAL.as_secs_f64() * 1_000_000.0);
                last_bytes = total_bytes;

                let rates = supervisor.rates();
                let (filter_accepted, filter_rejected) = filter.stats();

                for pipeline in [Pipeline::Model, Pipeline::Image] {
                    let queued = store.open_count(pipeline.kinds()).unwrap_or(0);
                    events.emit(&Event::PipelineStats {
                        pipeline,
                        active: active.load(Ordering::SeqCst),
                        queued,
                        throughput_mbps,
                        error_rate: rates.error_rate,
                        filter_accepted,
                        filter_rejected,
                    });
                }
            }
        })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("model_permits", &self.model_permits)
            .field("image_permits", &self.image_permits)
            .finish()
    }
}
