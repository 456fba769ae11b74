//! Download Engine: executes a single task to a terminal outcome.
//!
//! Per-file algorithm:
//!
//! 1. Resolve and prepare the destination directory.
//! 2. Skip when the final file (or a digest-equal artifact anywhere in
//!    the tree) already exists.
//! 3. Resume a partial `.tmp` with a Range request; a 200 response
//!    truncates and restarts, a 206 appends.
//! 4. Stream chunks into the temp file, updating the SHA-256 state as
//!    bytes arrive, under the adaptive total timeout.
//! 5. On digest mismatch, quarantine the temp file; three integrity
//!    failures terminate the task as `quarantined`.
//! 6. On match, atomically rename `.tmp` to the final name.
//!
//! Classified retryable errors are handled entirely inside this module's
//! retry loop; they never bubble above the scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::config::DownloadConfig;
use crate::enumerate::Enumerator;
use crate::error::{EngineError, EngineResult, ErrorClass, ErrorRecord};
use crate::events::{Event, EventSink};
use crate::integrity::{digests_match, hash_file, quarantine, StreamingDigest};
use crate::planner::tmp_path;
use crate::store::{
    FileTaskPayload, ImageTaskPayload, MetadataTaskPayload, Task, TaskKind, TaskStatus, TaskStore,
};
use crate::transport::{HttpTransport, RetryPolicy, MAX_INTEGRITY_FAILURES};

/// Emit a progress event after roughly this many streamed bytes.
const PROGRESS_EVERY_BYTES: u64 = 1024 * 1024;

/// `skip_existing` only trusts pre-existing files above this size.
const SKIP_EXISTING_MIN_BYTES: u64 = 1024;

/// Backoffs at least this long go through the Task Store instead of
/// holding a worker slot asleep.
const REQUEUE_DELAY_MIN: Duration = Duration::from_secs(60);

/// Terminal result of one task execution.
#[derive(Debug)]
pub enum Outcome {
    Finished {
        status: TaskStatus,
        /// HTTP attempts consumed during this execution.
        attempts: u32,
        error: Option<(ErrorClass, String)>,
        bytes: u64,
    },
    /// A long backoff: the task should return to `pending`, eligible
    /// again after `delay`.
    Requeued {
        delay: Duration,
        attempts: u32,
        error: (ErrorClass, String),
    },
    /// The cancellation signal fired; partial state is preserved for
    /// resume and the task returns to `pending`.
    Cancelled,
}

impl Outcome {
    fn done(attempts: u32, bytes: u64) -> Self {
        Self::Finished {
            status: TaskStatus::Done,
            attempts,
            error: None,
            bytes,
        }
    }

    fn skipped() -> Self {
        Self::Finished {
            status: TaskStatus::Skipped,
            attempts: 0,
            error: None,
            bytes: 0,
        }
    }
}

/// What one transfer needs to know, independent of task kind.
#[derive(Clone, Debug)]
struct TransferSpec {
    url: String,
    dest: PathBuf,
    size_kb: f64,
    expected_sha256: Option<String>,
}

impl TransferSpec {
    fn declared_bytes(&self) -> u64 {
        (self.size_kb * 1024.0).round() as u64
    }
}

/// Executes tasks: file transfers and metadata fetches.
pub struct DownloadEngine {
    transport: Arc<HttpTransport>,
    store: Arc<TaskStore>,
    api: Arc<ApiClient>,
    enumerator: Arc<Enumerator>,
    events: Arc<dyn EventSink>,
    policy: RetryPolicy,
    corrupted_dir: PathBuf,
    resume_enabled: bool,
    skip_existing: bool,
}

impl DownloadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<HttpTransport>,
        store: Arc<TaskStore>,
        api: Arc<ApiClient>,
        enumerator: Arc<Enumerator>,
        events: Arc<dyn EventSink>,
        config: &DownloadConfig,
    ) -> Self {
        Self {
            transport,
            store,
            api,
            enumerator,
            events,
            policy: RetryPolicy::new(config.retry),
            corrupted_dir: config.corrupted_dir(),
            resume_enabled: config.resume.enabled,
            skip_existing: config.skip_existing,
        }
    }

    /// Runs one claimed task to its outcome.
    pub async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Outcome {
        match task.kind {
            TaskKind::MetadataFetch => self.execute_metadata(task, cancel).await,
            TaskKind::ModelFile => match task.payload_as::<FileTaskPayload>() {
                Ok(payload) => {
                    let spec = TransferSpec {
                        url: payload.url,
                        dest: payload.dest,
                        size_kb: payload.size_kb,
                        expected_sha256: payload.expected_sha256,
                    };
                    self.execute_transfer(task, spec, cancel).await
                }
                Err(e) => undecodable(task, e),
            },
            TaskKind::PreviewImage | TaskKind::GalleryImage | TaskKind::UserImage => {
                match task.payload_as::<ImageTaskPayload>() {
                    Ok(payload) => {
                        let spec = TransferSpec {
                            url: payload.url,
                            dest: payload.dest,
                            size_kb: 0.0,
                            expected_sha256: None,
                        };
                        self.execute_transfer(task, spec, cancel).await
                    }
                    Err(e) => undecodable(task, e),
                }
            }
        }
    }

    /// Fetches a model payload and expands it into further work.
    async fn execute_metadata(&self, task: &Task, cancel: &CancellationToken) -> Outcome {
        let payload: MetadataTaskPayload = match task.payload_as() {
            Ok(p) => p,
            Err(e) => return undecodable(task, e),
        };

        if cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            result = self.api.model(payload.model_id) => result,
        };

        match raw {
            Ok(raw) => match self.enumerator.expand_model(&raw).await {
                Ok(stats) => {
                    info!(
                        model_id = payload.model_id,
                        enqueued = stats.tasks_enqueued,
                        "metadata fetch expanded"
                    );
                    Outcome::done(1, 0)
                }
                Err(e) => Outcome::Finished {
                    status: TaskStatus::Failed,
                    attempts: 1,
                    error: Some((e.class(), e.to_string())),
                    bytes: 0,
                },
            },
            Err(e) => Outcome::Finished {
                status: TaskStatus::Failed,
                attempts: 1,
                error: Some((e.class(), e.to_string())),
                bytes: 0,
            },
        }
    }

    /// The transfer retry loop: transient classes follow the backoff
    /// schedules; integrity failures quarantine and re-download up to
    /// three times.
    async fn execute_transfer(
        &self,
        task: &Task,
        spec: TransferSpec,
        cancel: &CancellationToken,
    ) -> Outcome {
        if let Some(outcome) = match self.check_skippable(&spec) {
            Ok(o) => o,
            Err(e) => {
                return Outcome::Finished {
                    status: TaskStatus::Failed,
                    attempts: 0,
                    error: Some((e.class(), e.to_string())),
                    bytes: 0,
                }
            }
        } {
            return outcome;
        }

        self.events.emit(&Event::DownloadStarted {
            task_id: task.id.clone(),
            kind: task.kind,
            url: spec.url.clone(),
            destination: spec.dest.to_string_lossy().into_owned(),
        });

        // Attempts accumulate across requeues; continue counting from the
        // task's persisted attempt count.
        let base_attempts = task.attempts;
        let mut attempt: u32 = base_attempts + 1;
        let mut integrity_failures: u32 = 0;
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            match self.try_transfer(task, &spec, cancel).await {
                Ok(bytes) => {
                    self.transport.record_download_outcome(false);
                    if let Some(expected) = &spec.expected_sha256 {
                        if let Err(e) = self.store.record_artifact(expected, &spec.dest) {
                            warn!(error = %e, "failed to index artifact digest");
                        }
                    }
                    let duration = started.elapsed();
                    let throughput_mbps = if duration.as_secs_f64() > 0.0 {
                        (bytes as f64 * 8.0) / (duration.as_secs_f64() * 1_000_000.0)
                    } else {
                        0.0
                    };
                    self.events.emit(&Event::DownloadCompleted {
                        task_id: task.id.clone(),
                        bytes,
                        duration,
                        throughput_mbps,
                    });
                    return Outcome::done(attempt - base_attempts, bytes);
                }
                Err(EngineError::Cancelled) => return Outcome::Cancelled,
                Err(error) => {
                    let class = error.class();
                    self.transport
                        .record_download_outcome(class == ErrorClass::Timeout);
                    self.events.emit(&Event::DownloadFailed {
                        task_id: task.id.clone(),
                        error_class: class,
                        message: error.to_string(),
                        attempt,
                    });

                    if class == ErrorClass::Integrity {
                        integrity_failures += 1;
                        let tmp = tmp_path(&spec.dest);
                        if tmp.exists() {
                            if let Err(e) = quarantine(&tmp, &self.corrupted_dir, &task.id) {
                                warn!(error = %e, "quarantine move failed");
                            }
                        }
                        if integrity_failures >= MAX_INTEGRITY_FAILURES {
                            return Outcome::Finished {
                                status: TaskStatus::Quarantined,
                                attempts: attempt - base_attempts,
                                error: Some((class, error.to_string())),
                                bytes: 0,
                            };
                        }
                        attempt += 1;
                        continue;
                    }

                    let retry_after = match &error {
                        EngineError::RateLimited { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    match self.policy.delay_after(class, attempt, retry_after) {
                        Some(delay) if delay >= REQUEUE_DELAY_MIN => {
                            // Long backoff: hand the slot back and let the
                            // store defer the task.
                            return Outcome::Requeued {
                                delay,
                                attempts: attempt - base_attempts,
                                error: (class, error.to_string()),
                            };
                        }
                        Some(delay) => {
                            debug!(
                                task_id = %task.id,
                                attempt,
                                class = %class,
                                delay_s = delay.as_secs_f64(),
                                "transfer failed; backing off"
                            );
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => return Outcome::Cancelled,
                                _ = tokio::time::sleep(delay) => {}
                            }
                            attempt += 1;
                        }
                        None => {
                            let record =
                                ErrorRecord::new(&error, &spec.url, attempt, started.elapsed());
                            warn!(
                                task_id = %task.id,
                                class = %record.class,
                                resource = %record.resource,
                                attempt = record.attempt,
                                elapsed_s = record.elapsed.as_secs_f64(),
                                "task failed terminally"
                            );
                            return Outcome::Finished {
                                status: TaskStatus::Failed,
                                attempts: attempt - base_attempts,
                                error: Some((record.class, record.message)),
                                bytes: 0,
                            };
                        }
                    }
                }
            }
        }
    }

    /// Pre-flight skip checks: existing verified file, name-based skip,
    /// digest-equal artifact elsewhere in the tree.
    fn check_skippable(&self, spec: &TransferSpec) -> EngineResult<Option<Outcome>> {
        if let Some(parent) = spec.dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }

        if spec.dest.exists() {
            if let Some(expected) = &spec.expected_sha256 {
                let actual = hash_file(&spec.dest)?;
                if digests_match(&actual, expected) {
                    debug!(dest = %spec.dest.display(), "existing file verified; skipping");
                    self.store.record_artifact(expected, &spec.dest)?;
                    return Ok(Some(Outcome::done(0, 0)));
                }
                // Wrong content under the final name: re-download.
                std::fs::remove_file(&spec.dest)
                    .map_err(|e| EngineError::io(&spec.dest, e))?;
            } else if self.skip_existing {
                let len = spec
                    .dest
                    .metadata()
                    .map(|m| m.len())
                    .map_err(|e| EngineError::io(&spec.dest, e))?;
                if len > SKIP_EXISTING_MIN_BYTES {
                    return Ok(Some(Outcome::skipped()));
                }
            }
        }

        // Digest dedup across the whole destination root.
        if let Some(expected) = &spec.expected_sha256 {
            if let Some(existing) = self.store.artifact_path(expected)? {
                if existing != spec.dest && existing.exists() {
                    debug!(
                        existing = %existing.display(),
                        dest = %spec.dest.display(),
                        "digest already on disk; linking instead of downloading"
                    );
                    if std::fs::hard_link(&existing, &spec.dest).is_err() {
                        std::fs::copy(&existing, &spec.dest)
                            .map_err(|e| EngineError::io(&spec.dest, e))?;
                    }
                    return Ok(Some(Outcome::done(0, 0)));
                }
            }
        }

        Ok(None)
    }

    /// One HTTP attempt: open (possibly ranged), stream, verify, publish.
    async fn try_transfer(
        &self,
        task: &Task,
        spec: &TransferSpec,
        cancel: &CancellationToken,
    ) -> EngineResult<u64> {
        let tmp = tmp_path(&spec.dest);
        let declared = spec.declared_bytes();

        let mut digest = StreamingDigest::new();
        let mut offset = 0u64;

        if tmp.exists() {
            let len = tmp
                .metadata()
                .map(|m| m.len())
                .map_err(|e| EngineError::io(&tmp, e))?;
            let resumable =
                self.resume_enabled && len > 0 && (declared == 0 || len < declared);
            if resumable {
                digest.seed_from_file(&tmp)?;
                offset = len;
                debug!(task_id = %task.id, offset, "resuming partial download");
            } else {
                std::fs::remove_file(&tmp).map_err(|e| EngineError::io(&tmp, e))?;
            }
        }

        let total_timeout = self.transport.adaptive_total_timeout(spec.size_kb);
        let deadline = Instant::now() + total_timeout;

        let mut stream = self.transport.begin_download(&spec.url, offset).await?;

        if offset > 0 && !stream.resumed {
            // Server ignored the Range request: restart from zero.
            debug!(task_id = %task.id, "server returned 200 for ranged request; restarting");
            std::fs::remove_file(&tmp).map_err(|e| EngineError::io(&tmp, e))?;
            digest = StreamingDigest::new();
            offset = 0;
        }

        if let Some(declared_name) = &stream.declared_name {
            let planned = spec.dest.file_name().map(|n| n.to_string_lossy().into_owned());
            if planned.as_deref() != Some(declared_name.as_str()) {
                debug!(
                    task_id = %task.id,
                    declared = %declared_name,
                    "content-disposition name differs from planned name"
                );
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(offset > 0)
            .write(true)
            .truncate(offset == 0)
            .open(&tmp)
            .await
            .map_err(|e| EngineError::io(&tmp, e))?;

        // Images carry no declared size; fall back to Content-Length.
        let total_hint = if declared > 0 {
            declared
        } else {
            offset + stream.content_length.unwrap_or(0)
        };

        let mut written = offset;
        let mut since_progress = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Preserve the partial for resume.
                    let _ = file.flush().await;
                    return Err(EngineError::Cancelled);
                }
                chunk = tokio::time::timeout_at(deadline, stream.next_chunk()) => chunk,
            };

            match chunk {
                Err(_) => {
                    let _ = file.flush().await;
                    return Err(EngineError::Timeout {
                        url: spec.url.clone(),
                        elapsed: total_timeout,
                    });
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let _ = file.flush().await;
                    return Err(e);
                }
                Ok(Some(Ok(bytes))) => {
                    file.write_all(&bytes)
                        .await
                        .map_err(|e| EngineError::io(&tmp, e))?;
                    digest.update(&bytes);
                    written += bytes.len() as u64;
                    since_progress += bytes.len() as u64;

                    if since_progress >= PROGRESS_EVERY_BYTES {
                        since_progress = 0;
                        self.events.emit(&Event::DownloadProgress {
                            task_id: task.id.clone(),
                            bytes_completed: written,
                            bytes_total: total_hint,
                        });
                    }
                }
            }
        }

        file.flush().await.map_err(|e| EngineError::io(&tmp, e))?;
        drop(file);

        if declared > 0 && written < declared {
            // Short read; the partial stays for a ranged retry.
            return Err(EngineError::Network {
                url: spec.url.clone(),
                reason: format!("truncated response: {written} of {declared} bytes"),
            });
        }

        if let Some(expected) = &spec.expected_sha256 {
            let computed = digest.finalize();
            if !digests_match(&computed, expected) {
                return Err(EngineError::DigestMismatch {
                    file_name: spec
                        .dest
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    expected: expected.clone(),
                    actual: computed,
                });
            }
        }

        publish(&tmp, &spec.dest)?;
        Ok(written)
    }
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("resume_enabled", &self.resume_enabled)
            .field("skip_existing", &self.skip_existing)
            .finish()
    }
}

/// Atomic publish: rename within the destination directory.
fn publish(tmp: &Path, dest: &Path) -> EngineResult<()> {
    std::fs::rename(tmp, dest).map_err(|e| EngineError::io(dest, e))
}

fn undecodable(task: &Task, error: serde_json::Error) -> Outcome {
    warn!(task_id = %task.id, %error, "task payload undecodable");
    Outcome::Finished {
        status: TaskStatus::Failed,
        attempts: 0,
        error: Some((ErrorClass::Unknown, format!("payload: {error}"))),
        bytes: 0,
    }
}
