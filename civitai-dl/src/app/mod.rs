//! Batch runner: wires the components and runs a whole batch.
//!
//! Lifecycle: validate configuration, create the destination skeleton,
//! open the Task Store (resuming in-flight work), recover orphan
//! partials, enumerate inputs, run the scheduler, then flush state and
//! write the `failed.txt` summary.

use std::io::Write;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::ApiClient;
use crate::config::DownloadConfig;
use crate::engine::DownloadEngine;
use crate::enumerate::{inputs, Enumerator};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventSink, TracingSink};
use crate::filter::BaseModelFilter;
use crate::planner::{PathPlanner, TagTable};
use crate::ratelimit::RateGovernor;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::supervisor::{HaltReason, RecoverySupervisor};
use crate::transport::{HttpTransport, RetryPolicy};

/// Final outcome of a batch, mapped to the process exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every task reached `done` or `skipped`.
    Success,
    /// At least one task failed non-terminally; a re-run can resume.
    Resumable,
    /// Unrecoverable configuration or I/O error.
    Fatal,
    /// Halted by the emergency stop sentinel or the supervisor.
    Halted,
}

impl BatchOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Resumable => 1,
            Self::Fatal => 2,
            Self::Halted => 3,
        }
    }
}

/// Owns the component graph for one batch run.
pub struct BatchRunner {
    config: DownloadConfig,
    events: Arc<dyn EventSink>,
}

impl BatchRunner {
    pub fn new(config: DownloadConfig) -> Self {
        Self {
            config,
            events: Arc::new(TracingSink),
        }
    }

    /// Replaces the default tracing sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Runs the batch to completion (or halt/cancellation).
    ///
    /// The caller supplies the root cancellation token; a SIGINT handler
    /// typically cancels it.
    pub async fn run(&self, cancel: CancellationToken) -> BatchOutcome {
        match self.run_inner(&cancel).await {
            Ok(outcome) => outcome,
            Err(EngineError::Cancelled) => BatchOutcome::Resumable,
            Err(e @ EngineError::Halted(_)) => {
                error!(error = %e, "halted");
                BatchOutcome::Halted
            }
            Err(e @ (EngineError::InvalidConfig(_) | EngineError::Io { .. })) => {
                error!(error = %e, "unrecoverable error");
                BatchOutcome::Fatal
            }
            Err(e) => {
                error!(error = %e, "batch aborted");
                BatchOutcome::Resumable
            }
        }
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> EngineResult<BatchOutcome> {
        let config = &self.config;
        config.validate()?;
        config.ensure_layout()?;

        // Stale sentinel from a previous emergency stop keeps the batch
        // from ever starting; surface it instead of spinning.
        if config.emergency_stop_path().exists() {
            return Err(EngineError::Halted(format!(
                "emergency stop sentinel present at {}; remove it to continue",
                config.emergency_stop_path().display()
            )));
        }

        // --- init: process-wide singletons ---------------------------------
        let transport = Arc::new(HttpTransport::new(config)?);
        let governor = Arc::new(RateGovernor::new(
            config.rate,
            config.file_transfer_permits(),
        ));
        let store = Arc::new(TaskStore::open(&config.db_path())?);
        let planner = Arc::new(PathPlanner::new(config.root(), TagTable::default()));
        let filter = Arc::new(self.load_filter()?);
        let api = Arc::new(ApiClient::new(
            Arc::clone(&transport),
            Arc::clone(&governor),
            RetryPolicy::new(config.retry),
            config.api_base_url.clone(),
        ));
        let supervisor = Arc::new(RecoverySupervisor::new(
            Arc::clone(&governor),
            Arc::clone(&self.events),
        ));

        // --- crash recovery ------------------------------------------------
        let recovered = store.resume()?;
        if recovered > 0 {
            info!(recovered, "resumed interrupted run");
        }
        supervisor.recover_partials(&config.root(), &store)?;

        let enumerator = Arc::new(Enumerator::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&planner),
            Arc::clone(&filter),
            config,
        ));
        let engine = Arc::new(DownloadEngine::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            Arc::clone(&api),
            Arc::clone(&enumerator),
            Arc::clone(&self.events),
            config,
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            engine,
            Arc::clone(&governor),
            Arc::clone(&supervisor),
            Arc::clone(&self.events),
            Arc::clone(&filter),
            config.model_permits(),
            config.image_permits(),
            config.shutdown_grace,
        );

        let supervisor_handle = tokio::spawn(Arc::clone(&supervisor).run(
            config.emergency_stop_path(),
            cancel.clone(),
        ));

        // --- enumerate, then schedule --------------------------------------
        let enumeration = enumerator.enumerate(config, cancel).await;
        match &enumeration {
            Ok(stats) => info!(enqueued = stats.tasks_enqueued, "work persisted"),
            Err(EngineError::Cancelled) => {}
            Err(e) => warn!(error = %e, "enumeration incomplete"),
        }

        let run_result = if cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            scheduler.run(cancel).await
        };

        // --- shutdown ------------------------------------------------------
        cancel.cancel();
        let _ = supervisor_handle.await;
        store.flush()?;
        self.write_failure_summary(&store)?;

        if let Some(reason) = supervisor.halt_reason() {
            // Only the operator sentinel maps to the dedicated exit code;
            // rate-triggered halts leave a resumable store behind.
            return Ok(match reason {
                HaltReason::EmergencyStop => BatchOutcome::Halted,
                _ => BatchOutcome::Resumable,
            });
        }
        run_result?;
        enumeration?;

        let counts = store.counts()?;
        info!(
            done = counts.done,
            skipped = counts.skipped,
            failed = counts.failed,
            quarantined = counts.quarantined,
            pending = counts.pending,
            "batch finished"
        );

        if counts.failed > 0 || counts.quarantined > 0 || counts.pending > 0 {
            Ok(BatchOutcome::Resumable)
        } else {
            Ok(BatchOutcome::Success)
        }
    }

    /// Loads the base-model whitelist, when configured.
    fn load_filter(&self) -> EngineResult<BaseModelFilter> {
        match &self.config.base_model_filter_path {
            Some(path) => {
                let entries = inputs::parse_list_file(path)?;
                info!(count = entries.len(), "base-model filter active");
                Ok(BaseModelFilter::new(entries))
            }
            None => Ok(BaseModelFilter::inactive()),
        }
    }

    /// Machine-readable `failed.txt`: one `id<TAB>kind<TAB>class<TAB>message`
    /// line per failed or quarantined task.
    fn write_failure_summary(&self, store: &TaskStore) -> EngineResult<()> {
        let failures = store.failures()?;
        let path = self.config.failed_summary_path();

        if failures.is_empty() {
            // A stale summary from a previous run would be misleading.
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| EngineError::io(&path, e))?;
            }
            return Ok(());
        }

        let mut out = std::fs::File::create(&path).map_err(|e| EngineError::io(&path, e))?;
        for task in &failures {
            let class = task
                .error_class
                .map(|c| c.as_str())
                .unwrap_or("unknown");
            let message = task.error_message.as_deref().unwrap_or("");
            writeln!(
                out,
                "{}\t{}\t{}\t{}",
                task.id,
                task.kind,
                class,
                message.replace(['\t', '\n'], " ")
            )
            .map_err(|e| EngineError::io(&path, e))?;
        }
        info!(count = failures.len(), path = %path.display(), "failure summary written");
        Ok(())
    }
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(BatchOutcome::Success.exit_code(), 0);
        assert_eq!(BatchOutcome::Resumable.exit_code(), 1);
        assert_eq!(BatchOutcome::Fatal.exit_code(), 2);
        assert_eq!(BatchOutcome::Halted.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        // No inputs configured.
        let config = DownloadConfig {
            test_mode: true,
            ..DownloadConfig::default()
        };
        let runner = BatchRunner::new(config);
        let outcome = runner.run(CancellationToken::new()).await;
        assert_eq!(outcome, BatchOutcome::Fatal);
    }
}
