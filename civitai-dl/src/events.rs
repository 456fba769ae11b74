//! Structured progress events.
//!
//! The engine emits events to a caller-provided sink; the external CLI
//! and log sinks are the consumers. The library ships a tracing-backed
//! sink as the default and an in-memory sink for tests.

use std::sync::Mutex;
use std::time::Duration;

use crate::error::ErrorClass;
use crate::store::TaskKind;

/// Scheduling lanes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pipeline {
    Model,
    Image,
}

impl Pipeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Image => "image",
        }
    }

    /// Task kinds this pipeline draws.
    pub fn kinds(&self) -> &'static [TaskKind] {
        match self {
            Self::Model => TaskKind::MODEL_PIPELINE,
            Self::Image => TaskKind::IMAGE_PIPELINE,
        }
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating mode reported in `supervisor.mode_changed` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Both pipelines at their configured permits.
    Parallel,
    /// Both pipelines collapsed to one permit each.
    HybridSafe,
    /// No further work is claimed until an operator clears the halt.
    Halted,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::HybridSafe => "hybrid_safe",
            Self::Halted => "halted",
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured progress event.
#[derive(Clone, Debug)]
pub enum Event {
    DownloadStarted {
        task_id: String,
        kind: TaskKind,
        url: String,
        destination: String,
    },
    DownloadProgress {
        task_id: String,
        bytes_completed: u64,
        bytes_total: u64,
    },
    DownloadCompleted {
        task_id: String,
        bytes: u64,
        duration: Duration,
        throughput_mbps: f64,
    },
    DownloadFailed {
        task_id: String,
        error_class: ErrorClass,
        message: String,
        attempt: u32,
    },
    PipelineStats {
        pipeline: Pipeline,
        active: usize,
        queued: u64,
        throughput_mbps: f64,
        error_rate: f64,
        filter_accepted: u64,
        filter_rejected: u64,
    },
    ModeChanged {
        from: RunMode,
        to: RunMode,
        reason: String,
    },
    Critical {
        reason: String,
    },
}

/// Sink for structured events. Implementations must be cheap; emission
/// happens on the worker path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Default sink: forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        use tracing::{error, info};
        match event {
            Event::DownloadStarted {
                task_id,
                kind,
                url,
                destination,
            } => {
                info!(task_id = %task_id, kind = %kind, url = %url, destination = %destination, "download.started");
            }
            Event::DownloadProgress {
                task_id,
                bytes_completed,
                bytes_total,
            } => {
                tracing::trace!(task_id = %task_id, bytes_completed, bytes_total, "download.progress");
            }
            Event::DownloadCompleted {
                task_id,
                bytes,
                duration,
                throughput_mbps,
            } => {
                info!(
                    task_id = %task_id,
                    bytes,
                    duration_s = duration.as_secs_f64(),
                    throughput_mbps,
                    "download.completed"
                );
            }
            Event::DownloadFailed {
                task_id,
                error_class,
                message,
                attempt,
            } => {
                info!(task_id = %task_id, class = %error_class, message = %message, attempt, "download.failed");
            }
            Event::PipelineStats {
                pipeline,
                active,
                queued,
                throughput_mbps,
                error_rate,
                filter_accepted,
                filter_rejected,
            } => {
                info!(
                    pipeline = %pipeline,
                    active,
                    queued,
                    throughput_mbps,
                    error_rate,
                    filter_accepted,
                    filter_rejected,
                    "pipeline.stats"
                );
            }
            Event::ModeChanged { from, to, reason } => {
                info!(from = %from, to = %to, reason = %reason, "supervisor.mode_changed");
            }
            Event::Critical { reason } => {
                error!(reason = %reason, "supervisor.critical");
            }
        }
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &Event) {}
}

/// Collects events in memory; for tests and post-run inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event sink poisoned").clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &Event) {
        self.events.lock().expect("event sink poisoned").push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects_in_order() {
        let sink = MemorySink::new();
        sink.emit(&Event::Critical {
            reason: "one".into(),
        });
        sink.emit(&Event::Critical {
            reason: "two".into(),
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::Critical { reason } if reason == "one"));
    }

    #[test]
    fn test_pipeline_kinds_cover_all_task_kinds() {
        let total = Pipeline::Model.kinds().len() + Pipeline::Image.kinds().len();
        assert_eq!(total, 5);
    }
}
