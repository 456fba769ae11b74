//! Recovery Supervisor: failure-rate triggers and degraded modes.
//!
//! Observes task outcomes over a rolling one-minute window and reacts:
//!
//! - `timeout_rate > 1%`: halve the Rate Governor rate for the affected
//!   channel.
//! - `error_rate > 5%` for 3 consecutive minutes: hybrid safe mode (both
//!   pipelines sequential).
//! - `error_rate > 20%` in one minute, or 3 consecutive failures: emit a
//!   CRITICAL event and set `global_halt` until an operator clears it.
//!
//! It also owns startup recovery of orphan `.tmp` partials and the
//! emergency-stop sentinel poll (every 2 seconds).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineResult, ErrorClass};
use crate::events::{Event, EventSink, RunMode};
use crate::ratelimit::{Channel, RateGovernor};
use crate::store::TaskStore;

/// Rolling observation window.
const WINDOW: Duration = Duration::from_secs(60);

/// Sentinel poll cadence.
const EMERGENCY_POLL: Duration = Duration::from_secs(2);

/// Consecutive failures that force a global halt.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Elevated-error minutes before hybrid safe mode engages.
const SAFE_MODE_AFTER_MINUTES: u32 = 3;

const TIMEOUT_RATE_TRIGGER: f64 = 0.01;
const ELEVATED_ERROR_RATE: f64 = 0.05;
const CRITICAL_ERROR_RATE: f64 = 0.20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SampleOutcome {
    Success,
    Timeout,
    Failure,
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    at: Instant,
    outcome: SampleOutcome,
    channel: Channel,
}

/// Rates over the rolling window.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowRates {
    pub samples: usize,
    pub timeout_rate: f64,
    pub error_rate: f64,
}

/// Why the supervisor halted, when it did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HaltReason {
    EmergencyStop,
    ErrorRate(String),
    ConsecutiveFailures(u32),
}

impl HaltReason {
    pub fn describe(&self) -> String {
        match self {
            Self::EmergencyStop => "emergency stop sentinel present".to_string(),
            Self::ErrorRate(detail) => detail.clone(),
            Self::ConsecutiveFailures(n) => format!("{n} consecutive failures"),
        }
    }
}

/// Watches outcomes, flips modes, recovers partials.
pub struct RecoverySupervisor {
    window: Mutex<VecDeque<Sample>>,
    consecutive_failures: AtomicU32,
    elevated_minutes: AtomicU32,
    safe_mode: AtomicBool,
    halted: AtomicBool,
    halt_reason: Mutex<Option<HaltReason>>,
    governor: Arc<RateGovernor>,
    events: Arc<dyn EventSink>,
}

impl RecoverySupervisor {
    pub fn new(governor: Arc<RateGovernor>, events: Arc<dyn EventSink>) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            consecutive_failures: AtomicU32::new(0),
            elevated_minutes: AtomicU32::new(0),
            safe_mode: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
            governor,
            events,
        }
    }

    /// Records a successful task outcome.
    pub fn record_success(&self, channel: Channel) {
        self.push(SampleOutcome::Success, channel);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Records a failed task outcome; three in a row halt the run.
    pub fn record_failure(&self, channel: Channel, class: ErrorClass) {
        let outcome = if class == ErrorClass::Timeout {
            SampleOutcome::Timeout
        } else {
            SampleOutcome::Failure
        };
        self.push(outcome, channel);

        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= MAX_CONSECUTIVE_FAILURES {
            self.halt(HaltReason::ConsecutiveFailures(consecutive));
        }
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::Relaxed)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.halt_reason
            .lock()
            .expect("halt reason poisoned")
            .clone()
    }

    /// Current rolling-window rates.
    pub fn rates(&self) -> WindowRates {
        let mut window = self.window.lock().expect("window poisoned");
        Self::prune(&mut window);
        let samples = window.len();
        if samples == 0 {
            return WindowRates::default();
        }
        let timeouts = window
            .iter()
            .filter(|s| s.outcome == SampleOutcome::Timeout)
            .count();
        let failures = window
            .iter()
            .filter(|s| s.outcome != SampleOutcome::Success)
            .count();
        WindowRates {
            samples,
            timeout_rate: timeouts as f64 / samples as f64,
            error_rate: failures as f64 / samples as f64,
        }
    }

    /// Background loop: sentinel polling every 2 s, rate evaluation once
    /// a minute. Cancels `cancel` when a halt demands the whole batch
    /// stop.
    pub async fn run(
        self: Arc<Self>,
        emergency_stop: PathBuf,
        cancel: CancellationToken,
    ) {
        let mut next_evaluation = Instant::now() + WINDOW;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(EMERGENCY_POLL) => {}
            }

            if emergency_stop.exists() && !self.is_halted() {
                warn!(path = %emergency_stop.display(), "emergency stop sentinel detected");
                self.halt(HaltReason::EmergencyStop);
                cancel.cancel();
                return;
            }

            if self.is_halted() {
                cancel.cancel();
                return;
            }

            if Instant::now() >= next_evaluation {
                next_evaluation = Instant::now() + WINDOW;
                self.evaluate_minute().await;
            }
        }
    }

    /// One per-minute evaluation pass over the window.
    pub(crate) async fn evaluate_minute(&self) {
        let rates = self.rates();
        if rates.samples == 0 {
            return;
        }
        debug!(
            samples = rates.samples,
            timeout_rate = rates.timeout_rate,
            error_rate = rates.error_rate,
            "supervisor window"
        );

        if rates.timeout_rate > TIMEOUT_RATE_TRIGGER {
            for channel in self.timed_out_channels() {
                info!(channel = %channel, "timeout rate elevated; halving channel rate");
                self.governor.penalize(channel).await;
            }
        }

        if rates.error_rate > CRITICAL_ERROR_RATE {
            self.halt(HaltReason::ErrorRate(format!(
                "error rate {:.1}% over the last minute",
                rates.error_rate * 100.0
            )));
            return;
        }

        if rates.error_rate > ELEVATED_ERROR_RATE {
            let minutes = self.elevated_minutes.fetch_add(1, Ordering::Relaxed) + 1;
            if minutes >= SAFE_MODE_AFTER_MINUTES && !self.is_safe_mode() {
                self.safe_mode.store(true, Ordering::Relaxed);
                self.events.emit(&Event::ModeChanged {
                    from: RunMode::Parallel,
                    to: RunMode::HybridSafe,
                    reason: format!(
                        "error rate above {:.0}% for {minutes} consecutive minutes",
                        ELEVATED_ERROR_RATE * 100.0
                    ),
                });
            }
        } else {
            self.elevated_minutes.store(0, Ordering::Relaxed);
        }
    }

    /// Startup recovery: scan the destination tree for orphan `.tmp`
    /// files. Non-empty partials whose task is still open stay for
    /// resume; everything else is deleted.
    pub fn recover_partials(&self, root: &Path, store: &TaskStore) -> EngineResult<usize> {
        let open_dests = store.open_dest_paths()?;
        let mut removed = 0usize;
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
                    continue;
                }

                let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                let dest = path.with_extension("");
                let resumable = len > 0 && open_dests.contains(&dest);
                if resumable {
                    debug!(path = %path.display(), bytes = len, "keeping partial for resume");
                } else {
                    debug!(path = %path.display(), "purging orphan partial");
                    if std::fs::remove_file(&path).is_ok() {
                        removed += 1;
                    }
                }
            }
        }

        if removed > 0 {
            info!(removed, "purged orphan partials");
        }
        Ok(removed)
    }

    fn push(&self, outcome: SampleOutcome, channel: Channel) {
        let mut window = self.window.lock().expect("window poisoned");
        window.push_back(Sample {
            at: Instant::now(),
            outcome,
            channel,
        });
        Self::prune(&mut window);
    }

    fn prune(window: &mut VecDeque<Sample>) {
        let now = Instant::now();
        while let Some(front) = window.front() {
            if now.duration_since(front.at) > WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Channels that produced timeout samples inside the window.
    fn timed_out_channels(&self) -> Vec<Channel> {
        let window = self.window.lock().expect("window poisoned");
        let mut channels: Vec<Channel> = Vec::new();
        for sample in window.iter() {
            if sample.outcome == SampleOutcome::Timeout && !channels.contains(&sample.channel) {
                channels.push(sample.channel);
            }
        }
        channels
    }

    fn halt(&self, reason: HaltReason) {
        if self.halted.swap(true, Ordering::Relaxed) {
            return;
        }
        self.events.emit(&Event::Critical {
            reason: reason.describe(),
        });
        self.events.emit(&Event::ModeChanged {
            from: if self.is_safe_mode() {
                RunMode::HybridSafe
            } else {
                RunMode::Parallel
            },
            to: RunMode::Halted,
            reason: reason.describe(),
        });
        *self.halt_reason.lock().expect("halt reason poisoned") = Some(reason);
    }
}

impl std::fmt::Debug for RecoverySupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoverySupervisor")
            .field("safe_mode", &self.is_safe_mode())
            .field("halted", &self.is_halted())
            .finish()
    }
}
