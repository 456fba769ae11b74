//! Rate Governor: token-bucket admission per logical channel.
//!
//! Each API channel owns a continuously-refilling token bucket; file
//! channels carry no per-request token cost but consume a shared
//! concurrency permit. Acquisition suspends the caller (no busy-wait)
//! until admission is possible.
//!
//! Adaptive feedback: after an HTTP 429 or 503 the affected channel's
//! refill rate is halved, then restored geometrically (x1.25 per minute
//! of clean traffic) up to its configured ceiling.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::config::RateConfig;

/// Geometric restore factor applied per minute of clean traffic.
const RESTORE_FACTOR: f64 = 1.25;

/// Penalty factor applied on 429/503 feedback.
const PENALTY_FACTOR: f64 = 0.5;

/// Floor below which a penalized rate will not drop.
const MIN_RATE: f64 = 0.01;

/// Logical rate-accounting channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Model metadata endpoints (`/models`, `/model-versions`).
    ModelApi,
    /// Image listing endpoints (`/images`).
    ImageApi,
    /// Model binary transfers.
    ModelFile,
    /// Preview/gallery/user image transfers.
    ImageFile,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelApi => "model-api",
            Self::ImageApi => "image-api",
            Self::ModelFile => "model-file",
            Self::ImageFile => "image-file",
        }
    }

    fn is_api(&self) -> bool {
        matches!(self, Self::ModelApi | Self::ImageApi)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A continuously-refilling token bucket with adaptive rate feedback.
#[derive(Debug)]
struct Bucket {
    /// Current refill rate (tokens/s); penalties pull this below `ceiling`.
    rate: f64,
    /// Configured refill rate the bucket is restored towards.
    ceiling: f64,
    burst: f64,
    tokens: f64,
    updated: Instant,
    /// Start of the current clean-traffic minute used for restoration.
    clean_since: Instant,
}

impl Bucket {
    fn new(rate: f64, burst: f64) -> Self {
        let now = Instant::now();
        Self {
            rate,
            ceiling: rate,
            burst,
            tokens: burst,
            updated: now,
            clean_since: now,
        }
    }

    /// Applies geometric restoration and continuous refill up to `now`.
    fn refill(&mut self, now: Instant) {
        while self.rate < self.ceiling
            && now.duration_since(self.clean_since) >= Duration::from_secs(60)
        {
            self.rate = (self.rate * RESTORE_FACTOR).min(self.ceiling);
            self.clean_since += Duration::from_secs(60);
        }
        if self.rate >= self.ceiling {
            // Fully restored; keep the clean mark fresh so a later penalty
            // starts a new accounting period.
            self.clean_since = now;
        }

        let elapsed = now.duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.updated = now;
    }

    /// Takes one token, or returns how long to wait until one exists.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate))
        }
    }

    fn penalize(&mut self, now: Instant) {
        self.rate = (self.rate * PENALTY_FACTOR).max(MIN_RATE);
        self.clean_since = now;
    }
}

/// Admission token returned by [`RateGovernor::acquire`].
///
/// Holding it represents an admitted request; for file channels it also
/// holds the shared transfer permit, released on drop.
#[derive(Debug)]
pub struct Admission {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Token-bucket admission for all four logical channels.
///
/// Process-wide singleton: constructed once at bootstrap and shared via
/// `Arc` by the scheduler, API client, and supervisor.
#[derive(Debug)]
pub struct RateGovernor {
    model_api: Mutex<Bucket>,
    image_api: Mutex<Bucket>,
    api_permits: Arc<Semaphore>,
    file_permits: Arc<Semaphore>,
}

impl RateGovernor {
    /// Builds the governor from the configured budgets.
    ///
    /// Bursts follow the channel defaults: model-api bursts 1, image-api
    /// bursts 4.
    pub fn new(rate: RateConfig, file_transfer_permits: usize) -> Self {
        Self {
            model_api: Mutex::new(Bucket::new(rate.model_api_rps, 1.0)),
            image_api: Mutex::new(Bucket::new(rate.image_api_rps, 4.0)),
            api_permits: Arc::new(Semaphore::new(rate.max_concurrent_api.max(1))),
            file_permits: Arc::new(Semaphore::new(file_transfer_permits.max(1))),
        }
    }

    /// Suspends until the channel admits one request.
    pub async fn acquire(&self, channel: Channel) -> Admission {
        if channel.is_api() {
            let permit = Arc::clone(&self.api_permits)
                .acquire_owned()
                .await
                .expect("governor API semaphore closed");
            loop {
                let wait = {
                    let mut bucket = self.bucket(channel).lock().await;
                    match bucket.try_take(Instant::now()) {
                        Ok(()) => None,
                        Err(wait) => Some(wait),
                    }
                };
                match wait {
                    None => return Admission { _permit: Some(permit) },
                    Some(wait) => sleep(wait).await,
                }
            }
        } else {
            let permit = Arc::clone(&self.file_permits)
                .acquire_owned()
                .await
                .expect("governor file semaphore closed");
            Admission { _permit: Some(permit) }
        }
    }

    /// Adaptive feedback after a 429/503 (or a supervisor timeout
    /// trigger): halves the channel's refill rate.
    pub async fn penalize(&self, channel: Channel) {
        if !channel.is_api() {
            return;
        }
        let mut bucket = self.bucket(channel).lock().await;
        bucket.penalize(Instant::now());
        debug!(channel = %channel, rate = bucket.rate, "rate penalized");
    }

    /// Current refill rate of an API channel (file channels report 0).
    pub async fn current_rate(&self, channel: Channel) -> f64 {
        if !channel.is_api() {
            return 0.0;
        }
        let mut bucket = self.bucket(channel).lock().await;
        bucket.refill(Instant::now());
        bucket.rate
    }

    fn bucket(&self, channel: Channel) -> &Mutex<Bucket> {
        match channel {
            Channel::ModelApi => &self.model_api,
            Channel::ImageApi => &self.image_api,
            Channel::ModelFile | Channel::ImageFile => {
                unreachable!("file channels are permit-based")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(model_rps: f64, image_rps: f64) -> RateGovernor {
        RateGovernor::new(
            RateConfig {
                model_api_rps: model_rps,
                image_api_rps: image_rps,
                max_concurrent_api: 4,
            },
            6,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill_spacing() {
        let gov = governor(1.0, 2.0);

        // Burst of 1 admits immediately.
        let start = Instant::now();
        gov.acquire(Channel::ModelApi).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Next admission waits ~1s for a fresh token.
        gov.acquire(Channel::ModelApi).await;
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admissions_bounded_by_rate_times_elapsed() {
        let gov = governor(2.0, 2.0);
        let start = Instant::now();

        let mut admitted = 0u32;
        while start.elapsed() < Duration::from_secs(5) {
            gov.acquire(Channel::ModelApi).await;
            admitted += 1;
        }

        // rate * elapsed + burst
        assert!(admitted <= 2 * 5 + 1, "admitted {} requests", admitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_penalty_halves_rate() {
        let gov = governor(2.0, 2.0);
        gov.penalize(Channel::ModelApi).await;
        assert_eq!(gov.current_rate(Channel::ModelApi).await, 1.0);
        gov.penalize(Channel::ModelApi).await;
        assert_eq!(gov.current_rate(Channel::ModelApi).await, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_geometric_restore_after_clean_minute() {
        let gov = governor(2.0, 2.0);
        gov.penalize(Channel::ModelApi).await;
        assert_eq!(gov.current_rate(Channel::ModelApi).await, 1.0);

        tokio::time::advance(Duration::from_secs(60)).await;
        let restored = gov.current_rate(Channel::ModelApi).await;
        assert!((restored - 1.25).abs() < 1e-9, "restored rate {}", restored);

        // Restoration never exceeds the ceiling.
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(gov.current_rate(Channel::ModelApi).await, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_channels_are_permit_based() {
        let gov = RateGovernor::new(RateConfig::default(), 2);

        let a = gov.acquire(Channel::ModelFile).await;
        let _b = gov.acquire(Channel::ImageFile).await;

        // Third acquisition blocks until a permit is released.
        let third = tokio::time::timeout(
            Duration::from_millis(100),
            gov.acquire(Channel::ModelFile),
        );
        assert!(third.await.is_err());

        drop(a);
        let third = tokio::time::timeout(
            Duration::from_millis(100),
            gov.acquire(Channel::ModelFile),
        );
        assert!(third.await.is_ok());
    }
}
