//! Retry policy: per-class backoff schedules.
//!
//! Schedules (seconds):
//!
//! | class          | delays                                   |
//! |----------------|------------------------------------------|
//! | network        | 2, 5, 10, 30                             |
//! | timeout        | 5, 15, 30, 60                            |
//! | server_5xx     | 1, 3, 5, 10                              |
//! | rate_limit_429 | `Retry-After` if present, else 60, 120, 300, 600 |
//! | client_4xx     | no retry                                 |
//! | integrity      | up to 3 re-downloads, then quarantine (engine-owned) |
//! | unknown        | 1, 2, 4, 8                               |

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ErrorClass;

const NETWORK_SCHEDULE: &[u64] = &[2, 5, 10, 30];
const TIMEOUT_SCHEDULE: &[u64] = &[5, 15, 30, 60];
const SERVER_SCHEDULE: &[u64] = &[1, 3, 5, 10];
const RATE_LIMIT_SCHEDULE: &[u64] = &[60, 120, 300, 600];
const UNKNOWN_SCHEDULE: &[u64] = &[1, 2, 4, 8];

/// Maximum successive integrity failures before a task is quarantined.
pub const MAX_INTEGRITY_FAILURES: u32 = 3;

/// Attempt-bounded retry policy over the class schedules.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Maximum attempts per task, including the first.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Delay before the next attempt, given the class of the failure on
    /// `attempt` (1-based). `None` means the task must not be retried.
    ///
    /// `retry_after` is the server-declared delay from a 429 response and
    /// takes precedence over the rate-limit schedule.
    pub fn delay_after(
        &self,
        class: ErrorClass,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let schedule = match class {
            ErrorClass::Network => NETWORK_SCHEDULE,
            ErrorClass::Timeout => TIMEOUT_SCHEDULE,
            ErrorClass::Server5xx => SERVER_SCHEDULE,
            ErrorClass::RateLimit429 => {
                if let Some(declared) = retry_after {
                    return Some(declared);
                }
                RATE_LIMIT_SCHEDULE
            }
            ErrorClass::Client4xx => return None,
            // Integrity re-downloads are counted against
            // MAX_INTEGRITY_FAILURES by the engine, not this schedule.
            ErrorClass::Integrity => return None,
            ErrorClass::Unknown => UNKNOWN_SCHEDULE,
        };

        let index = ((attempt - 1) as usize).min(schedule.len() - 1);
        Some(Duration::from_secs(schedule[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig { max_attempts })
    }

    #[test]
    fn test_network_schedule_progression() {
        let p = policy(5);
        assert_eq!(
            p.delay_after(ErrorClass::Network, 1, None),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            p.delay_after(ErrorClass::Network, 4, None),
            Some(Duration::from_secs(30))
        );
        assert_eq!(p.delay_after(ErrorClass::Network, 5, None), None);
    }

    #[test]
    fn test_schedule_clamps_beyond_last_entry() {
        let p = policy(10);
        assert_eq!(
            p.delay_after(ErrorClass::Server5xx, 7, None),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_client_4xx_never_retries() {
        let p = policy(5);
        assert_eq!(p.delay_after(ErrorClass::Client4xx, 1, None), None);
    }

    #[test]
    fn test_retry_after_takes_precedence() {
        let p = policy(5);
        assert_eq!(
            p.delay_after(
                ErrorClass::RateLimit429,
                1,
                Some(Duration::from_secs(2))
            ),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            p.delay_after(ErrorClass::RateLimit429, 1, None),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_max_attempts_one_allows_no_retry() {
        let p = policy(1);
        assert_eq!(p.delay_after(ErrorClass::Network, 1, None), None);
    }
}
