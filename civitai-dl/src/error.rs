//! Error types and the retry taxonomy.
//!
//! Every failure the engine can observe is classified into an
//! [`ErrorClass`]; the class selects the backoff schedule (see
//! `transport::retry`) and decides whether a task is retried, failed
//! immediately, or quarantined.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Retry classification for engine errors.
///
/// The classes map one-to-one onto backoff schedules. `Client4xx` is never
/// retried; `Integrity` is handled by the Download Engine's quarantine
/// logic rather than the generic backoff path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection-level failures (DNS, refused, reset).
    Network,
    /// Any I/O deadline exceeded (connect, first byte, total).
    Timeout,
    /// HTTP 5xx from the server.
    Server5xx,
    /// HTTP 429; the channel rate is also penalized.
    RateLimit429,
    /// HTTP 4xx other than 429 (401, 403, 404, ...).
    Client4xx,
    /// Computed digest did not match the declared digest.
    Integrity,
    /// Anything that defies classification.
    Unknown,
}

impl ErrorClass {
    /// Stable lowercase name used in the Task Store and failure reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Server5xx => "server_5xx",
            Self::RateLimit429 => "rate_limit_429",
            Self::Client4xx => "client_4xx",
            Self::Integrity => "integrity",
            Self::Unknown => "unknown",
        }
    }

    /// Parses the stable name back into a class.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "network" => Some(Self::Network),
            "timeout" => Some(Self::Timeout),
            "server_5xx" => Some(Self::Server5xx),
            "rate_limit_429" => Some(Self::RateLimit429),
            "client_4xx" => Some(Self::Client4xx),
            "integrity" => Some(Self::Integrity),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Whether the generic retry loop may re-attempt this class at all.
    ///
    /// Integrity is "retryable" in the sense that up to three re-downloads
    /// are attempted before quarantine, but it takes the dedicated path in
    /// the Download Engine, not the backoff schedule.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Client4xx)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the download engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Connection-level HTTP failure.
    #[error("request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    /// A configured or adaptive deadline elapsed.
    #[error("request to {url} timed out after {elapsed:?}")]
    Timeout { url: String, elapsed: Duration },

    /// Non-success HTTP status.
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    /// HTTP 429 with the server's requested delay, when declared.
    #[error("rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },

    /// Streamed digest did not match the declared digest.
    #[error("digest mismatch for {file_name}: expected {expected}, got {actual}")]
    DigestMismatch {
        file_name: String,
        expected: String,
        actual: String,
    },

    /// Filesystem failure at a known path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Task Store failure.
    #[error("task store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Malformed or unexpectedly shaped JSON payload.
    #[error("failed to decode {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid configuration detected at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation observed the cancellation signal.
    #[error("operation cancelled")]
    Cancelled,

    /// The supervisor raised `global_halt` (or the emergency-stop sentinel
    /// appeared) and no further work may be claimed.
    #[error("halted: {0}")]
    Halted(String),
}

impl EngineError {
    /// Classifies this error for retry purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network { .. } => ErrorClass::Network,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Http { status, .. } if *status == 429 => ErrorClass::RateLimit429,
            Self::Http { status, .. } if (500..600).contains(status) => ErrorClass::Server5xx,
            Self::Http { status, .. } if (400..500).contains(status) => ErrorClass::Client4xx,
            Self::RateLimited { .. } => ErrorClass::RateLimit429,
            Self::DigestMismatch { .. } => ErrorClass::Integrity,
            Self::Io { .. } => ErrorClass::Unknown,
            _ => ErrorClass::Unknown,
        }
    }

    /// Convenience constructor for filesystem errors.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A recorded failure, as persisted with the task and written to the
/// `failed.txt` summary.
#[derive(Clone, Debug)]
pub struct ErrorRecord {
    pub class: ErrorClass,
    pub message: String,
    /// Endpoint or resource the failure occurred against.
    pub resource: String,
    /// 1-based attempt number that produced this failure.
    pub attempt: u32,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(
        error: &EngineError,
        resource: impl Into<String>,
        attempt: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            class: error.class(),
            message: error.to_string(),
            resource: resource.into(),
            attempt,
            elapsed,
            timestamp: Utc::now(),
        }
    }
}
