//! Shared HTTP client with adaptive timeouts and range-resume support.
//!
//! One connection-pooled client serves the whole process. Timeouts are
//! split into connect (fixed), first-byte, and total; the total timeout
//! for a file transfer is computed adaptively from the declared size and
//! the recent timeout-failure rate.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_DISPOSITION, RANGE, RETRY_AFTER};
use reqwest::{redirect, Client, Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::config::{DownloadConfig, TimeoutConfig};
use crate::error::{EngineError, EngineResult};

/// Minimum idle connections kept per host.
const POOL_SIZE_PER_HOST: usize = 10;

/// Maximum redirects followed automatically.
const MAX_REDIRECTS: usize = 10;

/// Size of the rolling download-outcome window driving the adaptive
/// total timeout.
const FAILURE_WINDOW: usize = 100;

/// Process-wide HTTP transport.
pub struct HttpTransport {
    client: Client,
    timeouts: TimeoutConfig,
    /// Rolling record of recent downloads; `true` marks a timeout failure.
    window: Mutex<VecDeque<bool>>,
}

impl HttpTransport {
    /// Builds the shared client: pooled, keep-alive, product User-Agent,
    /// optional bearer credential on every request.
    pub fn new(config: &DownloadConfig) -> EngineResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.api_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                EngineError::InvalidConfig("api_token contains invalid header characters".into())
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .user_agent(DownloadConfig::user_agent())
            .default_headers(headers)
            .connect_timeout(config.timeouts.connect)
            .pool_max_idle_per_host(POOL_SIZE_PER_HOST)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| EngineError::Network {
                url: "<client construction>".into(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            timeouts: config.timeouts,
            window: Mutex::new(VecDeque::with_capacity(FAILURE_WINDOW)),
        })
    }

    /// GETs a JSON document. First-byte and a fixed total deadline apply.
    pub async fn get_json(&self, url: &str) -> EngineResult<Value> {
        let response = self.send_get(url, None).await?;
        let response = self.check_status(url, response).await?;

        let body = tokio::time::timeout(self.timeouts.total_base, response.bytes())
            .await
            .map_err(|_| EngineError::Timeout {
                url: url.to_string(),
                elapsed: self.timeouts.total_base,
            })?
            .map_err(|e| classify_reqwest(url, e))?;

        serde_json::from_slice(&body).map_err(|source| EngineError::Decode {
            context: format!("JSON body from {url}"),
            source,
        })
    }

    /// Opens a file download, optionally resuming from `offset` with a
    /// Range request. The caller drives the returned stream chunk by
    /// chunk under its own adaptive total deadline.
    pub async fn begin_download(&self, url: &str, offset: u64) -> EngineResult<DownloadStream> {
        let range = (offset > 0).then(|| format!("bytes={offset}-"));
        let response = self.send_get(url, range.as_deref()).await?;
        let response = self.check_status(url, response).await?;

        let status = response.status();
        let resumed = status == StatusCode::PARTIAL_CONTENT;
        let content_length = response.content_length();
        let declared_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition);

        debug!(
            url,
            status = status.as_u16(),
            resumed,
            content_length,
            "download stream opened"
        );

        Ok(DownloadStream {
            resumed,
            content_length,
            declared_name,
            url: url.to_string(),
            inner: Box::pin(response.bytes_stream()),
        })
    }

    /// Adaptive total timeout for a transfer of `size_kb` KiB:
    /// `max(base, size_MB * secs_per_mb * (1 + recent_failure_rate))`.
    pub fn adaptive_total_timeout(&self, size_kb: f64) -> Duration {
        let failure_rate = {
            let window = self.window.lock().expect("failure window poisoned");
            if window.is_empty() {
                0.0
            } else {
                window.iter().filter(|t| **t).count() as f64 / window.len() as f64
            }
        };

        let size_mb = size_kb / 1024.0;
        let adaptive = size_mb * self.timeouts.secs_per_mb * (1.0 + failure_rate);
        self.timeouts
            .total_base
            .max(Duration::from_secs_f64(adaptive.max(0.0)))
    }

    /// Records a finished download in the rolling failure window.
    pub fn record_download_outcome(&self, timed_out: bool) {
        let mut window = self.window.lock().expect("failure window poisoned");
        if window.len() == FAILURE_WINDOW {
            window.pop_front();
        }
        window.push_back(timed_out);
    }

    /// First-byte-bounded GET with optional Range header.
    async fn send_get(&self, url: &str, range: Option<&str>) -> EngineResult<Response> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        // `send` resolves when response headers arrive, so the deadline
        // here is the first-byte timeout.
        tokio::time::timeout(self.timeouts.first_byte, request.send())
            .await
            .map_err(|_| EngineError::Timeout {
                url: url.to_string(),
                elapsed: self.timeouts.first_byte,
            })?
            .map_err(|e| classify_reqwest(url, e))
    }

    /// Maps non-success statuses to classified errors, extracting
    /// `Retry-After` on 429.
    async fn check_status(&self, url: &str, response: Response) -> EngineResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(EngineError::RateLimited {
                url: url.to_string(),
                retry_after,
            });
        }

        Err(EngineError::Http {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

/// An open byte stream for one file transfer.
pub struct DownloadStream {
    /// True when the server honored the Range request (206).
    pub resumed: bool,
    /// `Content-Length` of this response (the remainder when resumed).
    pub content_length: Option<u64>,
    /// File name declared via `Content-Disposition`, when present.
    pub declared_name: Option<String>,
    url: String,
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
}

impl DownloadStream {
    /// Next chunk of the body, classified on error.
    pub async fn next_chunk(&mut self) -> Option<EngineResult<bytes::Bytes>> {
        self.inner
            .next()
            .await
            .map(|r| r.map_err(|e| classify_reqwest(&self.url, e)))
    }
}

/// Maps reqwest failures onto the retry taxonomy.
fn classify_reqwest(url: &str, error: reqwest::Error) -> EngineError {
    if error.is_timeout() {
        EngineError::Timeout {
            url: url.to_string(),
            elapsed: Duration::ZERO,
        }
    } else if let Some(status) = error.status() {
        EngineError::Http {
            status: status.as_u16(),
            url: url.to_string(),
        }
    } else {
        EngineError::Network {
            url: url.to_string(),
            reason: error.to_string(),
        }
    }
}

/// Extracts `filename=` from a `Content-Disposition` header value.
fn parse_content_disposition(value: &str) -> Option<String> {
    value.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("filename=")
            .map(|name| name.trim_matches('"').to_string())
            .filter(|name| !name.is_empty())
    })
}
