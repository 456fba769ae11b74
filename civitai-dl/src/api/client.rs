//! Async API client: rate-governed, retrying, pagination-aware.
//!
//! Every request passes through the Rate Governor before touching the
//! transport. Paging errors are retried with the standard per-class
//! backoff; a 429 or 503 additionally penalizes the channel's rate.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::api::models::ListResponse;
use crate::error::{EngineError, EngineResult, ErrorClass};
use crate::ratelimit::{Channel, RateGovernor};
use crate::transport::{HttpTransport, RetryPolicy};

/// Page size requested from list endpoints.
const PAGE_LIMIT: u32 = 100;

/// Rate-governed client for the metadata endpoints.
#[derive(Debug)]
pub struct ApiClient {
    transport: Arc<HttpTransport>,
    governor: Arc<RateGovernor>,
    policy: RetryPolicy,
    base_url: String,
}

impl ApiClient {
    pub fn new(
        transport: Arc<HttpTransport>,
        governor: Arc<RateGovernor>,
        policy: RetryPolicy,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            governor,
            policy,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// All models of one user, fully paginated.
    pub async fn user_models(&self, username: &str) -> EngineResult<Vec<Value>> {
        let url = format!(
            "{}/models?username={}&limit={}&nsfw=true",
            self.base_url, username, PAGE_LIMIT
        );
        self.fetch_paginated(Channel::ModelApi, &url, None).await
    }

    /// One model by identifier.
    pub async fn model(&self, model_id: u64) -> EngineResult<Value> {
        let url = format!("{}/models/{model_id}", self.base_url);
        self.get_with_retry(Channel::ModelApi, &url).await
    }

    /// Gallery images posted for one model, capped at `max_items`.
    pub async fn model_images(&self, model_id: u64, max_items: usize) -> EngineResult<Vec<Value>> {
        let url = format!(
            "{}/images?modelId={model_id}&limit={}&nsfw=true",
            self.base_url, PAGE_LIMIT
        );
        self.fetch_paginated(Channel::ImageApi, &url, Some(max_items))
            .await
    }

    /// Images posted by one user, capped at `max_items`.
    pub async fn user_images(&self, username: &str, max_items: usize) -> EngineResult<Vec<Value>> {
        let url = format!(
            "{}/images?username={}&limit={}&nsfw=true",
            self.base_url, username, PAGE_LIMIT
        );
        self.fetch_paginated(Channel::ImageApi, &url, Some(max_items))
            .await
    }

    /// Walks a paginated endpoint, following `metadata.nextPage` (or the
    /// cursor / page counters) until exhaustion or `max_items`.
    async fn fetch_paginated(
        &self,
        channel: Channel,
        first_url: &str,
        max_items: Option<usize>,
    ) -> EngineResult<Vec<Value>> {
        let mut items: Vec<Value> = Vec::new();
        let mut url = first_url.to_string();

        loop {
            let value = self.get_with_retry(channel, &url).await?;
            let list: ListResponse =
                serde_json::from_value(value).map_err(|source| EngineError::Decode {
                    context: format!("list response from {url}"),
                    source,
                })?;

            if list.items.is_empty() {
                break;
            }
            items.extend(list.items);

            if let Some(cap) = max_items {
                if items.len() >= cap {
                    items.truncate(cap);
                    break;
                }
            }

            // nextPage is authoritative when present; cursors and page
            // counters are the older shapes of the same contract.
            if let Some(next) = list.metadata.next_page {
                url = next;
            } else if let Some(cursor) = list.metadata.next_cursor {
                url = format!("{first_url}&cursor={cursor}");
            } else if let (Some(current), Some(total)) =
                (list.metadata.current_page, list.metadata.total_pages)
            {
                if current >= total {
                    break;
                }
                let page = current + 1;
                url = format!("{first_url}&page={page}");
            } else {
                break;
            }
        }

        debug!(url = first_url, count = items.len(), "pagination complete");
        Ok(items)
    }

    /// One governed GET with the standard retry policy.
    async fn get_with_retry(&self, channel: Channel, url: &str) -> EngineResult<Value> {
        let mut attempt: u32 = 1;
        loop {
            let _admission = self.governor.acquire(channel).await;
            match self.transport.get_json(url).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let class = err.class();
                    if class == ErrorClass::RateLimit429
                        || matches!(&err, EngineError::Http { status: 503, .. })
                    {
                        self.governor.penalize(channel).await;
                    }

                    let retry_after = match &err {
                        EngineError::RateLimited { retry_after, .. } => *retry_after,
                        _ => None,
                    };

                    match self.policy.delay_after(class, attempt, retry_after) {
                        Some(delay) => {
                            warn!(
                                url,
                                attempt,
                                class = %class,
                                delay_s = delay.as_secs_f64(),
                                "API request failed; backing off"
                            );
                            sleep(delay).await;
                            attempt += 1;
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }
}
