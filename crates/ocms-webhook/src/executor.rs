//! Outbound webhook delivery
//!
//! Performs one HTTP attempt for a queued delivery and classifies the
//! outcome into success, retryable failure or permanent failure.

use crate::{signature::WebhookSigner, Result, WebhookError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Request, Response, StatusCode, Url};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default `User-Agent` of outbound deliveries
pub const DEFAULT_USER_AGENT: &str = "oCMS/1.0";

/// HTTP client settings for deliveries
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Whole-request timeout
    pub request_timeout: Duration,
    /// Response bytes kept for the delivery record
    pub max_response_body: usize,
    /// Idle pooled connections kept per subscriber host
    pub pool_max_idle_per_host: usize,
    pub user_agent: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_response_body: 10 * 1024,
            pool_max_idle_per_host: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// A pending delivery joined with its webhook's target, ready to send
#[derive(Clone)]
pub struct QueuedItem {
    pub delivery_id: i64,
    pub webhook_id: i64,
    pub event_type: String,
    /// Serialized body, shared by every subscriber of one event
    pub payload: Arc<str>,
    /// Attempts already made before this one
    pub attempts: u32,
    pub url: String,
    pub secret: String,
    pub headers: BTreeMap<String, String>,
}

impl fmt::Debug for QueuedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedItem")
            .field("delivery_id", &self.delivery_id)
            .field("webhook_id", &self.webhook_id)
            .field("event_type", &self.event_type)
            .field("attempts", &self.attempts)
            .field("url", &self.url)
            .field("payload_bytes", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Outcome of a single delivery attempt
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub success: bool,
    /// Only meaningful when `success` is false
    pub should_retry: bool,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

impl AttemptResult {
    fn rejected(error: String, duration: Duration) -> Self {
        Self {
            success: false,
            should_retry: false,
            status_code: None,
            response_body: None,
            error: Some(error),
            duration,
        }
    }
}

/// Map an HTTP status to `(success, should_retry)`
pub fn classify_status(status: StatusCode) -> (bool, bool) {
    if status.is_success() {
        (true, false)
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        (false, true)
    } else {
        // 4xx, and anything else we do not understand, will not improve on retry
        (false, false)
    }
}

/// Sends signed webhook requests over a shared connection pool
#[derive(Clone)]
pub struct DeliveryExecutor {
    client: Client,
    config: ExecutorConfig,
}

impl DeliveryExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| WebhookError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Attempt a single delivery
    pub async fn execute(&self, item: &QueuedItem) -> AttemptResult {
        let started = Instant::now();

        let request = match self.build_request(item) {
            Ok(request) => request,
            Err(e) => return AttemptResult::rejected(e.to_string(), started.elapsed()),
        };

        match self.client.execute(request).await {
            Ok(response) => {
                let status = response.status();
                let response_body = read_capped(response, self.config.max_response_body).await;
                let (success, should_retry) = classify_status(status);

                debug!(
                    delivery_id = item.delivery_id,
                    webhook_id = item.webhook_id,
                    status_code = status.as_u16(),
                    "Webhook endpoint responded"
                );

                AttemptResult {
                    success,
                    should_retry,
                    status_code: Some(status.as_u16()),
                    response_body,
                    error: (!success).then(|| format!("HTTP {}", status)),
                    duration: started.elapsed(),
                }
            }
            Err(e) => AttemptResult {
                success: false,
                should_retry: true,
                status_code: None,
                response_body: None,
                error: Some(e.to_string()),
                duration: started.elapsed(),
            },
        }
    }

    /// Build the signed POST; custom headers may override the fixed ones
    fn build_request(&self, item: &QueuedItem) -> Result<Request> {
        let url = Url::parse(&item.url)
            .map_err(|e| WebhookError::InvalidUrl(format!("{}: {}", item.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(WebhookError::InvalidUrl(format!(
                "{}: unsupported scheme",
                item.url
            )));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, header_value(&self.config.user_agent)?);

        let signer = WebhookSigner::new(&item.secret);
        for (name, value) in signer.headers(item.payload.as_bytes(), &item.event_type, item.delivery_id) {
            headers.insert(name, header_value(&value)?);
        }

        for (name, value) in &item.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| WebhookError::InvalidHeader(name.clone()))?;
            headers.insert(name, header_value(value)?);
        }

        self.client
            .post(url)
            .headers(headers)
            .body(item.payload.to_string())
            .build()
            .map_err(|e| WebhookError::Http(e.to_string()))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| WebhookError::InvalidHeader(value.to_string()))
}

/// Read at most `cap` bytes of the response body
async fn read_capped(mut response: Response, cap: usize) -> Option<String> {
    let mut buf: Vec<u8> = Vec::new();

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = cap - buf.len();
                if chunk.len() >= remaining {
                    buf.extend_from_slice(&chunk[..remaining]);
                    break;
                }
                buf.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Failed to read webhook response body");
                break;
            }
        }
    }

    if buf.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&buf).into_owned())
    }
}
