// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::ForwarderConfig;
use crate::errors::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const API_KEY_HEADER: &str = "DD-API-KEY";

/// Classification of one transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    /// Resending the same payload could plausibly succeed.
    Retryable(String),
    /// The intake rejected the payload; retrying will not help.
    Fatal(String),
}

/// Terminal disposition of one batch after the retry loop resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDisposition {
    Sent { attempts: u32 },
    DroppedFatal,
    DroppedRetriesExhausted,
}

/// Injected capability that moves one payload to the backend and reports an
/// HTTP-equivalent status, or a transport-level error.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, body: Bytes, headers: &HeaderMap) -> Result<StatusCode, TransportError>;
}

/// [`Transport`] backed by reqwest, with optional HTTPS proxy and a
/// per-request timeout.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ForwarderConfig) -> Result<Self, TransportError> {
        let client = build_client(config.https_proxy.as_deref(), config.request_timeout)
            .map_err(|error| TransportError::Other(error.to_string()))?;
        Ok(HttpTransport {
            client,
            url: config.intake_url.clone(),
            request_timeout: config.request_timeout,
        })
    }
}

/// Builds a reqwest client with optional proxy configuration and timeout.
/// Uses rustls TLS by default.
fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, body: Bytes, headers: &HeaderMap) -> Result<StatusCode, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .headers(headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|error| classify_reqwest_error(&error, self.request_timeout))?;
        Ok(response.status())
    }
}

fn classify_reqwest_error(error: &reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else if error.is_connect() {
        TransportError::Connection(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

/// Classifies an HTTP-equivalent status: rate-limit and server errors are
/// retryable, any other client error is fatal.
pub fn classify_status(status: StatusCode) -> SendOutcome {
    if status.is_success() {
        return SendOutcome::Success;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return SendOutcome::Retryable(format!("intake rate limited ({status})"));
    }
    if status.is_client_error() {
        return SendOutcome::Fatal(format!("intake rejected payload ({status})"));
    }
    SendOutcome::Retryable(format!("intake unavailable ({status})"))
}

const BACKOFF_MULTIPLIER: f64 = 2.0;
const JITTER_FACTOR: f64 = 0.2;

/// Tracks the state of the exponential backoff between attempts of one
/// batch. Private per in-flight batch; nothing is shared across batches.
#[derive(Debug)]
pub struct BackoffState {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl BackoffState {
    pub fn new(base: Duration, max: Duration) -> Self {
        BackoffState {
            base,
            max,
            attempt: 0,
        }
    }

    /// Registers a failed attempt and returns the delay before the next one.
    ///
    /// The delay doubles per attempt and caps at `max`; a +/-20% jitter is
    /// applied after the cap so simultaneous instances drift apart.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let exponent = self.attempt.saturating_sub(1).min(32) as i32;
        let raw_ms = self.base.as_millis() as f64 * BACKOFF_MULTIPLIER.powi(exponent);
        let capped_ms = raw_ms.min(self.max.as_millis() as f64);
        let jitter = capped_ms * JITTER_FACTOR * (rand::random::<f64>() * 2.0 - 1.0);
        Duration::from_millis((capped_ms + jitter).max(1.0) as u64)
    }
}

/// Delivers encoded batches to the intake and resolves every failure
/// internally: the caller only ever sees a [`BatchDisposition`].
pub struct LogSender {
    transport: Arc<dyn Transport>,
    headers: HeaderMap,
    max_send_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl LogSender {
    pub fn new(transport: Arc<dyn Transport>, config: &ForwarderConfig) -> Self {
        LogSender {
            transport,
            headers: intake_headers(config),
            max_send_attempts: config.max_send_attempts,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }

    /// Sends one payload, retrying retryable failures up to the configured
    /// attempt budget. The payload is never reordered or split; failures
    /// surface only through the disposition and the diagnostics log.
    pub async fn send(&self, body: Bytes) -> BatchDisposition {
        let mut backoff = BackoffState::new(self.backoff_base, self.backoff_max);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let outcome = match self.transport.post(body.clone(), &self.headers).await {
                Ok(status) => classify_status(status),
                Err(error) => SendOutcome::Retryable(error.to_string()),
            };
            match outcome {
                SendOutcome::Success => {
                    debug!(attempts, "batch accepted by intake");
                    return BatchDisposition::Sent { attempts };
                }
                SendOutcome::Fatal(reason) => {
                    error!(attempts, "dropping batch: {reason}");
                    return BatchDisposition::DroppedFatal;
                }
                SendOutcome::Retryable(reason) => {
                    if attempts >= self.max_send_attempts {
                        error!(attempts, "dropping batch after exhausting retries: {reason}");
                        return BatchDisposition::DroppedRetriesExhausted;
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        attempts,
                        "retrying batch in {}ms: {reason}",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn intake_headers(config: &ForwarderConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(api_key) = &config.api_key {
        match HeaderValue::from_str(api_key) {
            Ok(value) => {
                headers.insert(API_KEY_HEADER, value);
            }
            Err(_) => warn!("API key contains invalid header characters; sending without it"),
        }
    }
    headers
}
