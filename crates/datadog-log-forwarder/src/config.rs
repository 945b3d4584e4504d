// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SITE: &str = "datadoghq.com";
const DEFAULT_SOURCE_TYPE: &str = "unknown";
const DEFAULT_MAX_BATCH_SIZE: usize = 1_000;
const DEFAULT_MAX_BATCH_AGE_MS: u64 = 5_000;
const DEFAULT_MAX_BUFFERED_RECORDS: usize = 10_000;
const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 8_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Construct the logs intake url based on the DD_SITE env var.
pub fn logs_intake_url(site: &str) -> String {
    format!("https://http-intake.logs.{site}/api/v2/logs")
}

/// DD_LOGS_DD_URL env var will primarily be used for integration tests.
/// Overrides the entire logs intake url prefix.
pub fn logs_intake_url_prefixed(prefix: &str) -> String {
    format!("{prefix}/api/v2/logs")
}

/// Configuration for one [`crate::forwarder::LogForwarder`] instance.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub intake_url: String,
    pub api_key: Option<String>,
    /// Identifies the logging front-end feeding this forwarder; shipped as a
    /// common attribute on every batch.
    pub source_type: String,
    /// Records per sealed batch; reaching it flushes without waiting for the
    /// age trigger.
    pub max_batch_size: usize,
    /// Age of the oldest buffered record after which a partial batch flushes.
    pub max_batch_age: Duration,
    /// Outstanding-record cap; offers beyond it are rejected (backpressure).
    pub max_buffered_records: usize,
    /// Attempts per batch, first try included.
    pub max_send_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub shutdown_timeout: Duration,
    pub request_timeout: Duration,
    pub https_proxy: Option<String>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            intake_url: logs_intake_url(DEFAULT_SITE),
            api_key: None,
            source_type: DEFAULT_SOURCE_TYPE.to_string(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_age: Duration::from_millis(DEFAULT_MAX_BATCH_AGE_MS),
            max_buffered_records: DEFAULT_MAX_BUFFERED_RECORDS,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            https_proxy: None,
        }
    }
}

impl ForwarderConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ForwarderConfig::default();

        config.api_key = env::var("DD_API_KEY").ok();

        let site = env::var("DD_SITE").unwrap_or_else(|_| DEFAULT_SITE.to_string());
        config.intake_url = logs_intake_url(&site);
        if let Ok(prefix) = env::var("DD_LOGS_DD_URL") {
            config.intake_url = logs_intake_url_prefixed(&prefix);
        }

        if let Ok(source_type) = env::var("DD_LOGS_SOURCE_TYPE") {
            config.source_type = source_type;
        }

        config.max_batch_size = env_parse("DD_LOGS_MAX_BATCH_SIZE", config.max_batch_size);
        config.max_batch_age =
            Duration::from_millis(env_parse("DD_LOGS_MAX_BATCH_AGE_MS", DEFAULT_MAX_BATCH_AGE_MS));
        config.max_buffered_records =
            env_parse("DD_LOGS_MAX_BUFFERED_RECORDS", config.max_buffered_records);
        config.max_send_attempts = env_parse("DD_LOGS_MAX_SEND_ATTEMPTS", config.max_send_attempts);
        config.backoff_base =
            Duration::from_millis(env_parse("DD_LOGS_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS));
        config.backoff_max =
            Duration::from_millis(env_parse("DD_LOGS_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS));
        config.shutdown_timeout = Duration::from_millis(env_parse(
            "DD_LOGS_SHUTDOWN_TIMEOUT_MS",
            DEFAULT_SHUTDOWN_TIMEOUT_MS,
        ));
        config.request_timeout = Duration::from_millis(env_parse(
            "DD_LOGS_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
        ));

        config.https_proxy = env::var("DD_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.intake_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "intake URL cannot be empty".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "max batch size must be greater than 0".to_string(),
            ));
        }
        if self.max_buffered_records < self.max_batch_size {
            return Err(ConfigError::Invalid(
                "buffered-record cap must be at least the batch size".to_string(),
            ));
        }
        if self.max_send_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max send attempts must be greater than 0".to_string(),
            ));
        }
        if self.backoff_max < self.backoff_base {
            return Err(ConfigError::Invalid(
                "backoff cap must be at least the base delay".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}
