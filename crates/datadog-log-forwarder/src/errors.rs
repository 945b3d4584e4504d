// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Reasons an offered record is not accepted into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OfferError {
    #[error("buffer is at capacity")]
    Full,

    #[error("forwarder is shut down")]
    Closed,
}

/// Per-record or per-batch failure raised while building the wire payload.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("attribute {key:?} holds a non-finite number")]
    NonFiniteNumber { key: String },

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures surfaced by a [`crate::sender::Transport`] implementation.
///
/// Every variant is classified as retryable by the sender.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("transport failure: {0}")]
    Other(String),
}

/// Invalid forwarder configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_error_display() {
        assert_eq!(OfferError::Full.to_string(), "buffer is at capacity");
        assert_eq!(OfferError::Closed.to_string(), "forwarder is shut down");
    }

    #[test]
    fn test_transport_error_display() {
        let error = TransportError::Connection("refused".to_string());
        assert_eq!(error.to_string(), "connection failed: refused");
    }

    #[test]
    fn test_encode_error_display() {
        let error = EncodeError::NonFiniteNumber {
            key: "latency".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "attribute \"latency\" holds a non-finite number"
        );
    }
}
