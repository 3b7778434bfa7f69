//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur while asking a completion provider for a turn.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the provider endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The provider did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the provider.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    /// A tool request carried arguments that are not valid JSON.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError { raw_response: String, reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Transient failures worth another attempt: connection problems,
    /// timeouts, rate limiting, and server-side errors.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::HttpError { status: 429, .. }
                | InferenceError::HttpError { status: 500, .. }
                | InferenceError::HttpError {
                    status: 502..=504,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retriable() {
        assert!(InferenceError::ConnectionFailed {
            endpoint: "".into(),
            reason: "".into()
        }
        .is_retriable());
        assert!(InferenceError::Timeout { duration_secs: 5 }.is_retriable());
        for status in [429, 500, 502, 503, 504] {
            assert!(
                InferenceError::HttpError {
                    status,
                    body: "".into()
                }
                .is_retriable(),
                "{status} should be retried"
            );
        }
        for status in [400, 401, 403, 404, 501] {
            assert!(
                !InferenceError::HttpError {
                    status,
                    body: "".into()
                }
                .is_retriable(),
                "{status} should not be retried"
            );
        }
        assert!(!InferenceError::ToolCallParseError {
            raw_response: "".into(),
            reason: "".into()
        }
        .is_retriable());
    }
}
