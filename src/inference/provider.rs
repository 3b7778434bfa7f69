//! The `CompletionProvider` seam and the HTTP plumbing both bindings share.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::anthropic::AnthropicProvider;
use super::config::{ProviderConfig, ProviderKind};
use super::errors::InferenceError;
use super::openai::OpenAiProvider;
use super::types::{Completion, CompletionRequest};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

// ─── Trait ───────────────────────────────────────────────────────────────────

/// A model that, given the conversation so far, either answers or asks for
/// tools.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Short provider name for logs (`openai`, `anthropic`, ...).
    fn name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, InferenceError>;
}

/// Construct the provider selected by `config.kind`.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn CompletionProvider>, InferenceError> {
    let provider: Arc<dyn CompletionProvider> = match config.kind {
        ProviderKind::Openai => Arc::new(OpenAiProvider::from_config(config)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_config(config)?),
    };
    tracing::info!(
        provider = provider.name(),
        model = config.model(),
        base_url = %config.base_url(),
        "completion provider ready"
    );
    Ok(provider)
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

/// Exponential backoff over retriable failures.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

pub(crate) fn build_http_client(config: &ProviderConfig) -> Result<HttpClient, InferenceError> {
    HttpClient::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| InferenceError::ConnectionFailed {
            endpoint: config.base_url(),
            reason: format!("failed to build HTTP client: {e}"),
        })
}

/// POST `body` to `url`, retrying per `policy`. Returns the response text of
/// the first 2xx answer.
pub(crate) async fn post_json_with_retry(
    http: &HttpClient,
    url: &str,
    headers: &[(&str, &str)],
    body: &serde_json::Value,
    policy: RetryPolicy,
    timeout_secs: u64,
) -> Result<String, InferenceError> {
    let mut attempt = 0;
    loop {
        match post_json_once(http, url, headers, body, timeout_secs).await {
            Ok(text) => return Ok(text),
            Err(e) if e.is_retriable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    url = %url,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "provider request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn post_json_once(
    http: &HttpClient,
    url: &str,
    headers: &[(&str, &str)],
    body: &serde_json::Value,
    timeout_secs: u64,
) -> Result<String, InferenceError> {
    let mut builder = http.post(url).json(body);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: timeout_secs,
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(InferenceError::HttpError {
            status: status.as_u16(),
            body: body_text,
        });
    }

    response.text().await.map_err(|e| {
        if e.is_timeout() {
            InferenceError::Timeout {
                duration_secs: timeout_secs,
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: format!("failed to read response body: {e}"),
            }
        }
    })
}

/// Parse tool-call arguments delivered as a JSON string. Empty means `{}`.
pub(crate) fn parse_arguments(raw: &str) -> Result<serde_json::Value, InferenceError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw).map_err(|e| InferenceError::ToolCallParseError {
        raw_response: raw.to_string(),
        reason: format!("invalid tool call arguments JSON: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(20), MAX_BACKOFF);
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments("").unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_arguments(r#"{"a": 1}"#).unwrap(),
            serde_json::json!({"a": 1})
        );
        assert!(matches!(
            parse_arguments("{broken"),
            Err(InferenceError::ToolCallParseError { .. })
        ));
    }

    #[test]
    fn test_build_provider_requires_key() {
        let config = ProviderConfig {
            api_key: Some("sk-test".into()),
            ..ProviderConfig::default()
        };
        let provider = build_provider(&config).unwrap();
        assert_eq!(provider.name(), "openai");

        let config = ProviderConfig {
            kind: ProviderKind::Anthropic,
            api_key: Some("sk-test".into()),
            ..ProviderConfig::default()
        };
        assert_eq!(build_provider(&config).unwrap().name(), "anthropic");
    }
}
