//! Completion provider configuration.
//!
//! Lives under the `provider:` section of the bridge settings file. The API
//! key is usually supplied through `${OPENAI_API_KEY}` style interpolation or
//! the conventional environment variable for the chosen provider.

use serde::Deserialize;

use super::errors::InferenceError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which completion API to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI Chat Completions (and compatible endpoints).
    #[default]
    Openai,
    /// Anthropic Messages API.
    Anthropic,
}

impl ProviderKind {
    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::Openai => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::Openai => "gpt-4o-mini",
            ProviderKind::Anthropic => "claude-3-5-sonnet-latest",
        }
    }

    /// Environment variable consulted when no key is configured.
    pub fn api_key_env(self) -> &'static str {
        match self {
            ProviderKind::Openai => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

/// Provider settings. Every field has a default so an empty section is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Defaults to the public endpoint of `kind`.
    pub base_url: Option<String>,
    /// Defaults to a current general-purpose model of `kind`.
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            base_url: None,
            model: None,
            api_key: None,
            temperature: 0.2,
            max_tokens: 4096,
            timeout_secs: 120,
            max_retries: 3,
            retry_base_delay_ms: 500,
        }
    }
}

impl ProviderConfig {
    pub fn base_url(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(self.kind.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(self.kind.default_model())
    }

    /// The configured key, else the provider's conventional env var.
    pub fn resolve_api_key(&self) -> Result<String, InferenceError> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Ok(key.to_string());
        }
        let var = self.kind.api_key_env();
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(InferenceError::ConfigError {
                reason: format!(
                    "no API key for {} provider: set provider.api_key or {var}",
                    self.kind.as_str()
                ),
            }),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
