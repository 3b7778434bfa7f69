//! Anthropic Messages API binding.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};

use super::config::ProviderConfig;
use super::errors::InferenceError;
use super::provider::{build_http_client, post_json_with_retry, CompletionProvider, RetryPolicy};
use super::types::{Completion, CompletionRequest, ToolRequest, Turn};
use crate::mcp_client::ToolSpec;

const PROVIDER_NAME: &str = "anthropic";

/// API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    http: HttpClient,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout_secs: u64,
    retry: RetryPolicy,
}

impl AnthropicProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, InferenceError> {
        Ok(Self {
            http: build_http_client(config)?,
            url: format!("{}/messages", config.base_url()),
            api_key: config.resolve_api_key()?,
            model: config.model().to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
            retry: RetryPolicy::from_config(config),
        })
    }

    fn build_body(&self, request: &CompletionRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": request.system_prompt,
            "messages": build_messages(request.history),
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(tool_definition).collect());
        }
        body
    }
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, InferenceError> {
        let body = self.build_body(&request);

        tracing::debug!(
            model = %self.model,
            turns = request.history.len(),
            tools = request.tools.len(),
            "sending messages request"
        );

        let headers = [
            ("x-api-key", self.api_key.as_str()),
            ("anthropic-version", ANTHROPIC_VERSION),
        ];
        let text = post_json_with_retry(
            &self.http,
            &self.url,
            &headers,
            &body,
            self.retry,
            self.timeout_secs,
        )
        .await?;

        parse_response(&text)
    }
}

// ─── Translation ─────────────────────────────────────────────────────────────

fn tool_definition(spec: &ToolSpec) -> Value {
    json!({
        "name": spec.name,
        "description": spec.description,
        "input_schema": spec.input_schema,
    })
}

/// Messages must alternate `user`/`assistant`. Adjacent turns mapping to the
/// same role are merged into one message, which is how consecutive tool
/// results end up as a single `user` message of `tool_result` blocks.
fn build_messages(history: &[Turn]) -> Vec<Value> {
    let mut messages: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for turn in history {
        let (role, blocks) = match turn {
            Turn::User { text } => ("user", vec![json!({"type": "text", "text": text})]),
            Turn::Assistant {
                text,
                tool_requests,
            } => {
                let mut blocks = Vec::with_capacity(tool_requests.len() + 1);
                if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for request in tool_requests {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": request.id,
                        "name": request.tool_name,
                        "input": if request.argument_error.is_some() { json!({}) } else { request.arguments.clone() },
                    }));
                }
                ("assistant", blocks)
            }
            Turn::ToolResult {
                call_id,
                content,
                is_error,
                ..
            } => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": content,
                });
                if *is_error {
                    block["is_error"] = Value::Bool(true);
                }
                ("user", vec![block])
            }
        };

        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => messages.push((role, blocks)),
        }
    }

    messages
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn parse_response(body: &str) -> Result<Completion, InferenceError> {
    #[derive(Deserialize)]
    struct Response {
        content: Vec<ContentBlock>,
    }

    #[derive(Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum ContentBlock {
        Text {
            text: String,
        },
        ToolUse {
            id: String,
            name: String,
            #[serde(default)]
            input: Value,
        },
        #[serde(other)]
        Other,
    }

    let resp: Response = serde_json::from_str(body).map_err(|e| InferenceError::InvalidResponse {
        provider: PROVIDER_NAME.into(),
        reason: format!("failed to parse response: {e}"),
    })?;

    let mut texts = Vec::new();
    let mut requests = Vec::new();
    for block in resp.content {
        match block {
            ContentBlock::Text { text } => texts.push(text),
            ContentBlock::ToolUse { id, name, input } => requests.push(ToolRequest {
                id,
                tool_name: name,
                arguments: if input.is_null() { json!({}) } else { input },
                argument_error: None,
            }),
            ContentBlock::Other => {}
        }
    }

    let text = texts.join("\n");
    if requests.is_empty() {
        Ok(Completion::Final { text })
    } else {
        Ok(Completion::ToolRequests {
            text: Some(text).filter(|t| !t.trim().is_empty()),
            requests,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
