//! OpenAI Chat Completions binding.
//!
//! Also works against OpenAI-compatible servers (vLLM, Ollama, llama.cpp)
//! by pointing `base_url` at them.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::ProviderConfig;
use super::errors::InferenceError;
use super::provider::{
    build_http_client, parse_arguments, post_json_with_retry, CompletionProvider, RetryPolicy,
};
use super::types::{Completion, CompletionRequest, ToolRequest, Turn};
use crate::mcp_client::ToolSpec;

const PROVIDER_NAME: &str = "openai";

// ─── Wire Types ──────────────────────────────────────────────────────────────

/// A single message in the conversation.
///
/// `content` is sent as `""` rather than `null` for assistant messages that
/// only carry tool calls; several compatible servers reject `null`.
#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: Role,
    #[serde(serialize_with = "serialize_content")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCallResponse>>,
}

fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize)]
struct ToolDefinition {
    r#type: &'static str,
    function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
struct FunctionDefinition {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCallResponse {
    id: String,
    r#type: String,
    function: FunctionCallResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionCallResponse {
    name: String,
    arguments: String,
}

/// Request body for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    temperature: f32,
    max_tokens: u32,
}

// ─── Provider ────────────────────────────────────────────────────────────────

pub struct OpenAiProvider {
    http: HttpClient,
    url: String,
    auth_header: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout_secs: u64,
    retry: RetryPolicy,
}

impl OpenAiProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, InferenceError> {
        let api_key = config.resolve_api_key()?;
        Ok(Self {
            http: build_http_client(config)?,
            url: format!("{}/chat/completions", config.base_url()),
            auth_header: format!("Bearer {api_key}"),
            model: config.model().to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
            retry: RetryPolicy::from_config(config),
        })
    }

    fn build_body(&self, request: &CompletionRequest<'_>) -> ChatCompletionRequest {
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(tool_definition).collect())
        };
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: build_messages(request.system_prompt, request.history),
            tool_choice: tools.as_ref().map(|_| "auto"),
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, InferenceError> {
        let body = serde_json::to_value(self.build_body(&request)).map_err(|e| {
            InferenceError::InvalidResponse {
                provider: PROVIDER_NAME.into(),
                reason: format!("failed to encode request: {e}"),
            }
        })?;

        tracing::debug!(
            model = %self.model,
            turns = request.history.len(),
            tools = request.tools.len(),
            "sending chat completion"
        );

        let headers = [("authorization", self.auth_header.as_str())];
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

fn tool_definition(spec: &ToolSpec) -> ToolDefinition {
    ToolDefinition {
        r#type: "function",
        function: FunctionDefinition {
            name: spec.name.clone(),
            description: spec.description.clone(),
            parameters: spec.input_schema.clone(),
        },
    }
}

fn build_messages(system_prompt: &str, history: &[Turn]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage {
        role: Role::System,
        content: Some(system_prompt.to_string()),
        tool_call_id: None,
        tool_calls: None,
    });

    for turn in history {
        let message = match turn {
            Turn::User { text } => ChatMessage {
                role: Role::User,
                content: Some(text.clone()),
                tool_call_id: None,
                tool_calls: None,
            },
            Turn::Assistant {
                text,
                tool_requests,
            } => ChatMessage {
                role: Role::Assistant,
                content: text.clone(),
                tool_call_id: None,
                tool_calls: if tool_requests.is_empty() {
                    None
                } else {
                    Some(
                        tool_requests
                            .iter()
                            .map(|r| ToolCallResponse {
                                id: r.id.clone(),
                                r#type: "function".into(),
                                function: FunctionCallResponse {
                                    name: r.tool_name.clone(),
                                    arguments: r.arguments_json(),
                                },
                            })
                            .collect(),
                    )
                },
            },
            Turn::ToolResult {
                call_id, content, ..
            } => ChatMessage {
                role: Role::Tool,
                content: Some(content.clone()),
                tool_call_id: Some(call_id.clone()),
                tool_calls: None,
            },
        };
        messages.push(message);
    }
    messages
}

fn parse_response(body: &str) -> Result<Completion, InferenceError> {
    #[derive(Deserialize)]
    struct Response {
        choices: Vec<Choice>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: Message,
    }

    #[derive(Deserialize)]
    struct Message {
        content: Option<String>,
        tool_calls: Option<Vec<ToolCall>>,
    }

    #[derive(Deserialize)]
    struct ToolCall {
        id: Option<String>,
        function: FunctionCallResponse,
    }

    let resp: Response = serde_json::from_str(body).map_err(|e| InferenceError::InvalidResponse {
        provider: PROVIDER_NAME.into(),
        reason: format!("failed to parse response: {e}"),
    })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::InvalidResponse {
            provider: PROVIDER_NAME.into(),
            reason: "empty choices array".into(),
        })?;

    let content = choice.message.content.filter(|c| !c.trim().is_empty());

    let mut requests = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let id = tc.id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
        let request = match parse_arguments(&tc.function.arguments) {
            Ok(arguments) => ToolRequest::new(id, tc.function.name, arguments),
            Err(e) => {
                tracing::warn!(tool = %tc.function.name, error = %e, "model sent unparseable tool arguments");
                ToolRequest::with_invalid_arguments(id, tc.function.name, &tc.function.arguments, e.to_string())
            }
        };
        requests.push(request);
    }

    if requests.is_empty() {
        Ok(Completion::Final {
            text: content.unwrap_or_default(),
        })
    } else {
        Ok(Completion::ToolRequests {
            text: content,
            requests,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> ProviderConfig {
        ProviderConfig {
            base_url: Some(base_url),
            model: Some("test-model".into()),
            api_key: Some("sk-test".into()),
            max_retries: 2,
            retry_base_delay_ms: 1,
            timeout_secs: 5,
            ..ProviderConfig::default()
        }
    }

    fn add_tool() -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "demo__add".into(),
            description: "Add two numbers".into(),
            input_schema: json!({"type": "object", "properties": {"a": {"type": "number"}}}),
        }]
    }

    #[test]
    fn test_build_messages_roundtrip_shapes() {
        let history = vec![
            Turn::User {
                text: "add 5 and 3".into(),
            },
            Turn::Assistant {
                text: None,
                tool_requests: vec![ToolRequest {
                    id: "call_1".into(),
                    tool_name: "demo__add".into(),
                    arguments: json!({"a": 5, "b": 3}),
                    argument_error: None,
                }],
            },
            Turn::ToolResult {
                call_id: "call_1".into(),
                tool_name: "demo__add".into(),
                content: "8".into(),
                is_error: false,
            },
        ];
        let messages = serde_json::to_value(build_messages("sys", &history)).unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], "");
        assert_eq!(messages[2]["tool_calls"][0]["type"], "function");
        let args: serde_json::Value = serde_json::from_str(
            messages[2]["tool_calls"][0]["function"]["arguments"]
                .as_str()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(args, json!({"a": 5, "b": 3}));
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_parse_response_generates_missing_ids() {
        let body = r#"{"choices":[{"message":{"content":null,"tool_calls":[
            {"type":"function","function":{"name":"demo__add","arguments":""}}]}}]}"#;
        let Completion::ToolRequests { text, requests } = parse_response(body).unwrap() else {
            panic!("expected tool requests");
        };
        assert!(text.is_none());
        assert!(requests[0].id.starts_with("call_"));
        assert_eq!(requests[0].arguments, json!({}));
    }

    #[test]
    fn test_parse_response_keeps_unparseable_arguments() {
        let body = r#"{"choices":[{"message":{"content":null,"tool_calls":[
            {"id":"call_1","type":"function","function":{"name":"demo__add","arguments":"{\"a\":5,"}}]}}]}"#;
        let Completion::ToolRequests { requests, .. } = parse_response(body).unwrap() else {
            panic!("expected tool requests");
        };
        assert_eq!(requests[0].tool_name, "demo__add");
        assert!(requests[0].argument_error.is_some());
        assert_eq!(requests[0].arguments_json(), r#"{"a":5,"#);
    }

    #[test]
    fn test_parse_response_empty_choices() {
        assert!(matches!(
            parse_response(r#"{"choices":[]}"#),
            Err(InferenceError::InvalidResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_complete_final_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "test-model", "tool_choice": "auto"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "The answer is 8."}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::from_config(&test_config(format!("{}/v1", server.uri()))).unwrap();
        let history = vec![Turn::User { text: "hi".into() }];
        let tools = add_tool();
        let completion = provider
            .complete(CompletionRequest {
                system_prompt: "sys",
                history: &history,
                tools: &tools,
            })
            .await
            .unwrap();
        assert_eq!(
            completion,
            Completion::Final {
                text: "The answer is 8.".into()
            }
        );
    }

    #[tokio::test]
    async fn test_complete_tool_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {
                    "role": "assistant",
                    "content": "Let me add those.",
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "demo__add", "arguments": "{\"a\":5,\"b\":3}"}
                    }]
                }}]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::from_config(&test_config(server.uri())).unwrap();
        let history = vec![Turn::User { text: "add".into() }];
        let completion = provider
            .complete(CompletionRequest {
                system_prompt: "sys",
                history: &history,
                tools: &[],
            })
            .await
            .unwrap();
        let Completion::ToolRequests { text, requests } = completion else {
            panic!("expected tool requests");
        };
        assert_eq!(text.as_deref(), Some("Let me add those."));
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, "call_abc");
        assert_eq!(requests[0].tool_name, "demo__add");
        assert_eq!(requests[0].arguments, json!({"a": 5, "b": 3}));
    }

    #[tokio::test]
    async fn test_retries_on_503_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .up_to_n_times(1)
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "ok"}}]
            })))
            .with_priority(2)
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::from_config(&test_config(server.uri())).unwrap();
        let history = vec![Turn::User { text: "hi".into() }];
        let completion = provider
            .complete(CompletionRequest {
                system_prompt: "sys",
                history: &history,
                tools: &[],
            })
            .await
            .unwrap();
        assert_eq!(completion, Completion::Final { text: "ok".into() });
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::from_config(&test_config(server.uri())).unwrap();
        let history = vec![Turn::User { text: "hi".into() }];
        let err = provider
            .complete(CompletionRequest {
                system_prompt: "sys",
                history: &history,
                tools: &[],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::HttpError { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let provider = OpenAiProvider::from_config(&test_config(server.uri())).unwrap();
        let history = vec![Turn::User { text: "hi".into() }];
        let err = provider
            .complete(CompletionRequest {
                system_prompt: "sys",
                history: &history,
                tools: &[],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::HttpError { status: 429, .. }));
    }
}
