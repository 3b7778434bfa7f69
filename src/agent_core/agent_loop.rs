//! The agent loop: drives one user request to completion.
//!
//! Each iteration asks the provider for the next step with the full
//! conversation and the current tool set. Tool requests are dispatched as one
//! concurrent batch; every outcome, success or failure, goes back into the
//! conversation as a tool-result turn. The run ends on a final answer, the
//! iteration cap, a provider failure, or cancellation.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::inference::types::{Completion, CompletionRequest, ToolRequest};
use crate::inference::CompletionProvider;
use crate::mcp_client::ConnectionRegistry;

use super::conversation::ConversationState;
use super::errors::AgentError;
use super::meta_tools;
use super::prompt::{build_system_prompt, DEFAULT_INSTRUCTIONS};
use super::tokens::{estimate_request_tokens, truncate_tool_result};
use super::tool_router::ToolRouter;
use super::types::{
    RunContext, RunOutcome, RunResult, ToolErrorPayload, ToolInvocationRecord,
};

// ─── Config ─────────────────────────────────────────────────────────────────

/// Agent settings (`agent:` section of the settings file).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Provider calls per run before giving up.
    pub max_iterations: u32,
    /// Cap on each rendered tool result, in bytes. Zero disables the cap.
    pub max_tool_result_chars: usize,
    /// Replaces the built-in instruction block.
    pub instructions: Option<String>,
    /// Offer the `bridge__*` tools to the model.
    pub expose_meta_tools: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_tool_result_chars: 6000,
            instructions: None,
            expose_meta_tools: true,
        }
    }
}

/// Outcome of one tool request within a batch.
struct Invocation {
    record: ToolInvocationRecord,
    content: String,
    is_error: bool,
}

// ─── AgentLoop ──────────────────────────────────────────────────────────────

pub struct AgentLoop {
    router: ToolRouter,
    provider: Arc<dyn CompletionProvider>,
    config: AgentConfig,
}

impl AgentLoop {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        provider: Arc<dyn CompletionProvider>,
        config: AgentConfig,
    ) -> Result<Self, AgentError> {
        if config.max_iterations == 0 {
            return Err(AgentError::InvalidConfig {
                reason: "max_iterations must be at least 1".into(),
            });
        }
        Ok(Self {
            router: ToolRouter::new(registry),
            provider,
            config,
        })
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run to completion without external cancellation.
    pub async fn run(&self, prompt: &str, context: &RunContext) -> RunResult {
        self.run_with_cancellation(prompt, context, CancellationToken::new())
            .await
    }

    /// Run until done or until `cancel` fires. Cancelling drops the in-flight
    /// provider call or tool batch, which releases any pending backend
    /// requests.
    pub async fn run_with_cancellation(
        &self,
        prompt: &str,
        context: &RunContext,
        cancel: CancellationToken,
    ) -> RunResult {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("agent_run", run_id = %run_id, provider = self.provider.name());
        self.drive(run_id, prompt, context, cancel)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        run_id: String,
        prompt: &str,
        context: &RunContext,
        cancel: CancellationToken,
    ) -> RunResult {
        let started = Instant::now();
        let mut conversation = ConversationState::with_prompt(prompt);
        let mut records: Vec<ToolInvocationRecord> = Vec::new();
        let instructions = self
            .config
            .instructions
            .as_deref()
            .unwrap_or(DEFAULT_INSTRUCTIONS);

        tracing::info!(prompt_len = prompt.len(), "agent run started");

        for iteration in 1..=self.config.max_iterations {
            let catalog = self.router.catalog();
            let system_prompt = build_system_prompt(
                instructions,
                &catalog.capability_summary(),
                context,
                self.config.expose_meta_tools,
            );
            let mut tools = catalog.tool_specs();
            if self.config.expose_meta_tools {
                tools.extend(meta_tools::meta_tool_specs());
            }

            let request = CompletionRequest {
                system_prompt: &system_prompt,
                history: conversation.turns(),
                tools: &tools,
            };
            tracing::debug!(
                iteration,
                turns = conversation.len(),
                tools = tools.len(),
                estimated_tokens = estimate_request_tokens(&system_prompt, conversation.turns(), &tools),
                "requesting completion"
            );

            let completion = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return finish_cancelled(run_id, records, iteration);
                }
                completion = self.provider.complete(request) => completion,
            };

            let (text, requests) = match completion {
                Err(e) => {
                    tracing::error!(iteration, error = %e, "provider call failed, ending run");
                    return RunResult {
                        run_id,
                        success: false,
                        answer: format!("The model provider failed: {e}"),
                        tool_invocation_records: records,
                        iteration_count: iteration,
                        error: Some(e.to_string()),
                        outcome: RunOutcome::ProviderError,
                    };
                }
                Ok(Completion::Final { text }) => {
                    conversation.add_assistant_message(&text);
                    tracing::info!(
                        iterations = iteration,
                        tool_calls = records.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "agent run completed"
                    );
                    return RunResult {
                        run_id,
                        success: true,
                        answer: text,
                        tool_invocation_records: records,
                        iteration_count: iteration,
                        error: None,
                        outcome: RunOutcome::Completed,
                    };
                }
                Ok(Completion::ToolRequests { text, requests }) => (text, requests),
            };

            tracing::info!(
                iteration,
                tools = ?requests.iter().map(|r| r.tool_name.as_str()).collect::<Vec<_>>(),
                "model requested tools"
            );
            conversation.add_tool_requests(text, requests.clone());

            let invocations = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return finish_cancelled(run_id, records, iteration);
                }
                invocations = self.execute_batch(&requests) => invocations,
            };

            for (request, invocation) in requests.iter().zip(invocations) {
                conversation.add_tool_result(
                    &request.id,
                    &request.tool_name,
                    invocation.content,
                    invocation.is_error,
                );
                records.push(invocation.record);
            }
        }

        let cap = self.config.max_iterations;
        tracing::warn!(max_iterations = cap, tool_calls = records.len(), "iteration limit reached");
        RunResult {
            run_id,
            success: false,
            answer: format!(
                "Stopped after {cap} iterations without a final answer. The request may need to be narrowed down."
            ),
            tool_invocation_records: records,
            iteration_count: cap,
            error: Some(format!("iteration limit of {cap} reached")),
            outcome: RunOutcome::IterationLimit,
        }
    }

    /// Run one batch: meta-tools in-process, everything else through the
    /// router, all concurrently. Requests whose arguments did not parse are
    /// answered with an error turn and never dispatched. Output is in request
    /// order.
    async fn execute_batch(&self, requests: &[ToolRequest]) -> Vec<Invocation> {
        let (malformed, dispatchable): (Vec<usize>, Vec<usize>) =
            (0..requests.len()).partition(|&i| requests[i].argument_error.is_some());
        let (meta, backend): (Vec<usize>, Vec<usize>) = dispatchable
            .into_iter()
            .partition(|&i| self.config.expose_meta_tools && meta_tools::is_meta_tool(&requests[i].tool_name));

        let backend_calls: Vec<(String, serde_json::Value)> = backend
            .iter()
            .map(|&i| (requests[i].tool_name.clone(), requests[i].arguments.clone()))
            .collect();

        let meta_futures = meta.iter().map(|&i| {
            let request = &requests[i];
            async move {
                let started_at = Utc::now();
                let start = Instant::now();
                let result =
                    meta_tools::execute(&self.router, &request.tool_name, &request.arguments).await;
                (started_at, start.elapsed().as_millis() as u64, result)
            }
        });

        let (meta_outcomes, backend_outcomes) = futures::join!(
            futures::future::join_all(meta_futures),
            self.router.dispatch_batch(&backend_calls),
        );

        let mut slots: Vec<Option<Invocation>> = (0..requests.len()).map(|_| None).collect();

        for &i in &malformed {
            let request = &requests[i];
            let error = AgentError::InvalidArguments {
                tool: request.tool_name.clone(),
                reason: request.argument_error.clone().unwrap_or_default(),
            };
            let result = Err(ToolErrorPayload::from_agent(&error, Vec::new()));
            slots[i] = Some(self.invocation(request, Utc::now(), 0, result));
        }

        for (&i, (started_at, duration_ms, result)) in meta.iter().zip(meta_outcomes) {
            slots[i] = Some(self.invocation(&requests[i], started_at, duration_ms, result));
        }
        for (&i, outcome) in backend.iter().zip(backend_outcomes) {
            let request = &requests[i];
            let result = outcome.result.map(|r| r.text()).map_err(|e| {
                ToolErrorPayload::from_mcp(&e, self.router.suggestions_for(&request.tool_name, &e))
            });
            slots[i] = Some(self.invocation(request, outcome.started_at, outcome.duration_ms, result));
        }

        slots.into_iter().flatten().collect()
    }

    fn invocation(
        &self,
        request: &ToolRequest,
        started_at: chrono::DateTime<Utc>,
        duration_ms: u64,
        result: Result<String, ToolErrorPayload>,
    ) -> Invocation {
        match result {
            Ok(text) => {
                let content = truncate_tool_result(&text, self.config.max_tool_result_chars);
                Invocation {
                    record: ToolInvocationRecord {
                        call_id: request.id.clone(),
                        tool: request.tool_name.clone(),
                        arguments: request.arguments.clone(),
                        result: Some(content.clone()),
                        error: None,
                        started_at,
                        duration_ms,
                    },
                    content,
                    is_error: false,
                }
            }
            Err(payload) => {
                let payload = payload.capped(self.config.max_tool_result_chars);
                Invocation {
                    content: payload.to_turn_content(&request.tool_name),
                    record: ToolInvocationRecord {
                        call_id: request.id.clone(),
                        tool: request.tool_name.clone(),
                        arguments: request.arguments.clone(),
                        result: None,
                        error: Some(payload),
                        started_at,
                        duration_ms,
                    },
                    is_error: true,
                }
            }
        }
    }
}

fn finish_cancelled(run_id: String, records: Vec<ToolInvocationRecord>, iteration: u32) -> RunResult {
    tracing::info!(iteration, "agent run cancelled");
    RunResult {
        run_id,
        success: false,
        answer: "The run was cancelled.".into(),
        tool_invocation_records: records,
        iteration_count: iteration,
        error: Some("cancelled".into()),
        outcome: RunOutcome::Cancelled,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
