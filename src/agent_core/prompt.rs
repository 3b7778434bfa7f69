//! System prompt rendering. Pure functions, no I/O.

use super::types::RunContext;

/// Instruction block used when the operator does not configure one.
pub const DEFAULT_INSTRUCTIONS: &str = "\
You are a coding assistant with access to tools provided by external tool servers.
Tool names have the form <server>__<tool>. Call a tool when it helps answer the request,
and answer directly when it does not.
If a tool result is an object with an \"error\" key, read its kind and message: you may
retry with corrected arguments, pick one of the suggested tools, or explain the failure.
When you have the answer, reply with plain text and no further tool calls.";

/// Extra guidance when the `bridge__*` meta-tools are offered.
const META_TOOL_HINT: &str = "\
Servers that are not active can be inspected with bridge__list_servers and started with
bridge__activate_server. Use bridge__search_tools to find tools by category, tag or name,
and bridge__status to check the health of the bridge.";

/// Longest selection carried into the prompt, in bytes.
const MAX_SELECTION_BYTES: usize = 4000;

/// Render the editor context. Empty context renders to an empty string.
pub fn render_context(context: &RunContext) -> String {
    let mut sections = Vec::new();

    if !context.workspace_folders.is_empty() {
        sections.push(format!(
            "Workspace folders:\n{}",
            bullet_list(&context.workspace_folders)
        ));
    }
    if !context.open_files.is_empty() {
        sections.push(format!("Open files:\n{}", bullet_list(&context.open_files)));
    }
    if let Some(current) = context.current_file.as_deref().filter(|f| !f.is_empty()) {
        sections.push(format!("Current file: {current}"));
    }
    if let Some(selection) = context.selection.as_deref().filter(|s| !s.trim().is_empty()) {
        let shown = super::tokens::truncate_tool_result(selection, MAX_SELECTION_BYTES);
        sections.push(format!("Selected text:\n```\n{shown}\n```"));
    }

    sections.join("\n\n")
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assemble instructions, capability summary and rendered context.
pub fn build_system_prompt(
    instructions: &str,
    capability_summary: &str,
    context: &RunContext,
    meta_tools: bool,
) -> String {
    let mut prompt = String::from(instructions.trim_end());

    if meta_tools {
        prompt.push_str("\n\n");
        prompt.push_str(META_TOOL_HINT);
    }

    prompt.push_str("\n\n## Capabilities\n");
    prompt.push_str(capability_summary);

    let rendered = render_context(context);
    if !rendered.is_empty() {
        prompt.push_str("\n\n## Context\n");
        prompt.push_str(&rendered);
    }
    prompt
}
