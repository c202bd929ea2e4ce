//! Streaming-JSON (codex) event translation
//!
//! Codex reports free text as message/reasoning deltas and every tool
//! action as a begin/output/end family keyed by `call_id`. Exec and patch
//! actions may be gated behind an approval request; approved patches are
//! applied here through the patch engine.

use super::{
    emit_error, emit_permission_request, payload_message, permission_request, BackendCommand,
    EventTranslator, PermissionResponse, TranslatorContext,
};
use crate::delta::{DeltaAccumulator, StreamKind};
use crate::emitter::MessageEmitter;
use crate::patch::{summarize_changes, PatchChangeSet};
use crate::text::{error_msg_id, filter_internal_markers, stream_error_msg_id};
use crate::tool_call::{OutputStream, ToolBegin, ToolCallLifecycle};
use crate::types::{BackendEvent, ConfirmDecision, MessageContent, ToolKind};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Event types that carry nothing the UI needs
const IGNORED_EVENTS: &[&str] = &[
    "session_configured",
    "task_started",
    "token_count",
    "turn_diff",
    "user_message",
];

/// A command as argv or as one shell line
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Argv(Vec<String>),
    Line(String),
}

impl Default for CommandLine {
    fn default() -> Self {
        Self::Line(String::new())
    }
}

impl CommandLine {
    fn display(&self) -> String {
        match self {
            Self::Argv(argv) => argv.join(" "),
            Self::Line(line) => line.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    delta: String,
    /// Full text some builds attach to a delta
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentMessage {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReasoningDelta {
    #[serde(default)]
    delta: String,
}

#[derive(Debug, Deserialize)]
struct Reasoning {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ExecBegin {
    call_id: String,
    #[serde(default)]
    command: CommandLine,
    cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecOutput {
    call_id: String,
    #[serde(default)]
    stream: OutputStream,
    #[serde(default)]
    chunk: String,
}

#[derive(Debug, Deserialize)]
struct ExecEnd {
    call_id: String,
    #[serde(default)]
    exit_code: i64,
    aggregated_output: Option<String>,
    stdout: Option<String>,
    stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecApproval {
    call_id: String,
    #[serde(default)]
    command: CommandLine,
    cwd: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PatchApproval {
    call_id: String,
    #[serde(default)]
    changes: PatchChangeSet,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PatchBegin {
    call_id: String,
    #[serde(default)]
    auto_approved: bool,
    #[serde(default)]
    changes: PatchChangeSet,
}

#[derive(Debug, Deserialize)]
struct PatchEnd {
    call_id: String,
    #[serde(default)]
    success: bool,
    stdout: Option<String>,
    stderr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct McpInvocation {
    #[serde(default)]
    server: String,
    #[serde(default)]
    tool: String,
    arguments: Option<Value>,
}

impl McpInvocation {
    fn tool_name(&self) -> &str {
        if self.tool.is_empty() {
            "unknown"
        } else {
            &self.tool
        }
    }

    fn title(&self) -> String {
        if self.server.is_empty() {
            self.tool_name().to_string()
        } else {
            format!("{}/{}", self.server, self.tool_name())
        }
    }
}

#[derive(Debug, Deserialize)]
struct McpBegin {
    call_id: Option<String>,
    #[serde(default)]
    invocation: McpInvocation,
}

#[derive(Debug, Deserialize)]
struct McpEnd {
    call_id: Option<String>,
    #[serde(default)]
    invocation: McpInvocation,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
struct WebSearchBegin {
    call_id: String,
}

#[derive(Debug, Deserialize)]
struct WebSearchEnd {
    call_id: String,
    #[serde(default)]
    query: String,
}

/// Codex event vocabulary
#[derive(Debug)]
enum CodexEvent {
    Ignored(String),
    AgentMessageDelta(MessageDelta),
    AgentMessage(AgentMessage),
    TaskComplete,
    TurnAborted,
    ReasoningDelta(ReasoningDelta),
    Reasoning(Reasoning),
    ReasoningSectionBreak,
    StreamError(String),
    Error(String),
    ExecBegin(ExecBegin),
    ExecOutput(ExecOutput),
    ExecEnd(ExecEnd),
    ExecApproval(ExecApproval),
    PatchApproval(PatchApproval),
    PatchBegin(PatchBegin),
    PatchEnd(PatchEnd),
    McpBegin(McpBegin),
    McpEnd(McpEnd),
    WebSearchBegin(WebSearchBegin),
    WebSearchEnd(WebSearchEnd),
    Unknown(String),
}

impl CodexEvent {
    fn parse(event: BackendEvent) -> serde_json::Result<Self> {
        let BackendEvent { event_type, data } = event;
        let parsed = match event_type.as_str() {
            t if IGNORED_EVENTS.contains(&t) => Self::Ignored(event_type),
            "agent_message_delta" => Self::AgentMessageDelta(serde_json::from_value(data)?),
            "agent_message" => Self::AgentMessage(serde_json::from_value(data)?),
            "task_complete" => Self::TaskComplete,
            "turn_aborted" => Self::TurnAborted,
            "agent_reasoning_delta" => Self::ReasoningDelta(serde_json::from_value(data)?),
            "agent_reasoning" => Self::Reasoning(serde_json::from_value(data)?),
            "agent_reasoning_section_break" => Self::ReasoningSectionBreak,
            "stream_error" => Self::StreamError(payload_message(&data)),
            "error" => Self::Error(payload_message(&data)),
            "exec_command_begin" => Self::ExecBegin(serde_json::from_value(data)?),
            "exec_command_output_delta" => Self::ExecOutput(serde_json::from_value(data)?),
            "exec_command_end" => Self::ExecEnd(serde_json::from_value(data)?),
            "exec_approval_request" => Self::ExecApproval(serde_json::from_value(data)?),
            "apply_patch_approval_request" => Self::PatchApproval(serde_json::from_value(data)?),
            "patch_apply_begin" => Self::PatchBegin(serde_json::from_value(data)?),
            "patch_apply_end" => Self::PatchEnd(serde_json::from_value(data)?),
            "mcp_tool_call_begin" => Self::McpBegin(serde_json::from_value(data)?),
            "mcp_tool_call_end" => Self::McpEnd(serde_json::from_value(data)?),
            "web_search_begin" => Self::WebSearchBegin(serde_json::from_value(data)?),
            "web_search_end" => Self::WebSearchEnd(serde_json::from_value(data)?),
            _ => Self::Unknown(event_type),
        };
        Ok(parsed)
    }
}

/// Decode a base64 output chunk, or return it unchanged
///
/// Only chunks whose length is a multiple of four and whose decoded bytes
/// are valid UTF-8 are treated as encoded.
pub fn decode_output_chunk(chunk: &str) -> String {
    if chunk.is_empty() || chunk.len() % 4 != 0 {
        return chunk.to_string();
    }
    base64::engine::general_purpose::STANDARD
        .decode(chunk)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| chunk.to_string())
}

fn mcp_failed(result: &Value) -> bool {
    let flagged = |v: &Value| v.get("is_error").and_then(Value::as_bool) == Some(true);
    result.get("Err").is_some() || flagged(result) || result.get("Ok").map_or(false, flagged)
}

/// Text content of an MCP result, falling back to pretty JSON
fn render_mcp_result(result: &Value) -> String {
    if let Some(s) = result.as_str() {
        return s.to_string();
    }
    let body = result.get("Ok").unwrap_or(result);
    let texts: Vec<&str> = body
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if !texts.is_empty() {
        return texts.join("\n");
    }
    serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
}

fn join_output(stdout: Option<String>, stderr: Option<String>) -> Option<String> {
    let joined: Vec<String> = [stdout, stderr]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join("\n"))
    }
}

/// Translator for the streaming-JSON backend
pub struct CodexTranslator {
    emitter: MessageEmitter,
    text: DeltaAccumulator,
    reasoning: DeltaAccumulator,
    tools: ToolCallLifecycle,
    /// Generated MCP call ids per tool, oldest first
    mcp_open: Mutex<HashMap<String, VecDeque<String>>>,
}

impl CodexTranslator {
    pub fn new(ctx: TranslatorContext) -> Self {
        Self {
            text: DeltaAccumulator::new(ctx.emitter.clone(), ctx.idle)
                .with_display_filter(filter_internal_markers),
            reasoning: DeltaAccumulator::with_kind(
                ctx.emitter.clone(),
                StreamKind::Reasoning,
                ctx.idle,
            ),
            tools: ToolCallLifecycle::new(ctx.emitter.clone(), ctx.workspace),
            emitter: ctx.emitter,
            mcp_open: Mutex::new(HashMap::new()),
        }
    }

    fn close_reasoning(&self) {
        if self.reasoning.is_open() {
            self.reasoning.finalize_message(None);
        }
    }

    fn open_mcp(&self, tool: &str) -> String {
        let call_id = format!("mcp_{}_{}", tool, uuid::Uuid::new_v4());
        let mut open = self.mcp_open.lock().unwrap_or_else(|e| e.into_inner());
        open.entry(tool.to_string())
            .or_default()
            .push_back(call_id.clone());
        call_id
    }

    fn take_mcp(&self, tool: &str) -> Option<String> {
        let mut open = self.mcp_open.lock().unwrap_or_else(|e| e.into_inner());
        let queue = open.get_mut(tool)?;
        let call_id = queue.pop_front();
        if queue.is_empty() {
            open.remove(tool);
        }
        call_id
    }

    async fn dispatch(&self, event: CodexEvent) {
        match event {
            CodexEvent::Ignored(kind) => {
                tracing::debug!(event_type = %kind, "Codex event ignored");
            }
            CodexEvent::AgentMessageDelta(d) => {
                self.close_reasoning();
                match d.message.filter(|m| !m.is_empty()) {
                    Some(full) => self.text.push_full(&full),
                    None => self.text.push_delta(&d.delta),
                }
            }
            CodexEvent::AgentMessage(m) => {
                self.close_reasoning();
                self.text.finalize_message(Some(&m.message));
            }
            CodexEvent::TaskComplete => {
                self.close_reasoning();
                self.text.task_complete();
            }
            CodexEvent::TurnAborted => {
                self.reasoning.cleanup();
                self.text.cleanup();
                let finish = self
                    .emitter
                    .message(uuid::Uuid::new_v4().to_string(), MessageContent::Finish);
                self.emitter.emit(&finish);
            }
            CodexEvent::ReasoningDelta(d) => self.reasoning.push_delta(&d.delta),
            CodexEvent::Reasoning(r) => self.reasoning.finalize_message(Some(&r.text)),
            CodexEvent::ReasoningSectionBreak => self.close_reasoning(),
            CodexEvent::StreamError(message) => {
                emit_error(&self.emitter, stream_error_msg_id(&message), &message);
            }
            CodexEvent::Error(message) => {
                tracing::warn!(error = %message, "Codex reported an error");
                emit_error(&self.emitter, error_msg_id(&message), &message);
                self.close_reasoning();
                self.text.task_complete();
            }
            CodexEvent::ExecBegin(e) => {
                tracing::debug!(call_id = %e.call_id, cwd = ?e.cwd, "Exec begin");
                let spec = ToolBegin::new(e.call_id, "Shell", ToolKind::Exec)
                    .with_description(e.command.display());
                self.tools.begin(spec).await;
            }
            CodexEvent::ExecOutput(o) => {
                self.tools
                    .output(&o.call_id, o.stream, &decode_output_chunk(&o.chunk));
            }
            CodexEvent::ExecEnd(e) => {
                let output = e
                    .aggregated_output
                    .filter(|s| !s.is_empty())
                    .or_else(|| join_output(e.stdout, e.stderr));
                self.tools.end(&e.call_id, e.exit_code == 0, output);
            }
            CodexEvent::ExecApproval(a) => self.on_exec_approval(a).await,
            CodexEvent::PatchApproval(a) => self.on_patch_approval(a).await,
            CodexEvent::PatchBegin(b) => self.on_patch_begin(b).await,
            CodexEvent::PatchEnd(e) => {
                self.tools
                    .end(&e.call_id, e.success, join_output(e.stdout, e.stderr));
            }
            CodexEvent::McpBegin(b) => {
                let call_id = match b.call_id.filter(|id| !id.is_empty()) {
                    Some(id) => id,
                    None => self.open_mcp(b.invocation.tool_name()),
                };
                self.tools.begin(mcp_begin(call_id, &b.invocation)).await;
            }
            CodexEvent::McpEnd(e) => {
                let call_id = match e.call_id.filter(|id| !id.is_empty()) {
                    Some(id) => id,
                    None => match self.take_mcp(e.invocation.tool_name()) {
                        Some(id) => id,
                        None => {
                            // End without a begin we saw; show it anyway
                            let id = format!(
                                "mcp_{}_{}",
                                e.invocation.tool_name(),
                                uuid::Uuid::new_v4()
                            );
                            self.tools.begin(mcp_begin(id.clone(), &e.invocation)).await;
                            id
                        }
                    },
                };
                let failed = mcp_failed(&e.result);
                self.tools
                    .end(&call_id, !failed, Some(render_mcp_result(&e.result)));
            }
            CodexEvent::WebSearchBegin(b) => {
                let spec = ToolBegin::new(b.call_id, "WebSearch", ToolKind::WebSearch)
                    .with_description("Searching the web");
                self.tools.begin(spec).await;
            }
            CodexEvent::WebSearchEnd(e) => {
                let spec = ToolBegin::new(e.call_id.clone(), "WebSearch", ToolKind::WebSearch)
                    .with_description(format!("Web search: {}", e.query));
                self.tools.begin(spec).await;
                self.tools.end(&e.call_id, true, Some(e.query));
            }
            CodexEvent::Unknown(kind) => {
                tracing::warn!(event_type = %kind, "Unknown codex event dropped");
            }
        }
    }

    async fn on_exec_approval(&self, a: ExecApproval) {
        if self.tools.is_pending(&a.call_id) {
            tracing::debug!(call_id = %a.call_id, "Duplicate exec approval request ignored");
            return;
        }
        let command = a.command.display();
        tracing::debug!(call_id = %a.call_id, cwd = ?a.cwd, "Exec approval requested");
        let spec = ToolBegin::new(a.call_id.clone(), "Shell", ToolKind::Exec)
            .with_description(command.clone())
            .requiring_confirmation(true);
        self.tools.begin(spec).await;

        if self.tools.is_pending(&a.call_id) {
            let title = a.reason.unwrap_or_else(|| "Run command".to_string());
            emit_permission_request(
                &self.emitter,
                permission_request(&a.call_id, title, command, ToolKind::Exec, Vec::new()),
            );
        }
    }

    async fn on_patch_approval(&self, a: PatchApproval) {
        if self.tools.is_pending(&a.call_id) {
            tracing::debug!(call_id = %a.call_id, "Duplicate patch approval request ignored");
            return;
        }
        let summary = summarize_changes(&a.changes);
        let spec = ToolBegin::new(a.call_id.clone(), "ApplyPatch", ToolKind::Patch)
            .with_description("Apply file changes")
            .with_changes(a.changes)
            .requiring_confirmation(true);
        self.tools.begin(spec).await;

        if self.tools.is_pending(&a.call_id) {
            let title = a.reason.unwrap_or_else(|| "Apply file changes".to_string());
            emit_permission_request(
                &self.emitter,
                permission_request(&a.call_id, title, summary, ToolKind::Patch, Vec::new()),
            );
        }
    }

    async fn on_patch_begin(&self, b: PatchBegin) {
        let was_pending = self.tools.is_pending(&b.call_id);
        let summary = summarize_changes(&b.changes);
        let spec = ToolBegin::new(b.call_id.clone(), "ApplyPatch", ToolKind::Patch)
            .with_description(format!("apply_patch auto_approved={}", b.auto_approved))
            .with_changes(b.changes)
            .requiring_confirmation(!b.auto_approved);
        self.tools.begin(spec).await;

        if !b.auto_approved && !was_pending && self.tools.is_pending(&b.call_id) {
            emit_permission_request(
                &self.emitter,
                permission_request(
                    &b.call_id,
                    "Apply file changes",
                    summary,
                    ToolKind::Patch,
                    Vec::new(),
                ),
            );
        }
    }
}

fn mcp_begin(call_id: String, invocation: &McpInvocation) -> ToolBegin {
    let mut spec = ToolBegin::new(call_id, invocation.title(), ToolKind::Mcp).markdown();
    if let Some(args) = &invocation.arguments {
        spec = spec.with_description(args.to_string());
    }
    spec
}

#[async_trait]
impl EventTranslator for CodexTranslator {
    async fn handle_event(&self, event: BackendEvent) -> Vec<BackendCommand> {
        let event_type = event.event_type.clone();
        match CodexEvent::parse(event) {
            Ok(parsed) => self.dispatch(parsed).await,
            Err(e) => {
                tracing::warn!(event_type = %event_type, error = %e, "Malformed codex event dropped");
            }
        }
        Vec::new()
    }

    async fn confirm(&self, call_id: &str, decision: ConfirmDecision) -> Option<BackendCommand> {
        match self.tools.confirm(call_id, decision).await {
            crate::tool_call::ConfirmOutcome::Ignored => None,
            _ => Some(BackendCommand::RespondPermission(PermissionResponse {
                call_id: call_id.to_string(),
                decision,
                option_id: None,
            })),
        }
    }

    fn ends_turn(&self, event_type: &str) -> bool {
        matches!(event_type, "task_complete" | "turn_aborted" | "error")
    }

    fn cleanup(&self) {
        self.text.cleanup();
        self.reasoning.cleanup();
        self.tools.cleanup();
        self.mcp_open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
