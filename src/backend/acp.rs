//! Agent-client-protocol event translation
//!
//! ACP agents report everything through `session_update` notifications
//! plus explicit permission requests carrying their own option list. The
//! agent applies its own edits, so no change sets are cached here.

use super::{
    emit_error, emit_permission_request, payload_message, permission_request, select_option,
    BackendCommand, EventTranslator, PermissionResponse, TranslatorContext,
};
use crate::delta::{DeltaAccumulator, StreamKind};
use crate::emitter::MessageEmitter;
use crate::text::error_msg_id;
use crate::tool_call::{ToolBegin, ToolCallLifecycle};
use crate::types::{
    BackendEvent, ConfirmDecision, MessageContent, PermissionOption, ToolKind, ToolStatus,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

/// One entry of a tool call's `content` list
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolContent {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<ContentBlock>,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallUpdate {
    tool_call_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    content: Option<Vec<ToolContent>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanEntry {
    content: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    priority: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommandInput {
    #[serde(default)]
    hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AvailableCommand {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input: Option<CommandInput>,
}

/// `session_update` payload, discriminated by `sessionUpdate`
#[derive(Debug, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
enum SessionUpdate {
    AgentMessageChunk {
        #[serde(default)]
        content: ContentBlock,
    },
    AgentThoughtChunk {
        #[serde(default)]
        content: ContentBlock,
    },
    ToolCall(ToolCallUpdate),
    ToolCallUpdate(ToolCallUpdate),
    Plan {
        #[serde(default)]
        entries: Vec<PlanEntry>,
    },
    AvailableCommandsUpdate {
        #[serde(default, rename = "availableCommands")]
        available_commands: Vec<AvailableCommand>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionToolCall {
    tool_call_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    raw_input: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcpPermissionRequest {
    tool_call: PermissionToolCall,
    #[serde(default)]
    options: Vec<PermissionOption>,
}

/// ACP event vocabulary
#[derive(Debug)]
enum AcpEvent {
    SessionUpdate(SessionUpdate),
    PermissionRequest(AcpPermissionRequest),
    PromptComplete(Option<String>),
    Error(String),
    Unknown(String),
}

impl AcpEvent {
    fn parse(event: BackendEvent) -> serde_json::Result<Self> {
        let BackendEvent { event_type, data } = event;
        let parsed = match event_type.as_str() {
            "session_update" => {
                // Notifications wrap the update; accept it bare as well
                let update = match data.get("update") {
                    Some(inner) => inner.clone(),
                    None => data,
                };
                Self::SessionUpdate(serde_json::from_value(update)?)
            }
            "permission_request" => Self::PermissionRequest(serde_json::from_value(data)?),
            "prompt_complete" => Self::PromptComplete(
                data.get("stopReason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            "error" => Self::Error(payload_message(&data)),
            _ => Self::Unknown(event_type),
        };
        Ok(parsed)
    }
}

fn tool_kind(kind: Option<&str>) -> ToolKind {
    match kind {
        Some("edit") | Some("delete") | Some("move") => ToolKind::Patch,
        Some("execute") => ToolKind::Exec,
        Some("fetch") => ToolKind::WebSearch,
        _ => ToolKind::Generic,
    }
}

/// ACP status string to tool status
///
/// `pending` maps to Confirming without joining the pending set; only a
/// permission request does that.
fn tool_status(status: &str) -> Option<ToolStatus> {
    match status {
        "pending" => Some(ToolStatus::Confirming),
        "in_progress" => Some(ToolStatus::Executing),
        "completed" => Some(ToolStatus::Success),
        "failed" => Some(ToolStatus::Error),
        _ => None,
    }
}

fn render_tool_content(content: &[ToolContent]) -> Option<String> {
    let parts: Vec<String> = content
        .iter()
        .filter_map(|c| match c.kind.as_str() {
            "diff" => c.path.as_ref().map(|p| format!("diff: {}", p)),
            _ => c.content.as_ref().and_then(|b| b.text.clone()),
        })
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn render_plan(entries: &[PlanEntry]) -> Option<String> {
    if entries.is_empty() {
        return None;
    }
    let lines: Vec<String> = entries
        .iter()
        .map(|entry| {
            let icon = match entry.status.as_str() {
                "completed" => "✅",
                "in_progress" => "🔄",
                _ => "⏳",
            };
            match &entry.priority {
                Some(p) => format!("{} {} [{}]", icon, entry.content, p.to_uppercase()),
                None => format!("{} {}", icon, entry.content),
            }
        })
        .collect();
    Some(format!("📋 **Plan Update**\n\n{}", lines.join("\n")))
}

fn render_commands(commands: &[AvailableCommand]) -> Option<String> {
    if commands.is_empty() {
        return None;
    }
    let lines: Vec<String> = commands
        .iter()
        .map(|cmd| {
            let mut line = format!("• **{}**: {}", cmd.name, cmd.description);
            if let Some(hint) = cmd.input.as_ref().and_then(|i| i.hint.as_ref()) {
                line.push_str(&format!(" ({})", hint));
            }
            line
        })
        .collect();
    Some(format!("🛠️ **Available Commands**\n\n{}", lines.join("\n")))
}

/// Translator for agent-client-protocol backends
pub struct AcpTranslator {
    emitter: MessageEmitter,
    text: DeltaAccumulator,
    reasoning: DeltaAccumulator,
    tools: ToolCallLifecycle,
    /// Options offered per pending call
    options: Mutex<HashMap<String, Vec<PermissionOption>>>,
}

impl AcpTranslator {
    pub fn new(ctx: TranslatorContext) -> Self {
        Self {
            text: DeltaAccumulator::new(ctx.emitter.clone(), ctx.idle),
            reasoning: DeltaAccumulator::with_kind(
                ctx.emitter.clone(),
                StreamKind::Reasoning,
                ctx.idle,
            ),
            tools: ToolCallLifecycle::new(ctx.emitter.clone(), ctx.workspace),
            emitter: ctx.emitter,
            options: Mutex::new(HashMap::new()),
        }
    }

    fn close_reasoning(&self) {
        if self.reasoning.is_open() {
            self.reasoning.finalize_message(None);
        }
    }

    fn emit_text(&self, content: String) {
        let msg = self
            .emitter
            .message(uuid::Uuid::new_v4().to_string(), MessageContent::text(content));
        self.emitter.emit_and_persist(msg);
    }

    async fn dispatch(&self, event: AcpEvent) {
        match event {
            AcpEvent::SessionUpdate(update) => self.on_session_update(update).await,
            AcpEvent::PermissionRequest(req) => self.on_permission_request(req).await,
            AcpEvent::PromptComplete(reason) => {
                tracing::debug!(stop_reason = ?reason, "ACP prompt complete");
                self.close_reasoning();
                self.text.task_complete();
            }
            AcpEvent::Error(message) => {
                tracing::warn!(error = %message, "ACP backend reported an error");
                emit_error(&self.emitter, error_msg_id(&message), &message);
                self.close_reasoning();
                self.text.task_complete();
            }
            AcpEvent::Unknown(kind) => {
                tracing::warn!(event_type = %kind, "Unknown ACP event dropped");
            }
        }
    }

    async fn on_session_update(&self, update: SessionUpdate) {
        match update {
            SessionUpdate::AgentMessageChunk { content } => {
                if let Some(text) = content.text {
                    self.close_reasoning();
                    self.text.push_delta(&text);
                }
            }
            SessionUpdate::AgentThoughtChunk { content } => {
                if let Some(text) = content.text {
                    self.reasoning.push_delta(&text);
                }
            }
            SessionUpdate::ToolCall(call) => {
                let status = call.status.as_deref().and_then(tool_status);
                let display = call.content.as_deref().and_then(render_tool_content);
                let mut spec = ToolBegin::new(
                    call.tool_call_id.clone(),
                    call.title.clone().unwrap_or_default(),
                    tool_kind(call.kind.as_deref()),
                )
                .with_description(call.title.unwrap_or_default());
                if let Some(status) = status.filter(|s| !s.is_terminal()) {
                    spec = spec.with_status(status);
                }
                if let Some(display) = display.clone() {
                    spec = spec.with_result_display(display);
                }
                self.tools.begin(spec).await;

                if let Some(terminal) = status.filter(|s| s.is_terminal()) {
                    self.tools.progress(&call.tool_call_id, terminal, display);
                }
            }
            SessionUpdate::ToolCallUpdate(update) => {
                if self.tools.get(&update.tool_call_id).is_none() {
                    tracing::warn!(
                        call_id = %update.tool_call_id,
                        "Update for unknown ACP tool call dropped"
                    );
                    return;
                }
                let display = update.content.as_deref().and_then(render_tool_content);
                match update.status.as_deref().and_then(tool_status) {
                    Some(status) => self.tools.progress(&update.tool_call_id, status, display),
                    None => {
                        if let Some(call) = self.tools.get(&update.tool_call_id) {
                            self.tools.progress(&update.tool_call_id, call.status, display);
                        }
                    }
                }
                if self
                    .tools
                    .get(&update.tool_call_id)
                    .map_or(false, |c| c.status.is_terminal())
                {
                    self.take_options(&update.tool_call_id);
                }
            }
            SessionUpdate::Plan { entries } => {
                if let Some(plan) = render_plan(&entries) {
                    self.emit_text(plan);
                }
            }
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                if let Some(list) = render_commands(&available_commands) {
                    self.emit_text(list);
                }
            }
            SessionUpdate::Other => {
                tracing::debug!("ACP session update ignored");
            }
        }
    }

    async fn on_permission_request(&self, req: AcpPermissionRequest) {
        let call_id = req.tool_call.tool_call_id.clone();
        if self.tools.is_pending(&call_id) {
            tracing::debug!(call_id = %call_id, "Duplicate ACP permission request ignored");
            return;
        }

        let kind = tool_kind(req.tool_call.kind.as_deref());
        let title = req
            .tool_call
            .title
            .clone()
            .unwrap_or_else(|| "Permission required".to_string());
        let description = req
            .tool_call
            .raw_input
            .as_ref()
            .and_then(|input| {
                input
                    .get("command")
                    .or_else(|| input.get("description"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();

        if !self.tools.request_confirmation(&call_id) {
            let spec = ToolBegin::new(call_id.clone(), title.clone(), kind)
                .with_description(description.clone())
                .requiring_confirmation(true);
            self.tools.begin(spec).await;
        }
        if !self.tools.is_pending(&call_id) {
            return;
        }

        self.options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(call_id.clone(), req.options.clone());
        emit_permission_request(
            &self.emitter,
            permission_request(&call_id, title, description, kind, req.options),
        );
    }

    fn take_options(&self, call_id: &str) -> Option<Vec<PermissionOption>> {
        self.options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(call_id)
    }
}

#[async_trait]
impl EventTranslator for AcpTranslator {
    async fn handle_event(&self, event: BackendEvent) -> Vec<BackendCommand> {
        let event_type = event.event_type.clone();
        match AcpEvent::parse(event) {
            Ok(parsed) => self.dispatch(parsed).await,
            Err(e) => {
                tracing::warn!(event_type = %event_type, error = %e, "Malformed ACP event dropped");
            }
        }
        Vec::new()
    }

    async fn confirm(&self, call_id: &str, decision: ConfirmDecision) -> Option<BackendCommand> {
        match self.tools.confirm(call_id, decision).await {
            crate::tool_call::ConfirmOutcome::Ignored => None,
            _ => {
                let options = self
                    .take_options(call_id)
                    .filter(|o| !o.is_empty())
                    .unwrap_or_else(PermissionOption::defaults);
                Some(BackendCommand::RespondPermission(PermissionResponse {
                    call_id: call_id.to_string(),
                    decision,
                    option_id: select_option(&options, decision),
                }))
            }
        }
    }

    fn ends_turn(&self, event_type: &str) -> bool {
        matches!(event_type, "prompt_complete" | "error")
    }

    fn cleanup(&self) {
        self.text.cleanup();
        self.reasoning.cleanup();
        self.tools.cleanup();
        self.options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
