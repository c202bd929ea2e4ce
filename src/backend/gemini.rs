//! Subprocess (gemini) event translation
//!
//! The subprocess resends whole tool groups as their entries progress, so
//! each entry is synced into the lifecycle and stale statuses are dropped
//! by its monotonicity check. Confirmations may be answered automatically
//! depending on the session's approval mode.

use super::{
    emit_error, emit_permission_request, payload_message, permission_request, select_option,
    BackendCommand, EventTranslator, PermissionResponse, TranslatorContext,
};
use crate::config::ApprovalMode;
use crate::delta::DeltaAccumulator;
use crate::emitter::MessageEmitter;
use crate::text::{error_msg_id, strip_think_tags};
use crate::tool_call::{ToolBegin, ToolCallLifecycle};
use crate::types::{
    BackendEvent, ConfirmDecision, MessageContent, MessagePosition, PermissionOption,
    PermissionOptionKind, TipsKind, ToolKind, ToolStatus,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Mutex;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmationDetails {
    /// edit | exec | info | mcp
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    urls: Option<Vec<String>>,
    #[serde(default)]
    server_name: Option<String>,
    #[serde(default)]
    tool_name: Option<String>,
}

impl ConfirmationDetails {
    fn tool_kind(&self) -> ToolKind {
        match self.kind.as_str() {
            "edit" => ToolKind::Patch,
            "exec" => ToolKind::Exec,
            "mcp" => ToolKind::Mcp,
            _ => ToolKind::Generic,
        }
    }

    fn description(&self) -> Option<String> {
        match self.kind.as_str() {
            "edit" => self.file_name.clone(),
            "exec" => self.command.clone(),
            "info" => self
                .urls
                .as_ref()
                .filter(|u| !u.is_empty())
                .map(|u| u.join(";"))
                .or_else(|| self.prompt.clone()),
            _ => match (&self.server_name, &self.tool_name) {
                (Some(server), Some(tool)) => Some(format!("{}:{}", server, tool)),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolEntry {
    call_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    result_display: Option<Value>,
    #[serde(default)]
    render_output_as_markdown: bool,
    #[serde(default)]
    confirmation_details: Option<ConfirmationDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct Thought {
    #[serde(default)]
    subject: String,
    #[serde(default)]
    description: String,
}

/// Gemini event vocabulary
#[derive(Debug)]
enum GeminiEvent {
    Start,
    Content(String),
    Thought(Thought),
    ToolGroup(Vec<ToolEntry>),
    Finish,
    Error(String),
    Finished,
    Unknown(String),
}

impl GeminiEvent {
    fn parse(event: BackendEvent) -> serde_json::Result<Self> {
        let BackendEvent { event_type, data } = event;
        let parsed = match event_type.as_str() {
            "start" => Self::Start,
            "content" => Self::Content(match data {
                Value::String(s) => s,
                other => other
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "thought" => Self::Thought(serde_json::from_value(data)?),
            "tool_group" => Self::ToolGroup(serde_json::from_value(data)?),
            "finish" => Self::Finish,
            "error" => Self::Error(payload_message(&data)),
            "finished" => Self::Finished,
            _ => Self::Unknown(event_type),
        };
        Ok(parsed)
    }
}

fn entry_status(status: &str) -> Option<ToolStatus> {
    match status {
        "Pending" | "Confirming" => Some(ToolStatus::Confirming),
        "Executing" => Some(ToolStatus::Executing),
        "Success" => Some(ToolStatus::Success),
        "Error" => Some(ToolStatus::Error),
        "Canceled" => Some(ToolStatus::Canceled),
        _ => None,
    }
}

/// Result display as text; structured displays (file diffs) are shown as JSON
fn render_display(display: &Value) -> Option<String> {
    match display {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(
            other
                .get("fileDiff")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    }
}

/// Options the subprocess understands
fn gemini_options() -> Vec<PermissionOption> {
    vec![
        PermissionOption {
            option_id: "proceed_once".to_string(),
            name: "Yes, allow once".to_string(),
            kind: PermissionOptionKind::AllowOnce,
        },
        PermissionOption {
            option_id: "proceed_always".to_string(),
            name: "Yes, allow always".to_string(),
            kind: PermissionOptionKind::AllowAlways,
        },
        PermissionOption {
            option_id: "cancel".to_string(),
            name: "No".to_string(),
            kind: PermissionOptionKind::RejectOnce,
        },
    ]
}

/// Whether the approval mode answers this confirmation without the user
fn auto_approves(mode: ApprovalMode, confirmation_kind: &str) -> bool {
    match mode {
        ApprovalMode::Yolo => true,
        ApprovalMode::AutoEdit => matches!(confirmation_kind, "edit" | "info"),
        ApprovalMode::Default => false,
    }
}

/// Translator for the subprocess backend
pub struct GeminiTranslator {
    emitter: MessageEmitter,
    approval_mode: ApprovalMode,
    text: DeltaAccumulator,
    tools: ToolCallLifecycle,
    /// UI-only thought line of the current turn
    thought_id: Mutex<Option<String>>,
}

impl GeminiTranslator {
    pub fn new(ctx: TranslatorContext) -> Self {
        Self {
            text: DeltaAccumulator::new(ctx.emitter.clone(), ctx.idle)
                .with_display_filter(strip_think_tags),
            tools: ToolCallLifecycle::new(ctx.emitter.clone(), ctx.workspace),
            approval_mode: ctx.approval_mode,
            emitter: ctx.emitter,
            thought_id: Mutex::new(None),
        }
    }

    fn reset_thought(&self) {
        *self.thought_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn emit_thought(&self, thought: Thought) {
        let msg_id = self
            .thought_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        let text = if thought.subject.is_empty() {
            thought.description
        } else {
            format!("**{}** {}", thought.subject, thought.description)
        };
        let msg = self
            .emitter
            .message(msg_id, MessageContent::tips(text.trim(), TipsKind::Info))
            .with_position(MessagePosition::Center);
        self.emitter.emit(&msg);
    }

    async fn dispatch(&self, event: GeminiEvent) -> Vec<BackendCommand> {
        match event {
            GeminiEvent::Start => {
                tracing::debug!("Gemini turn started");
            }
            GeminiEvent::Content(delta) => self.text.push_delta(&delta),
            GeminiEvent::Thought(thought) => self.emit_thought(thought),
            GeminiEvent::ToolGroup(entries) => {
                let mut commands = Vec::new();
                for entry in entries {
                    if let Some(cmd) = self.sync_entry(entry).await {
                        commands.push(cmd);
                    }
                }
                return commands;
            }
            GeminiEvent::Finish => {
                self.reset_thought();
                self.text.task_complete();
            }
            GeminiEvent::Error(message) => {
                tracing::warn!(error = %message, "Gemini reported an error");
                emit_error(&self.emitter, error_msg_id(&message), &message);
                self.reset_thought();
                self.text.task_complete();
            }
            GeminiEvent::Finished => {
                tracing::debug!("Gemini usage report ignored");
            }
            GeminiEvent::Unknown(kind) => {
                tracing::warn!(event_type = %kind, "Unknown gemini event dropped");
            }
        }
        Vec::new()
    }

    /// Sync one tool entry into the lifecycle
    async fn sync_entry(&self, entry: ToolEntry) -> Option<BackendCommand> {
        let Some(status) = entry_status(&entry.status) else {
            tracing::debug!(call_id = %entry.call_id, status = %entry.status, "Unknown tool status");
            return None;
        };
        let details = entry.confirmation_details.unwrap_or_default();
        let kind = details.tool_kind();
        let display = entry.result_display.as_ref().and_then(render_display);

        let mut spec = ToolBegin::new(entry.call_id.clone(), entry.name.clone(), kind)
            .with_description(entry.description.clone());
        if entry.render_output_as_markdown {
            spec = spec.markdown();
        }
        if let Some(display) = display.clone() {
            spec = spec.with_result_display(display);
        }

        let awaiting_user = entry.status == "Confirming";
        if awaiting_user {
            if self.tools.is_pending(&entry.call_id) {
                return None;
            }
            self.tools.begin(spec.requiring_confirmation(true)).await;
            if !self.tools.is_pending(&entry.call_id) {
                return None;
            }
            if auto_approves(self.approval_mode, &details.kind) {
                tracing::info!(
                    call_id = %entry.call_id,
                    mode = ?self.approval_mode,
                    "Tool call auto-approved"
                );
                return self.confirm(&entry.call_id, ConfirmDecision::ApproveOnce).await;
            }
            let title = details
                .title
                .clone()
                .unwrap_or_else(|| "Awaiting Confirmation".to_string());
            let description = details
                .description()
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| {
                    if entry.description.is_empty() {
                        entry.name.clone()
                    } else {
                        entry.description.clone()
                    }
                });
            emit_permission_request(
                &self.emitter,
                permission_request(&entry.call_id, title, description, kind, gemini_options()),
            );
            return None;
        }

        if status.is_terminal() {
            if self.tools.get(&entry.call_id).is_none() {
                self.tools.begin(spec).await;
            }
            self.tools.progress(&entry.call_id, status, display);
        } else {
            self.tools.begin(spec.with_status(status)).await;
        }
        None
    }
}

#[async_trait]
impl EventTranslator for GeminiTranslator {
    async fn handle_event(&self, event: BackendEvent) -> Vec<BackendCommand> {
        let event_type = event.event_type.clone();
        match GeminiEvent::parse(event) {
            Ok(parsed) => self.dispatch(parsed).await,
            Err(e) => {
                tracing::warn!(event_type = %event_type, error = %e, "Malformed gemini event dropped");
                Vec::new()
            }
        }
    }

    async fn confirm(&self, call_id: &str, decision: ConfirmDecision) -> Option<BackendCommand> {
        match self.tools.confirm(call_id, decision).await {
            crate::tool_call::ConfirmOutcome::Ignored => None,
            _ => Some(BackendCommand::RespondPermission(PermissionResponse {
                call_id: call_id.to_string(),
                decision,
                option_id: select_option(&gemini_options(), decision),
            })),
        }
    }

    fn ends_turn(&self, event_type: &str) -> bool {
        matches!(event_type, "finish" | "error")
    }

    fn cleanup(&self) {
        self.text.cleanup();
        self.tools.cleanup();
        self.reset_thought();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMessageStore;
    use crate::types::{CanonicalMessage, MessageType, ResponseEvent};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Harness {
        translator: GeminiTranslator,
        emitter: MessageEmitter,
        store: Arc<MemoryMessageStore>,
        rx: broadcast::Receiver<ResponseEvent>,
    }

    fn harness(mode: ApprovalMode) -> Harness {
        let store = Arc::new(MemoryMessageStore::new());
        let (tx, rx) = broadcast::channel(256);
        let emitter = MessageEmitter::new("conv", store.clone(), tx);
        let ctx = TranslatorContext {
            emitter: emitter.clone(),
            workspace: std::env::temp_dir(),
            idle: Duration::from_secs(3),
            approval_mode: mode,
        };
        Harness {
            translator: GeminiTranslator::new(ctx),
            emitter,
            store,
            rx,
        }
    }

    impl Harness {
        async fn send(&self, event_type: &str, data: Value) -> Vec<BackendCommand> {
            self.translator
                .handle_event(BackendEvent::new(event_type, data))
                .await
        }

        async fn stored_of(&self, kind: MessageType) -> Vec<CanonicalMessage> {
            self.emitter.flush().await;
            self.store
                .list("conv")
                .await
                .into_iter()
                .filter(|m| m.message_type() == kind)
                .collect()
        }
    }

    fn confirming_entry(call_id: &str, kind: &str) -> Value {
        json!([{
            "callId": call_id,
            "name": "WriteFile",
            "description": "Writing notes.md",
            "status": "Confirming",
            "confirmationDetails": {"type": kind, "title": "Confirm", "fileName": "notes.md", "command": "ls"}
        }])
    }

    #[tokio::test]
    async fn test_content_strips_think_tags() {
        let h = harness(ApprovalMode::Default);
        h.send("start", json!(null)).await;
        h.send("content", json!("<think>plan</think>Hello")).await;
        h.send("content", json!(" world")).await;
        h.send("finish", json!(null)).await;

        let texts = h.stored_of(MessageType::Text).await;
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].content, MessageContent::text("Hello world"));
    }

    #[tokio::test]
    async fn test_thoughts_are_ui_only_and_share_an_id() {
        let mut h = harness(ApprovalMode::Default);
        h.send("thought", json!({"subject": "Planning", "description": "step 1"}))
            .await;
        h.send("thought", json!({"subject": "Planning", "description": "step 2"}))
            .await;

        let first = h.rx.recv().await.unwrap();
        let second = h.rx.recv().await.unwrap();
        assert_eq!(first.message_type(), MessageType::Tips);
        assert_eq!(first.msg_id, second.msg_id);
        assert!(h.stored_of(MessageType::Tips).await.is_empty());
    }

    #[tokio::test]
    async fn test_confirming_entry_asks_user_in_default_mode() {
        let h = harness(ApprovalMode::Default);
        let commands = h.send("tool_group", confirming_entry("g1", "edit")).await;
        assert!(commands.is_empty());
        assert!(h.translator.tools.is_pending("g1"));

        // The group is resent while waiting; no second request
        h.send("tool_group", confirming_entry("g1", "edit")).await;
        let permissions = h.stored_of(MessageType::PermissionRequest).await;
        assert_eq!(permissions.len(), 1);
        match &permissions[0].content {
            MessageContent::PermissionRequest(req) => {
                assert_eq!(req.description, "notes.md");
                assert_eq!(req.options[0].option_id, "proceed_once");
            }
            other => panic!("unexpected content: {other:?}"),
        }

        let cmd = h
            .translator
            .confirm("g1", ConfirmDecision::from_key("proceed_always"))
            .await;
        match cmd {
            Some(BackendCommand::RespondPermission(resp)) => {
                assert_eq!(resp.option_id.as_deref(), Some("proceed_always"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auto_edit_approves_edits_only() {
        let h = harness(ApprovalMode::AutoEdit);
        let commands = h.send("tool_group", confirming_entry("g1", "edit")).await;
        assert_eq!(
            commands,
            vec![BackendCommand::RespondPermission(PermissionResponse {
                call_id: "g1".to_string(),
                decision: ConfirmDecision::ApproveOnce,
                option_id: Some("proceed_once".to_string()),
            })]
        );
        assert_eq!(
            h.translator.tools.get("g1").unwrap().status,
            ToolStatus::Executing
        );

        let commands = h.send("tool_group", confirming_entry("g2", "exec")).await;
        assert!(commands.is_empty());
        assert!(h.translator.tools.is_pending("g2"));
    }

    #[tokio::test]
    async fn test_yolo_approves_everything() {
        let h = harness(ApprovalMode::Yolo);
        let commands = h.send("tool_group", confirming_entry("g1", "mcp")).await;
        assert_eq!(commands.len(), 1);
        assert!(h
            .stored_of(MessageType::PermissionRequest)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_stale_status_discarded() {
        let h = harness(ApprovalMode::Default);
        let entry = |status: &str| {
            json!([{"callId": "g1", "name": "ReadFile", "status": status, "resultDisplay": status}])
        };
        h.send("tool_group", entry("Executing")).await;
        h.send("tool_group", entry("Success")).await;
        h.send("tool_group", entry("Executing")).await;

        let call = h.translator.tools.get("g1").unwrap();
        assert_eq!(call.status, ToolStatus::Success);
        assert_eq!(call.result_display, "Success");
    }

    #[tokio::test]
    async fn test_pending_entry_is_not_awaiting_user() {
        let h = harness(ApprovalMode::Default);
        h.send(
            "tool_group",
            json!([{"callId": "g1", "name": "Shell", "status": "Pending"}]),
        )
        .await;
        assert_eq!(
            h.translator.tools.get("g1").unwrap().status,
            ToolStatus::Confirming
        );
        assert!(!h.translator.tools.is_pending("g1"));
    }

    #[tokio::test]
    async fn test_error_event_finishes_turn() {
        let h = harness(ApprovalMode::Default);
        h.send("content", json!("partial")).await;
        h.send("error", json!({"message": "quota exceeded"})).await;

        let errors = h.stored_of(MessageType::Error).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].msg_id.starts_with("error_"));
        assert!(!h.translator.text.is_open());
    }

    #[test]
    fn test_auto_approves() {
        assert!(auto_approves(ApprovalMode::Yolo, "exec"));
        assert!(auto_approves(ApprovalMode::AutoEdit, "info"));
        assert!(!auto_approves(ApprovalMode::AutoEdit, "mcp"));
        assert!(!auto_approves(ApprovalMode::Default, "edit"));
    }

    #[tokio::test]
    async fn test_turn_end_events() {
        let h = harness(ApprovalMode::Default);
        assert!(h.translator.ends_turn("finish"));
        assert!(h.translator.ends_turn("error"));
        assert!(!h.translator.ends_turn("content"));
        assert!(!h.translator.ends_turn("tool_group"));
        assert!(!h.translator.ends_turn("finished"));
    }
}
