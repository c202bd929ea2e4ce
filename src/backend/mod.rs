//! Backend connections and event translators
//!
//! A backend is reached through an `AgentConnection`, which hands the
//! session already-framed `{type, data}` events. Each backend kind has an
//! `EventTranslator` that maps its vocabulary onto the delta accumulator,
//! the tool-call lifecycle and canonical message emission.

use crate::config::{ApprovalMode, BridgeConfig};
use crate::emitter::MessageEmitter;
use crate::error::Result;
use crate::types::{
    BackendEvent, BackendKind, ConfirmDecision, ConversationRecord, MessageContent,
    PermissionOption, PermissionOptionKind, PermissionRequest, ToolKind,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub mod acp;
pub mod codex;
pub mod gemini;
pub mod memory;

/// Stream of decoded backend events
pub type EventReceiver = mpsc::UnboundedReceiver<BackendEvent>;

/// Answer to a backend permission request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub call_id: String,
    pub decision: ConfirmDecision,
    /// Backend option the decision resolved to, when the backend offers options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_id: Option<String>,
}

/// Action a translator asks the session to perform on its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCommand {
    RespondPermission(PermissionResponse),
}

/// Transport to one backend agent
///
/// Wire framing is the implementation's concern; the session only sees
/// decoded events.
#[async_trait]
pub trait AgentConnection: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Open the transport and return its event stream
    ///
    /// The stream closing means the backend went away.
    async fn connect(&self) -> Result<EventReceiver>;

    /// Authenticate with the backend
    ///
    /// Default implementation does nothing.
    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    /// Open a backend session rooted at `workspace`, returning its id
    async fn new_session(&self, workspace: &Path) -> Result<String>;

    /// Send a user prompt; resolves once the backend accepted the turn
    ///
    /// The turn itself stays open until the translator sees an event for
    /// which `EventTranslator::ends_turn` holds.
    async fn send_prompt(&self, prompt: &str) -> Result<()>;

    async fn respond_permission(&self, response: &PermissionResponse) -> Result<()>;

    /// Cancel the in-flight turn
    async fn cancel(&self) -> Result<()>;

    /// Terminate the backend process or connection
    async fn shutdown(&self) -> Result<()>;
}

/// Builds connections for conversation records
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        record: &ConversationRecord,
        config: &BridgeConfig,
    ) -> Result<Arc<dyn AgentConnection>>;
}

/// Per-backend mapping from raw events to canonical messages
#[async_trait]
pub trait EventTranslator: Send + Sync {
    /// Handle one backend event
    ///
    /// Unknown or malformed events are logged and dropped. Returned commands
    /// must be forwarded to the connection in order.
    async fn handle_event(&self, event: BackendEvent) -> Vec<BackendCommand>;

    /// Resolve a pending confirmation
    ///
    /// Returns the command answering the backend, or `None` when the call
    /// was not pending.
    async fn confirm(&self, call_id: &str, decision: ConfirmDecision) -> Option<BackendCommand>;

    /// Whether an event of this type closes the current turn
    fn ends_turn(&self, event_type: &str) -> bool;

    /// Cancel timers and release every buffer without emitting
    fn cleanup(&self);
}

/// Everything a translator needs from its session
#[derive(Clone)]
pub struct TranslatorContext {
    pub emitter: MessageEmitter,
    pub workspace: PathBuf,
    pub idle: Duration,
    pub approval_mode: ApprovalMode,
}

impl TranslatorContext {
    pub fn new(emitter: MessageEmitter, record: &ConversationRecord, config: &BridgeConfig) -> Self {
        Self {
            emitter,
            workspace: record.workspace.clone(),
            idle: config.idle_finalize(),
            approval_mode: record.extra.approval_mode.unwrap_or(config.approval_mode),
        }
    }
}

/// Translator for the record's backend kind
pub fn translator_for(kind: BackendKind, ctx: TranslatorContext) -> Arc<dyn EventTranslator> {
    match kind {
        BackendKind::Codex => Arc::new(codex::CodexTranslator::new(ctx)),
        BackendKind::Acp => Arc::new(acp::AcpTranslator::new(ctx)),
        BackendKind::Gemini => Arc::new(gemini::GeminiTranslator::new(ctx)),
    }
}

/// Emit and persist a `permission_request` message for a call
pub(crate) fn emit_permission_request(emitter: &MessageEmitter, request: PermissionRequest) {
    let msg_id = format!("permission_{}", request.call_id);
    let message = emitter.message(msg_id, MessageContent::PermissionRequest(request));
    emitter.emit_and_persist(message);
}

/// Option id matching a decision
///
/// Falls back to the one-shot variant of the same polarity when the
/// backend did not offer the exact kind.
pub(crate) fn select_option(
    options: &[PermissionOption],
    decision: ConfirmDecision,
) -> Option<String> {
    let preferred = decision.option_kind();
    let fallback = match preferred {
        PermissionOptionKind::AllowAlways => PermissionOptionKind::AllowOnce,
        PermissionOptionKind::RejectOnce => PermissionOptionKind::RejectAlways,
        other => other,
    };
    options
        .iter()
        .find(|o| o.kind == preferred)
        .or_else(|| options.iter().find(|o| o.kind == fallback))
        .map(|o| o.option_id.clone())
}

/// Build a permission request with the given options, or the defaults
pub(crate) fn permission_request(
    call_id: &str,
    title: impl Into<String>,
    description: impl Into<String>,
    kind: ToolKind,
    options: Vec<PermissionOption>,
) -> PermissionRequest {
    PermissionRequest {
        call_id: call_id.to_string(),
        title: title.into(),
        description: description.into(),
        kind,
        options: if options.is_empty() {
            PermissionOption::defaults()
        } else {
            options
        },
    }
}

/// Emit and persist an error message under a content-derived id
pub(crate) fn emit_error(emitter: &MessageEmitter, msg_id: String, message: &str) {
    let msg = emitter
        .message(msg_id, MessageContent::error(message))
        .with_position(crate::types::MessagePosition::Center);
    emitter.emit_and_persist(msg);
}

/// Error text from a string payload or an object with a `message` field
pub(crate) fn payload_message(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}
