//! Core types for the a3s-agent-bridge system
//!
//! All wire types use camelCase JSON serialization. Canonical payloads are
//! adjacently tagged as `{"type": ..., "data": ...}` so the same content
//! shape is shared by persisted messages and UI response events.

use crate::config::ApprovalMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Which backend family drives a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Streaming JSON event backend
    Codex,
    /// Agent-client-protocol backend (several CLI tools)
    Acp,
    /// Subprocess-driven backend
    Gemini,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Acp => "acp",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session connection status
///
/// Forward path is `initializing → connecting → connected → authenticated →
/// session_active`. `error` is reachable from anywhere, `disconnected` only
/// from `session_active` or `error`, and `error → connecting` is the
/// reconnect edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Connecting,
    Connected,
    Authenticated,
    SessionActive,
    Disconnected,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::SessionActive => "session_active",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }

    /// Whether the status machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (*self, next) {
            (_, Error) => true,
            (SessionActive | Error, Disconnected) => true,
            (Initializing | Error, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Authenticated) => true,
            (Authenticated, SessionActive) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool call status
///
/// `Confirming → Executing → {Success | Error | Canceled}`. Terminal states
/// are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolStatus {
    Confirming,
    Executing,
    Success,
    Error,
    Canceled,
}

impl ToolStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Canceled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Confirming => 0,
            Self::Executing => 1,
            Self::Success | Self::Error | Self::Canceled => 2,
        }
    }

    /// Whether `next` may follow `self`
    ///
    /// Re-emitting the same non-terminal status is allowed (progress
    /// updates); moving backwards or leaving a terminal state is not.
    pub fn can_transition_to(&self, next: ToolStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Confirming => "Confirming",
            Self::Executing => "Executing",
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Canceled => "Canceled",
        };
        f.write_str(s)
    }
}

/// What kind of action a tool call performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Shell command
    Exec,
    /// File mutation through the patch engine
    Patch,
    /// MCP tool invocation
    Mcp,
    WebSearch,
    #[default]
    Generic,
}

/// A single tool invocation as shown to the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: ToolKind,
    pub status: ToolStatus,
    #[serde(default)]
    pub render_output_as_markdown: bool,
    #[serde(default)]
    pub result_display: String,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            description: String::new(),
            kind,
            status: ToolStatus::Executing,
            render_output_as_markdown: false,
            result_display: String::new(),
        }
    }
}

/// Permission option kind offered to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
}

/// One selectable answer to a permission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    pub kind: PermissionOptionKind,
}

impl PermissionOption {
    /// Options offered when the backend supplies none
    pub fn defaults() -> Vec<PermissionOption> {
        vec![
            PermissionOption {
                option_id: "allow_once".to_string(),
                name: "Allow once".to_string(),
                kind: PermissionOptionKind::AllowOnce,
            },
            PermissionOption {
                option_id: "allow_always".to_string(),
                name: "Always allow".to_string(),
                kind: PermissionOptionKind::AllowAlways,
            },
            PermissionOption {
                option_id: "reject_once".to_string(),
                name: "Reject".to_string(),
                kind: PermissionOptionKind::RejectOnce,
            },
        ]
    }
}

/// Payload of a `permission_request` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub call_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub kind: ToolKind,
    pub options: Vec<PermissionOption>,
}

/// Payload of a `status` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub backend: BackendKind,
    pub status: SessionStatus,
    pub message: String,
}

/// Severity of a `tips` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TipsKind {
    #[default]
    Info,
    Warning,
    Error,
    Success,
}

/// Canonical message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    ToolGroup,
    Tips,
    PermissionRequest,
    Status,
    Finish,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::ToolGroup => "tool_group",
            Self::Tips => "tips",
            Self::PermissionRequest => "permission_request",
            Self::Status => "status",
            Self::Finish => "finish",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessageContent {
    Text { content: String },
    ToolGroup(Vec<ToolCall>),
    Tips { content: String, kind: TipsKind },
    PermissionRequest(PermissionRequest),
    Status(StatusUpdate),
    Finish,
    Error { message: String },
}

impl MessageContent {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Text { .. } => MessageType::Text,
            Self::ToolGroup(_) => MessageType::ToolGroup,
            Self::Tips { .. } => MessageType::Tips,
            Self::PermissionRequest(_) => MessageType::PermissionRequest,
            Self::Status(_) => MessageType::Status,
            Self::Finish => MessageType::Finish,
            Self::Error { .. } => MessageType::Error,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn tips(content: impl Into<String>, kind: TipsKind) -> Self {
        Self::Tips {
            content: content.into(),
            kind,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    fn default_position(&self) -> MessagePosition {
        match self {
            Self::Text { .. } | Self::ToolGroup(_) | Self::PermissionRequest(_) => {
                MessagePosition::Left
            }
            Self::Tips { .. } | Self::Status(_) | Self::Finish | Self::Error { .. } => {
                MessagePosition::Center
            }
        }
    }
}

/// Where the UI places a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePosition {
    Left,
    Right,
    Center,
}

/// Delivery state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Done,
    Error,
}

/// Backend-agnostic unit of conversation content
///
/// Identified by `(conversation_id, msg_id)`; upserting the same pair
/// replaces the previous message in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    /// Unique row identifier
    pub id: String,

    /// Stable identity used for replace-in-place upserts
    pub msg_id: String,

    pub conversation_id: String,

    pub position: MessagePosition,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,

    #[serde(flatten)]
    pub content: MessageContent,

    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

impl CanonicalMessage {
    /// Create a message with the default position for its type
    pub fn new(
        conversation_id: impl Into<String>,
        msg_id: impl Into<String>,
        content: MessageContent,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            msg_id: msg_id.into(),
            conversation_id: conversation_id.into(),
            position: content.default_position(),
            status: None,
            content,
            created_at: now_millis(),
        }
    }

    pub fn with_position(mut self, position: MessagePosition) -> Self {
        self.position = position;
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.content.message_type()
    }

    /// Shape this message as a UI response event
    pub fn to_response(&self) -> ResponseEvent {
        ResponseEvent {
            conversation_id: self.conversation_id.clone(),
            msg_id: self.msg_id.clone(),
            content: self.content.clone(),
        }
    }
}

/// Event forwarded to the host UI: `{type, conversation_id, msg_id, data}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub conversation_id: String,
    pub msg_id: String,
    #[serde(flatten)]
    pub content: MessageContent,
}

impl ResponseEvent {
    pub fn message_type(&self) -> MessageType {
        self.content.message_type()
    }
}

/// Raw backend event, already framed by the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl BackendEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// Correlation key for tool-call tracking, when present
    pub fn call_id(&self) -> Option<&str> {
        self.data.get("call_id").and_then(|v| v.as_str())
    }
}

/// Backend-specific settings stored with a conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationExtra {
    /// ACP backend name (e.g. "claude", "qwen")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_mode: Option<ApprovalMode>,
}

/// Durable conversation record used to (re)build sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: BackendKind,

    pub workspace: PathBuf,

    #[serde(default)]
    pub extra: ConversationExtra,

    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub created_at: i64,
}

impl ConversationRecord {
    pub fn new(id: impl Into<String>, kind: BackendKind, workspace: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            kind,
            workspace: workspace.into(),
            extra: ConversationExtra::default(),
            created_at: now_millis(),
        }
    }

    pub fn with_extra(mut self, extra: ConversationExtra) -> Self {
        self.extra = extra;
        self
    }
}

/// Inbound user turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,

    /// Workspace-relative paths attached to the turn
    #[serde(default)]
    pub files: Vec<String>,

    /// Ties the persisted user message back to an optimistic UI entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
}

impl SendMessageRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = Some(msg_id.into());
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }
}

/// Result of `send_message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl SendResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            msg: None,
        }
    }
}

/// User decision on a pending confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmDecision {
    ApproveOnce,
    ApproveForSession,
    Reject,
    Abort,
}

impl ConfirmDecision {
    /// Map a UI confirm key to a decision
    ///
    /// Unrecognized keys reject.
    pub fn from_key(key: &str) -> Self {
        let key = key.to_ascii_lowercase();
        if key.contains("approved_for_session")
            || key.contains("allow_always")
            || key.contains("proceed_always")
        {
            Self::ApproveForSession
        } else if key.contains("allow") || key.contains("proceed") || key.contains("approved") {
            Self::ApproveOnce
        } else if key.contains("abort") {
            Self::Abort
        } else {
            Self::Reject
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::ApproveOnce | Self::ApproveForSession)
    }

    /// Preferred option kind when answering a permission request
    pub fn option_kind(&self) -> PermissionOptionKind {
        match self {
            Self::ApproveOnce => PermissionOptionKind::AllowOnce,
            Self::ApproveForSession => PermissionOptionKind::AllowAlways,
            Self::Reject | Self::Abort => PermissionOptionKind::RejectOnce,
        }
    }
}

/// Current time as Unix milliseconds
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
