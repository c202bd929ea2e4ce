//! # a3s-agent-bridge
//!
//! Session orchestration, event normalization, and patch application for
//! coding-agent backends in the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-agent-bridge` sits between a chat UI and heterogeneous agent
//! backends (a streaming-JSON CLI, agent-client-protocol agents, and a
//! subprocess CLI). It turns each backend's `{type, data}` event stream
//! into one canonical message stream: streaming text that replaces rather
//! than appends, tool calls with monotonic status, and permission requests
//! answered through a single confirmation path.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_agent_bridge::{
//!     BackendKind, BridgeConfig, ConversationRecord, MemoryConnectionFactory,
//!     MemoryConversationStore, MemoryMessageStore, SendMessageRequest, SessionRegistry,
//! };
//!
//! # async fn example() -> a3s_agent_bridge::Result<()> {
//! let registry = SessionRegistry::new(
//!     BridgeConfig::default(),
//!     Arc::new(MemoryConnectionFactory::new()),
//!     Arc::new(MemoryMessageStore::new()),
//!     Arc::new(MemoryConversationStore::new()),
//! );
//!
//! let record = ConversationRecord::new("conv-1", BackendKind::Codex, "/path/to/workspace");
//! registry.resolve("conv-1", &record).await?;
//!
//! let mut events = registry.subscribe();
//! registry
//!     .send_message("conv-1", SendMessageRequest::new("Fix the failing test"))
//!     .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{} {}", event.msg_id, event.message_type());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **codex** — streaming-JSON CLI; the bridge applies approved patches itself
//! - **acp** — agent-client-protocol agents; permission options chosen by kind
//! - **gemini** — subprocess CLI with `default | autoEdit | yolo` approval modes
//!
//! ## Architecture
//!
//! - **SessionRegistry** — conversation id → live session, build-or-reuse
//! - **AgentSession** — status machine, prompt serialization, confirmation routing
//! - **AgentConnection** trait — transport seam each backend implements
//! - **EventTranslator** trait — backend events → canonical messages
//! - **DeltaAccumulator** / **ToolCallLifecycle** — text and tool-call state
//! - **PatchEngine** — unified-diff parsing and workspace application

pub mod backend;
pub mod config;
pub mod delta;
pub mod emitter;
pub mod error;
pub mod patch;
pub mod registry;
pub mod session;
pub mod status;
pub mod store;
pub mod text;
pub mod tool_call;
pub mod types;

// Re-export core types
pub use backend::{
    AgentConnection, BackendCommand, ConnectionFactory, EventReceiver, EventTranslator,
    PermissionResponse, TranslatorContext,
};
pub use config::{ApprovalMode, BackendSettings, BridgeConfig};
pub use delta::{DeltaAccumulator, StreamKind};
pub use emitter::MessageEmitter;
pub use error::{BridgeError, Result};
pub use patch::{ChangeSpec, PatchChangeSet, PatchEngine, PatchError, PatchReport};
pub use registry::SessionRegistry;
pub use session::AgentSession;
pub use status::StatusTracker;
pub use store::{
    ConversationStore, FileConversationStore, MemoryConversationStore, MemoryMessageStore,
    MessageStore,
};
pub use tool_call::{ConfirmOutcome, ToolBegin, ToolCallLifecycle};
pub use types::{
    BackendEvent, BackendKind, CanonicalMessage, ConfirmDecision, ConversationExtra,
    ConversationRecord, MessageContent, MessagePosition, MessageStatus, MessageType,
    PermissionOption, PermissionOptionKind, PermissionRequest, ResponseEvent,
    SendMessageRequest, SendResult, SessionStatus, StatusUpdate, TipsKind, ToolCall, ToolKind,
    ToolStatus,
};

// Re-export the in-process backend for convenience
pub use backend::memory::{MemoryConnection, MemoryConnectionFactory};
