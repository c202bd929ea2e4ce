//! In-process backend connection
//!
//! Useful for tests and for embedding an agent that lives in the same
//! process. The holder injects `{type, data}` events and inspects what the
//! session sent.

use super::{AgentConnection, ConnectionFactory, EventReceiver, PermissionResponse};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::types::{BackendEvent, BackendKind, ConversationRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Events to send back for a prompt
pub type Responder = Arc<dyn Fn(&str) -> Vec<BackendEvent> + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    sender: Option<mpsc::UnboundedSender<BackendEvent>>,
    prompts: Vec<String>,
    responses: Vec<PermissionResponse>,
    workspace: Option<PathBuf>,
    cancels: usize,
    shut_down: bool,
    connects: usize,
}

/// In-memory connection
///
/// Clones share state, so a test can keep one clone as a handle while the
/// session owns another.
#[derive(Clone)]
pub struct MemoryConnection {
    kind: BackendKind,
    fail_connect: Option<String>,
    responder: Option<Responder>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            fail_connect: None,
            responder: None,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Make `connect` fail with `reason`
    pub fn failing_connect(mut self, reason: impl Into<String>) -> Self {
        self.fail_connect = Some(reason.into());
        self
    }

    /// Reply to every prompt with the events `responder` returns
    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push an event to the session; false when not connected
    pub fn inject(&self, event: BackendEvent) -> bool {
        match &self.lock().sender {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the event stream, as if the backend process exited
    pub fn close(&self) {
        self.lock().sender = None;
    }

    pub fn prompts(&self) -> Vec<String> {
        self.lock().prompts.clone()
    }

    pub fn responses(&self) -> Vec<PermissionResponse> {
        self.lock().responses.clone()
    }

    pub fn workspace(&self) -> Option<PathBuf> {
        self.lock().workspace.clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.lock().cancels
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    fn ensure_connected(&self) -> Result<()> {
        let state = self.lock();
        if state.shut_down {
            return Err(BridgeError::Connection("Connection shut down".to_string()));
        }
        if state.sender.is_none() {
            return Err(BridgeError::Connection("Not connected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentConnection for MemoryConnection {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn connect(&self) -> Result<EventReceiver> {
        let mut state = self.lock();
        state.connects += 1;
        if let Some(reason) = &self.fail_connect {
            return Err(BridgeError::Connection(reason.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.sender = Some(tx);
        state.shut_down = false;
        Ok(rx)
    }

    async fn new_session(&self, workspace: &Path) -> Result<String> {
        self.ensure_connected()?;
        self.lock().workspace = Some(workspace.to_path_buf());
        Ok(uuid::Uuid::new_v4().to_string())
    }

    async fn send_prompt(&self, prompt: &str) -> Result<()> {
        self.ensure_connected()?;
        self.lock().prompts.push(prompt.to_string());
        if let Some(responder) = &self.responder {
            for event in responder(prompt) {
                self.inject(event);
            }
        }
        Ok(())
    }

    async fn respond_permission(&self, response: &PermissionResponse) -> Result<()> {
        self.ensure_connected()?;
        self.lock().responses.push(response.clone());
        Ok(())
    }

    async fn cancel(&self) -> Result<()> {
        self.lock().cancels += 1;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = self.lock();
        state.shut_down = true;
        state.sender = None;
        Ok(())
    }
}

/// Factory handing out `MemoryConnection`s, one per conversation
///
/// Every connection it creates stays reachable through `connection` so
/// tests can drive it.
#[derive(Default)]
pub struct MemoryConnectionFactory {
    fail_connect: Option<String>,
    responder: Option<Responder>,
    created: Mutex<HashMap<String, Vec<MemoryConnection>>>,
}

impl MemoryConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection created fails to connect
    pub fn failing_connect(mut self, reason: impl Into<String>) -> Self {
        self.fail_connect = Some(reason.into());
        self
    }

    pub fn with_responder(mut self, responder: Responder) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Most recent connection built for a conversation
    pub fn connection(&self, conversation_id: &str) -> Option<MemoryConnection> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_id)
            .and_then(|list| list.last().cloned())
    }

    /// Number of connections built for a conversation
    pub fn created(&self, conversation_id: &str) -> usize {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation_id)
            .map_or(0, Vec::len)
    }
}

impl ConnectionFactory for MemoryConnectionFactory {
    fn create(
        &self,
        record: &ConversationRecord,
        _config: &BridgeConfig,
    ) -> Result<Arc<dyn AgentConnection>> {
        let mut conn = MemoryConnection::new(record.kind);
        if let Some(reason) = &self.fail_connect {
            conn = conn.failing_connect(reason.clone());
        }
        if let Some(responder) = &self.responder {
            conn = conn.with_responder(responder.clone());
        }
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(record.id.clone())
            .or_default()
            .push(conn.clone());
        tracing::debug!(conversation_id = %record.id, backend = %record.kind, "Memory connection created");
        Ok(Arc::new(conn))
    }
}
