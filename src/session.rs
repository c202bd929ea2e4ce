//! One live agent session per conversation
//!
//! A session owns its backend connection, its status state machine and one
//! event translator. A single driver task bootstraps the connection and
//! then pumps backend events through the translator; events that arrive
//! before the session is active wait in the channel.

use crate::backend::{
    translator_for, AgentConnection, BackendCommand, EventReceiver, EventTranslator,
    TranslatorContext,
};
use crate::config::BridgeConfig;
use crate::emitter::MessageEmitter;
use crate::error::{BridgeError, Result};
use crate::status::StatusTracker;
use crate::store::MessageStore;
use crate::types::{
    BackendKind, ConfirmDecision, ConversationRecord, MessageContent, MessagePosition,
    ResponseEvent, SendMessageRequest, SendResult, SessionStatus,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// State shared between the session handle and its driver task
struct SessionCore {
    conversation_id: String,
    backend: BackendKind,
    workspace: PathBuf,
    connection: Arc<dyn AgentConnection>,
    translator: Arc<dyn EventTranslator>,
    status: StatusTracker,
    emitter: MessageEmitter,
    /// True from prompt submission until the translator sees the turn end
    turn_open: watch::Sender<bool>,
    /// Set once by `kill`; nothing is emitted on behalf of a send afterwards
    closed: AtomicBool,
}

impl SessionCore {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enter `connecting` and spawn the driver task
    fn spawn_driver(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.status.transition(
            SessionStatus::Connecting,
            format!("Connecting to {}", self.backend),
        )?;
        Ok(tokio::spawn(self.clone().drive()))
    }

    async fn drive(self: Arc<Self>) {
        match self.bootstrap().await {
            Ok(events) => self.pump(events).await,
            Err(e) => {
                tracing::error!(
                    conversation_id = %self.conversation_id,
                    backend = %self.backend,
                    error = %e,
                    "Session bootstrap failed"
                );
                let _ = self.status.transition(SessionStatus::Error, e.to_string());
            }
        }
    }

    /// Runs after the status has moved to `connecting`
    async fn bootstrap(&self) -> Result<EventReceiver> {
        let events = self.connection.connect().await?;
        self.status
            .transition(SessionStatus::Connected, format!("Connected to {}", self.backend))?;

        self.connection.authenticate().await?;
        self.status
            .transition(SessionStatus::Authenticated, "Authenticated")?;

        let backend_session = self.connection.new_session(&self.workspace).await?;
        tracing::info!(
            conversation_id = %self.conversation_id,
            backend_session = %backend_session,
            workspace = %self.workspace.display(),
            "Backend session opened"
        );
        self.status
            .transition(SessionStatus::SessionActive, "Session active")?;
        Ok(events)
    }

    async fn pump(&self, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            tracing::trace!(
                conversation_id = %self.conversation_id,
                event_type = %event.event_type,
                "Backend event"
            );
            let ends_turn = self.translator.ends_turn(&event.event_type);
            for command in self.translator.handle_event(event).await {
                self.forward(command).await;
            }
            if ends_turn {
                self.turn_open.send_replace(false);
            }
        }

        tracing::info!(conversation_id = %self.conversation_id, "Backend event stream closed");
        if self.status.current() == SessionStatus::SessionActive {
            let _ = self.status.transition(
                SessionStatus::Disconnected,
                format!("Disconnected from {}", self.backend),
            );
        }
        // After the status change, so a waiting prompt fails instead of sending
        self.turn_open.send_replace(false);
    }

    async fn forward(&self, command: BackendCommand) {
        match command {
            BackendCommand::RespondPermission(response) => {
                if let Err(e) = self.connection.respond_permission(&response).await {
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        call_id = %response.call_id,
                        error = %e,
                        "Failed to answer permission request"
                    );
                }
            }
        }
    }

    /// Wait until the previous turn has ended
    ///
    /// Fails when the session leaves `session_active` or is killed first.
    async fn wait_turn_closed(&self) -> Result<()> {
        let mut turn = self.turn_open.subscribe();
        let mut status = self.status.subscribe();
        loop {
            if self.is_closed() {
                return Err(closed_error());
            }
            let current = *status.borrow_and_update();
            if current != SessionStatus::SessionActive {
                return Err(BridgeError::Connection(format!(
                    "Session {} while waiting for the previous turn",
                    current
                )));
            }
            if !*turn.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                changed = turn.changed() => changed.map_err(|_| closed_error())?,
                changed = status.changed() => changed.map_err(|_| closed_error())?,
            }
        }
    }

    /// Move a killed session to a terminal status
    fn close_status(&self) {
        match self.status.current() {
            SessionStatus::Disconnected => {}
            SessionStatus::SessionActive | SessionStatus::Error => {
                let _ = self
                    .status
                    .transition(SessionStatus::Disconnected, "Session closed");
            }
            _ => {
                // Bootstrap was still running; `error` is reachable from anywhere
                let _ = self.status.transition(SessionStatus::Error, "Session closed");
                let _ = self
                    .status
                    .transition(SessionStatus::Disconnected, "Session closed");
            }
        }
    }

    /// Emit and persist the one error message of a failed send
    fn report_send_error(&self, msg_id: Option<String>, error: &BridgeError) {
        let msg_id = msg_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let message = self
            .emitter
            .message(msg_id, MessageContent::error(error.to_string()))
            .with_position(MessagePosition::Center);
        self.emitter.emit_and_persist(message);
    }
}

fn closed_error() -> BridgeError {
    BridgeError::Connection("Session closed".to_string())
}

/// Prompt text with attached files as `@path` references
///
/// Files the prompt already references are not repeated.
pub fn compose_prompt(content: &str, files: &[String]) -> String {
    let refs: Vec<String> = files
        .iter()
        .map(|f| format!("@{}", f))
        .filter(|r| !content.contains(r.as_str()))
        .collect();
    if refs.is_empty() {
        content.to_string()
    } else if content.is_empty() {
        refs.join(" ")
    } else {
        format!("{}\n\n{}", content, refs.join(" "))
    }
}

/// A live backend session
pub struct AgentSession {
    core: Arc<SessionCore>,
    /// Serializes senders; the turn gate in the core keeps turns apart
    prompt_lock: tokio::sync::Mutex<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
    bootstrap_timeout: Duration,
}

impl AgentSession {
    /// Build a session and start bootstrapping it in the background
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(
        record: &ConversationRecord,
        connection: Arc<dyn AgentConnection>,
        config: &BridgeConfig,
        store: Arc<dyn MessageStore>,
        stream: broadcast::Sender<ResponseEvent>,
    ) -> Self {
        let emitter = MessageEmitter::new(record.id.clone(), store, stream);
        let ctx = TranslatorContext::new(emitter.clone(), record, config);
        let core = Arc::new(SessionCore {
            conversation_id: record.id.clone(),
            backend: record.kind,
            workspace: record.workspace.clone(),
            connection,
            translator: translator_for(record.kind, ctx),
            status: StatusTracker::new(record.kind, emitter.clone()),
            emitter,
            turn_open: watch::channel(false).0,
            closed: AtomicBool::new(false),
        });

        tracing::info!(
            conversation_id = %record.id,
            backend = %record.kind,
            "Starting agent session"
        );
        // A fresh tracker starts in `initializing`, so this cannot be rejected
        let driver = core.spawn_driver().ok();
        Self {
            core,
            prompt_lock: tokio::sync::Mutex::new(()),
            driver: Mutex::new(driver),
            bootstrap_timeout: config.bootstrap_timeout(),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.conversation_id
    }

    pub fn backend(&self) -> BackendKind {
        self.core.backend
    }

    pub fn workspace(&self) -> &Path {
        &self.core.workspace
    }

    pub fn status(&self) -> SessionStatus {
        self.core.status.current()
    }

    /// Stable msg id of this session's status line
    pub fn status_msg_id(&self) -> &str {
        self.core.status.msg_id()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.core.status.subscribe()
    }

    /// Wait for bootstrap, up to the configured timeout
    pub async fn wait_until_active(&self) -> Result<()> {
        self.core.status.wait_for_active(self.bootstrap_timeout).await
    }

    fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Abort the driver task and wait until it is gone
    ///
    /// Once this returns the pump can no longer reach the translator.
    async fn stop_driver(&self) {
        if let Some(handle) = self.take_driver() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Send a user turn to the backend
    ///
    /// Waits for the session to become active and for the previous turn to
    /// end. The user message is persisted once the backend is reachable; any
    /// failure emits exactly one error message and is returned. A session
    /// killed meanwhile fails the send without emitting anything.
    pub async fn send_message(&self, request: SendMessageRequest) -> Result<SendResult> {
        let _sender = self.prompt_lock.lock().await;
        if self.core.is_closed() {
            return Err(closed_error());
        }

        let ready = match self.wait_until_active().await {
            Ok(()) => self.core.wait_turn_closed().await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            if self.core.is_closed() {
                tracing::debug!(
                    conversation_id = %self.core.conversation_id,
                    "Prompt dropped; session closed"
                );
                return Err(closed_error());
            }
            if matches!(e, BridgeError::Timeout(_)) {
                self.stop_driver().await;
                let _ = self.core.status.transition(SessionStatus::Error, e.to_string());
            }
            tracing::warn!(
                conversation_id = %self.core.conversation_id,
                error = %e,
                "Prompt rejected; session not active"
            );
            self.core.report_send_error(request.msg_id.clone(), &e);
            return Err(e);
        }

        let user_msg_id = request
            .msg_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !request.content.is_empty() {
            let user = self
                .core
                .emitter
                .message(user_msg_id, MessageContent::text(request.content.clone()))
                .with_position(MessagePosition::Right);
            self.core.emitter.persist_only(user);
        }

        let prompt = compose_prompt(&request.content, &request.files);
        self.core.turn_open.send_replace(true);
        if let Err(e) = self.core.connection.send_prompt(&prompt).await {
            self.core.turn_open.send_replace(false);
            tracing::warn!(
                conversation_id = %self.core.conversation_id,
                error = %e,
                "Backend rejected prompt"
            );
            // The request msg id already names the user message
            self.core.report_send_error(None, &e);
            return Err(e);
        }

        tracing::debug!(
            conversation_id = %self.core.conversation_id,
            files = request.files.len(),
            "Prompt sent"
        );
        Ok(SendResult::ok())
    }

    /// Resolve a pending tool confirmation from a UI confirm key
    ///
    /// Unknown or already-resolved call ids are ignored.
    pub async fn confirm_message(&self, call_id: &str, confirm_key: &str) -> Result<()> {
        let decision = ConfirmDecision::from_key(confirm_key);
        tracing::info!(
            conversation_id = %self.core.conversation_id,
            call_id = %call_id,
            decision = ?decision,
            "Confirmation received"
        );
        if let Some(command) = self.core.translator.confirm(call_id, decision).await {
            self.core.forward(command).await;
        }
        Ok(())
    }

    /// Ask the backend to cancel the in-flight turn
    ///
    /// A cancelled turn no longer holds back the next prompt.
    pub async fn stop(&self) -> Result<()> {
        tracing::info!(conversation_id = %self.core.conversation_id, "Stopping current turn");
        self.core.connection.cancel().await?;
        self.core.turn_open.send_replace(false);
        Ok(())
    }

    /// Re-run bootstrap after a failure
    pub async fn reconnect(&self) -> Result<()> {
        if self.core.is_closed() {
            return Err(closed_error());
        }
        // Only `error` may re-enter `connecting`; this also admits a single caller
        self.core.status.transition(
            SessionStatus::Connecting,
            format!("Reconnecting to {}", self.core.backend),
        )?;
        self.stop_driver().await;
        self.core.translator.cleanup();
        self.core.turn_open.send_replace(false);

        tracing::info!(conversation_id = %self.core.conversation_id, "Reconnecting session");
        let handle = tokio::spawn(self.core.clone().drive());
        let mut driver = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        if self.core.is_closed() {
            // Killed while the old driver was winding down
            handle.abort();
            return Err(closed_error());
        }
        *driver = Some(handle);
        Ok(())
    }

    /// Tear the session down
    ///
    /// Safe while a turn is in flight: the driver is gone before buffers are
    /// discarded, so no text or finish is emitted afterwards. The status
    /// always ends in `disconnected`, which fails pending sends at once.
    pub async fn kill(&self) {
        self.core.closed.store(true, Ordering::SeqCst);
        self.stop_driver().await;
        self.core.translator.cleanup();
        self.core.turn_open.send_replace(false);
        if let Err(e) = self.core.connection.shutdown().await {
            tracing::warn!(
                conversation_id = %self.core.conversation_id,
                error = %e,
                "Backend shutdown failed"
            );
        }
        self.core.close_status();
        self.core.emitter.flush().await;
        tracing::info!(conversation_id = %self.core.conversation_id, "Session killed");
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        if let Some(handle) = self.take_driver() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryConnection;
    use crate::backend::PermissionResponse;
    use crate::store::MemoryMessageStore;
    use crate::types::{BackendEvent, MessageType};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Harness {
        session: AgentSession,
        conn: MemoryConnection,
        store: Arc<MemoryMessageStore>,
        stream: broadcast::Sender<ResponseEvent>,
        _rx: broadcast::Receiver<ResponseEvent>,
    }

    /// A backend whose connect never completes
    struct HangingConnection;

    #[async_trait]
    impl AgentConnection for HangingConnection {
        fn kind(&self) -> BackendKind {
            BackendKind::Acp
        }

        async fn connect(&self) -> Result<EventReceiver> {
            std::future::pending::<Result<EventReceiver>>().await
        }

        async fn new_session(&self, _workspace: &Path) -> Result<String> {
            Ok("never".to_string())
        }

        async fn send_prompt(&self, _prompt: &str) -> Result<()> {
            Ok(())
        }

        async fn respond_permission(&self, _response: &PermissionResponse) -> Result<()> {
            Ok(())
        }

        async fn cancel(&self) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    fn start(kind: BackendKind, conn: MemoryConnection, config: BridgeConfig) -> Harness {
        let store = Arc::new(MemoryMessageStore::new());
        let (tx, rx) = broadcast::channel(256);
        let record = ConversationRecord::new("conv", kind, std::env::temp_dir());
        let session = AgentSession::start(
            &record,
            Arc::new(conn.clone()),
            &config,
            store.clone(),
            tx.clone(),
        );
        Harness {
            session,
            conn,
            store,
            stream: tx,
            _rx: rx,
        }
    }

    async fn stored_of(h: &Harness, kind: MessageType) -> Vec<crate::types::CanonicalMessage> {
        h.session.core.emitter.flush().await;
        h.store
            .list("conv")
            .await
            .into_iter()
            .filter(|m| m.message_type() == kind)
            .collect()
    }

    #[test]
    fn test_compose_prompt() {
        assert_eq!(compose_prompt("hi", &[]), "hi");
        assert_eq!(
            compose_prompt("review", &["src/a.rs".to_string(), "b.md".to_string()]),
            "review\n\n@src/a.rs @b.md"
        );
        assert_eq!(
            compose_prompt("look at @b.md", &["b.md".to_string()]),
            "look at @b.md"
        );
    }

    #[tokio::test]
    async fn test_bootstrap_reaches_active() {
        let h = start(
            BackendKind::Codex,
            MemoryConnection::new(BackendKind::Codex),
            BridgeConfig::default(),
        );
        h.session.wait_until_active().await.unwrap();
        assert_eq!(h.session.status(), SessionStatus::SessionActive);
        assert_eq!(h.conn.workspace(), Some(std::env::temp_dir()));

        let statuses = stored_of(&h, MessageType::Status).await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].msg_id, h.session.status_msg_id());
    }

    #[tokio::test]
    async fn test_send_message_persists_user_turn() {
        let h = start(
            BackendKind::Acp,
            MemoryConnection::new(BackendKind::Acp),
            BridgeConfig::default(),
        );
        let result = h
            .session
            .send_message(
                SendMessageRequest::new("fix the bug")
                    .with_msg_id("user-1")
                    .with_files(vec!["src/lib.rs".to_string()]),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(h.conn.prompts(), vec!["fix the bug\n\n@src/lib.rs"]);

        h.session.core.emitter.flush().await;
        let user = h.store.get("conv", "user-1").await.unwrap();
        assert_eq!(user.position, MessagePosition::Right);
        assert_eq!(user.content, MessageContent::text("fix the bug"));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_rejects_send_with_one_error() {
        let h = start(
            BackendKind::Gemini,
            MemoryConnection::new(BackendKind::Gemini).failing_connect("binary not found"),
            BridgeConfig::default(),
        );
        let err = h
            .session
            .send_message(SendMessageRequest::new("hello").with_msg_id("m1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Bootstrap(_)));
        assert_eq!(h.session.status(), SessionStatus::Error);
        assert!(h.conn.prompts().is_empty());

        let errors = stored_of(&h, MessageType::Error).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].msg_id, "m1");
        assert!(stored_of(&h, MessageType::Text).await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_from_error() {
        let h = start(
            BackendKind::Codex,
            MemoryConnection::new(BackendKind::Codex).failing_connect("refused"),
            BridgeConfig::default(),
        );
        assert!(h.session.wait_until_active().await.is_err());
        assert_eq!(h.session.status(), SessionStatus::Error);

        h.session.reconnect().await.unwrap();
        assert!(h.session.wait_until_active().await.is_err());
        assert_eq!(h.conn.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_rejected_when_healthy() {
        let h = start(
            BackendKind::Codex,
            MemoryConnection::new(BackendKind::Codex),
            BridgeConfig::default(),
        );
        h.session.wait_until_active().await.unwrap();
        assert!(matches!(
            h.session.reconnect().await,
            Err(BridgeError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_confirmation_forwarded_once() {
        let h = start(
            BackendKind::Codex,
            MemoryConnection::new(BackendKind::Codex),
            BridgeConfig::default(),
        );
        h.session.wait_until_active().await.unwrap();
        h.conn.inject(BackendEvent::new(
            "exec_approval_request",
            json!({"call_id": "c1", "command": ["make"]}),
        ));

        // Wait for the pump to register the pending call
        let mut permissions = Vec::new();
        for _ in 0..50 {
            permissions = stored_of(&h, MessageType::PermissionRequest).await;
            if !permissions.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(permissions.len(), 1);

        h.session.confirm_message("c1", "approved").await.unwrap();
        h.session.confirm_message("c1", "approved").await.unwrap();
        let responses = h.conn.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].decision, ConfirmDecision::ApproveOnce);
    }

    #[tokio::test]
    async fn test_channel_close_disconnects() {
        let h = start(
            BackendKind::Acp,
            MemoryConnection::new(BackendKind::Acp),
            BridgeConfig::default(),
        );
        h.session.wait_until_active().await.unwrap();
        let mut status = h.session.watch_status();
        h.conn.close();

        tokio::time::timeout(Duration::from_secs(5), async {
            while *status.borrow_and_update() != SessionStatus::Disconnected {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_kill_discards_partial_text() {
        let h = start(
            BackendKind::Codex,
            MemoryConnection::new(BackendKind::Codex),
            BridgeConfig::default().with_idle_finalize_ms(20),
        );
        h.session.wait_until_active().await.unwrap();
        h.conn.inject(BackendEvent::new(
            "agent_message_delta",
            json!({"delta": "half a sent"}),
        ));
        tokio::time::sleep(Duration::from_millis(5)).await;

        h.session.kill().await;
        assert!(h.conn.is_shut_down());
        assert_eq!(h.session.status(), SessionStatus::Disconnected);

        // The idle timer must not fire against the dead session
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(stored_of(&h, MessageType::Text).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_kill_waits_for_pump_before_discarding() {
        let h = start(
            BackendKind::Codex,
            MemoryConnection::new(BackendKind::Codex),
            BridgeConfig::default().with_idle_finalize_ms(30),
        );
        h.session.wait_until_active().await.unwrap();
        for i in 0..2000 {
            h.conn.inject(BackendEvent::new(
                "agent_message_delta",
                json!({"delta": format!(" w{}", i)}),
            ));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        h.session.kill().await;
        let mut after_kill = h.stream.subscribe();

        // Longer than the idle window, so a surviving pump or timer would show up
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(after_kill.try_recv(), Err(TryRecvError::Empty)));
        assert!(stored_of(&h, MessageType::Finish).await.is_empty());
    }

    #[tokio::test]
    async fn test_kill_during_bootstrap_fails_waiting_send() {
        let store = Arc::new(MemoryMessageStore::new());
        let (tx, _rx) = broadcast::channel(64);
        let record = ConversationRecord::new("conv", BackendKind::Acp, std::env::temp_dir());
        let session = Arc::new(AgentSession::start(
            &record,
            Arc::new(HangingConnection),
            &BridgeConfig::default(),
            store.clone(),
            tx,
        ));
        assert_eq!(session.status(), SessionStatus::Connecting);

        let waiting = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .send_message(SendMessageRequest::new("hello").with_msg_id("m1"))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.kill().await;

        let sent = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(sent, Err(BridgeError::Connection(_))));
        assert_eq!(session.status(), SessionStatus::Disconnected);

        session.core.emitter.flush().await;
        let stored = store.list("conv").await;
        assert!(stored.iter().all(|m| m.message_type() != MessageType::Error));
        assert!(stored.iter().all(|m| m.msg_id != "m1"));

        // Sends after the kill fail the same way
        assert!(session
            .send_message(SendMessageRequest::new("again"))
            .await
            .is_err());
        assert!(matches!(
            session.reconnect().await,
            Err(BridgeError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_second_prompt_waits_for_turn_end() {
        let h = start(
            BackendKind::Codex,
            MemoryConnection::new(BackendKind::Codex),
            BridgeConfig::default(),
        );
        h.session
            .send_message(SendMessageRequest::new("first"))
            .await
            .unwrap();

        let second = h.session.send_message(SendMessageRequest::new("second"));
        tokio::pin!(second);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut second)
            .await
            .is_err());
        assert_eq!(h.conn.prompts(), vec!["first"]);

        h.conn.inject(BackendEvent::new("agent_message_delta", json!({"delta": "done"})));
        h.conn.inject(BackendEvent::new("task_complete", json!({})));
        let sent = tokio::time::timeout(Duration::from_secs(5), &mut second)
            .await
            .unwrap();
        assert!(sent.unwrap().success);
        assert_eq!(h.conn.prompts(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_stop_releases_turn_gate() {
        let h = start(
            BackendKind::Acp,
            MemoryConnection::new(BackendKind::Acp),
            BridgeConfig::default(),
        );
        h.session
            .send_message(SendMessageRequest::new("long task"))
            .await
            .unwrap();
        h.session.stop().await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            h.session.send_message(SendMessageRequest::new("next")),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(h.conn.prompts(), vec!["long task", "next"]);
    }

    #[tokio::test]
    async fn test_disconnect_fails_prompt_waiting_for_turn() {
        let h = start(
            BackendKind::Gemini,
            MemoryConnection::new(BackendKind::Gemini),
            BridgeConfig::default(),
        );
        h.session
            .send_message(SendMessageRequest::new("first"))
            .await
            .unwrap();

        let second = h
            .session
            .send_message(SendMessageRequest::new("second").with_msg_id("m2"));
        tokio::pin!(second);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut second)
            .await
            .is_err());

        h.conn.close();
        let err = tokio::time::timeout(Duration::from_secs(5), &mut second)
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        assert_eq!(h.conn.prompts(), vec!["first"]);

        let errors = stored_of(&h, MessageType::Error).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].msg_id, "m2");
    }

    #[tokio::test]
    async fn test_stop_cancels_turn() {
        let h = start(
            BackendKind::Gemini,
            MemoryConnection::new(BackendKind::Gemini),
            BridgeConfig::default(),
        );
        h.session.stop().await.unwrap();
        assert_eq!(h.conn.cancel_count(), 1);
    }
}
