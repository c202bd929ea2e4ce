//! Conversation id → live session map
//!
//! The registry is an explicit object, not a process-wide singleton, so a
//! host (or a test) can run several independent ones.

use crate::backend::ConnectionFactory;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::session::AgentSession;
use crate::store::{ConversationStore, MessageStore};
use crate::types::{ConversationRecord, ResponseEvent, SendMessageRequest, SendResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Builds, reuses and tears down agent sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<AgentSession>>>,
    factory: Arc<dyn ConnectionFactory>,
    messages: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationStore>,
    config: BridgeConfig,
    stream: broadcast::Sender<ResponseEvent>,
}

impl SessionRegistry {
    pub fn new(
        config: BridgeConfig,
        factory: Arc<dyn ConnectionFactory>,
        messages: Arc<dyn MessageStore>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        let (stream, _) = broadcast::channel(config.response_buffer_size.max(1));
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
            messages,
            conversations,
            config,
            stream,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Return the live session for `id`, building it from `record` if absent
    ///
    /// Concurrent calls for one id yield the same instance.
    pub async fn resolve(&self, id: &str, record: &ConversationRecord) -> Result<Arc<AgentSession>> {
        if let Some(session) = self.sessions.read().await.get(id) {
            return Ok(session.clone());
        }

        let mut record = record.clone();
        record.id = id.to_string();
        let session = {
            let mut sessions = self.sessions.write().await;
            // Another caller may have built it while we waited for the lock
            if let Some(session) = sessions.get(id) {
                return Ok(session.clone());
            }

            let connection = self.factory.create(&record, &self.config)?;
            let session = Arc::new(AgentSession::start(
                &record,
                connection,
                &self.config,
                self.messages.clone(),
                self.stream.clone(),
            ));
            sessions.insert(id.to_string(), session.clone());
            session
        };
        tracing::info!(
            conversation_id = %id,
            backend = %record.kind,
            "Session created"
        );

        if let Err(e) = self.conversations.save(&record).await {
            tracing::warn!(
                conversation_id = %id,
                error = %e,
                "Failed to save conversation record"
            );
        }
        Ok(session)
    }

    /// Return the live session, rebuilding it from the durable record if needed
    pub async fn rebuild_if_evicted(&self, id: &str) -> Result<Arc<AgentSession>> {
        if let Some(session) = self.get(id).await {
            return Ok(session);
        }
        let record = self
            .conversations
            .load(id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("Conversation {}", id)))?;
        tracing::info!(conversation_id = %id, "Rebuilding evicted session");
        self.resolve(id, &record).await
    }

    pub async fn get(&self, id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Ids of all live sessions
    pub async fn list(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Remove and tear down a session; absent ids are a no-op
    pub async fn kill(&self, id: &str) {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => session.kill().await,
            None => tracing::debug!(conversation_id = %id, "Kill for unknown session ignored"),
        }
    }

    /// Kill every session
    pub async fn clear(&self) {
        let drained: Vec<Arc<AgentSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        futures::future::join_all(drained.iter().map(|s| s.kill())).await;
        tracing::info!(sessions = count, "Session registry cleared");
    }

    /// Send a user turn, rebuilding the session if it was evicted
    pub async fn send_message(&self, id: &str, request: SendMessageRequest) -> Result<SendResult> {
        let session = self.rebuild_if_evicted(id).await?;
        session.send_message(request).await
    }

    pub async fn confirm_message(&self, id: &str, call_id: &str, confirm_key: &str) -> Result<()> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| BridgeError::SessionNotFound(id.to_string()))?;
        session.confirm_message(call_id, confirm_key).await
    }

    /// Cancel the in-flight turn; absent ids are a no-op
    pub async fn stop(&self, id: &str) -> Result<()> {
        match self.get(id).await {
            Some(session) => session.stop().await,
            None => Ok(()),
        }
    }

    /// Workspace of a conversation, live or durable
    pub async fn get_workspace(&self, id: &str) -> Result<PathBuf> {
        if let Some(session) = self.get(id).await {
            return Ok(session.workspace().to_path_buf());
        }
        self.conversations
            .load(id)
            .await?
            .map(|record| record.workspace)
            .ok_or_else(|| BridgeError::NotFound(format!("Conversation {}", id)))
    }

    /// Receive every canonical message emitted by any session
    pub fn subscribe(&self) -> broadcast::Receiver<ResponseEvent> {
        self.stream.subscribe()
    }

    /// The UI stream as a `Stream`; lagged gaps are skipped
    pub fn response_stream(&self) -> impl Stream<Item = ResponseEvent> {
        BroadcastStream::new(self.stream.subscribe()).filter_map(|event| event.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryConnectionFactory;
    use crate::store::{MemoryConversationStore, MemoryMessageStore};
    use crate::types::{BackendKind, SessionStatus};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        factory: Arc<MemoryConnectionFactory>,
        conversations: Arc<MemoryConversationStore>,
    }

    fn fixture(factory: MemoryConnectionFactory) -> Fixture {
        let factory = Arc::new(factory);
        let conversations = Arc::new(MemoryConversationStore::new());
        let registry = Arc::new(SessionRegistry::new(
            BridgeConfig::default(),
            factory.clone(),
            Arc::new(MemoryMessageStore::new()),
            conversations.clone(),
        ));
        Fixture {
            registry,
            factory,
            conversations,
        }
    }

    fn record(id: &str) -> ConversationRecord {
        ConversationRecord::new(id, BackendKind::Codex, "/tmp/work")
    }

    // ========================================================================
    // resolve
    // ========================================================================

    #[tokio::test]
    async fn test_resolve_reuses_session() {
        let f = fixture(MemoryConnectionFactory::new());
        let a = f.registry.resolve("c1", &record("c1")).await.unwrap();
        let b = f.registry.resolve("c1", &record("c1")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.factory.created("c1"), 1);
        assert!(f.conversations.load("c1").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_builds_once() {
        let f = fixture(MemoryConnectionFactory::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = f.registry.clone();
                tokio::spawn(async move { registry.resolve("c1", &record("c1")).await.unwrap() })
            })
            .collect();
        let sessions: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(f.factory.created("c1"), 1);
        assert_eq!(f.registry.list().await, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_uses_record_kind() {
        let f = fixture(MemoryConnectionFactory::new());
        let rec = ConversationRecord::new("g1", BackendKind::Gemini, "/tmp/work");
        let session = f.registry.resolve("g1", &rec).await.unwrap();
        assert_eq!(session.backend(), BackendKind::Gemini);
    }

    // ========================================================================
    // rebuild / kill / clear
    // ========================================================================

    #[tokio::test]
    async fn test_rebuild_if_evicted() {
        let f = fixture(MemoryConnectionFactory::new());
        assert!(matches!(
            f.registry.rebuild_if_evicted("missing").await,
            Err(BridgeError::NotFound(_))
        ));

        f.conversations.save(&record("c1")).await.unwrap();
        let session = f.registry.rebuild_if_evicted("c1").await.unwrap();
        assert_eq!(session.id(), "c1");
        let again = f.registry.rebuild_if_evicted("c1").await.unwrap();
        assert!(Arc::ptr_eq(&session, &again));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let f = fixture(MemoryConnectionFactory::new());
        f.registry.kill("nobody").await;
        assert!(f.registry.list().await.is_empty());

        let session = f.registry.resolve("c1", &record("c1")).await.unwrap();
        session.wait_until_active().await.unwrap();
        f.registry.kill("c1").await;
        f.registry.kill("c1").await;
        assert!(f.registry.get("c1").await.is_none());
        assert!(f.factory.connection("c1").unwrap().is_shut_down());
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_kill_then_resolve_builds_fresh() {
        let f = fixture(MemoryConnectionFactory::new());
        let first = f.registry.resolve("c1", &record("c1")).await.unwrap();
        f.registry.kill("c1").await;
        let second = f.registry.resolve("c1", &record("c1")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(f.factory.created("c1"), 2);
    }

    #[tokio::test]
    async fn test_clear_kills_all() {
        let f = fixture(MemoryConnectionFactory::new());
        for id in ["a", "b", "c"] {
            f.registry.resolve(id, &record(id)).await.unwrap();
        }
        f.registry.clear().await;
        assert!(f.registry.list().await.is_empty());
        for id in ["a", "b", "c"] {
            assert!(f.factory.connection(id).unwrap().is_shut_down());
        }
    }

    // ========================================================================
    // host wrappers
    // ========================================================================

    #[tokio::test]
    async fn test_confirm_unknown_session() {
        let f = fixture(MemoryConnectionFactory::new());
        assert!(matches!(
            f.registry.confirm_message("nope", "c1", "approved").await,
            Err(BridgeError::SessionNotFound(_))
        ));
        f.registry.stop("nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_workspace() {
        let f = fixture(MemoryConnectionFactory::new());
        assert!(f.registry.get_workspace("c1").await.is_err());

        f.conversations.save(&record("c1")).await.unwrap();
        assert_eq!(
            f.registry.get_workspace("c1").await.unwrap(),
            PathBuf::from("/tmp/work")
        );
    }

    #[tokio::test]
    async fn test_send_message_rebuilds() {
        let f = fixture(MemoryConnectionFactory::new());
        f.conversations.save(&record("c1")).await.unwrap();
        let result = f
            .registry
            .send_message("c1", SendMessageRequest::new("hello"))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(f.factory.connection("c1").unwrap().prompts(), vec!["hello"]);
    }
}
