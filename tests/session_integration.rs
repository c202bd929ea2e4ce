//! Session registry integration tests
//!
//! End-to-end tests driving a full `SessionRegistry` with the in-memory
//! connection. Covers bootstrap, streaming text, tool confirmation for each
//! backend, approval modes, eviction and teardown.

use a3s_agent_bridge::{
    ApprovalMode, BackendEvent, BackendKind, BridgeConfig, BridgeError, CanonicalMessage,
    ConfirmDecision, ConversationExtra, ConversationRecord, ConversationStore,
    MemoryConnection, MemoryConnectionFactory, MemoryConversationStore, MemoryMessageStore,
    MessageContent, MessagePosition, MessageType, SendMessageRequest, SessionRegistry,
    SessionStatus, ToolStatus,
};
use serde_json::json;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

struct Bridge {
    registry: SessionRegistry,
    factory: Arc<MemoryConnectionFactory>,
    messages: Arc<MemoryMessageStore>,
    conversations: Arc<MemoryConversationStore>,
}

fn bridge_with(factory: MemoryConnectionFactory, config: BridgeConfig) -> Bridge {
    let factory = Arc::new(factory);
    let messages = Arc::new(MemoryMessageStore::new());
    let conversations = Arc::new(MemoryConversationStore::new());
    let registry = SessionRegistry::new(
        config,
        factory.clone(),
        messages.clone(),
        conversations.clone(),
    );
    Bridge {
        registry,
        factory,
        messages,
        conversations,
    }
}

fn bridge() -> Bridge {
    bridge_with(MemoryConnectionFactory::new(), BridgeConfig::default())
}

impl Bridge {
    /// Resolve a session and wait until it is active
    async fn open(&self, id: &str, record: ConversationRecord) -> MemoryConnection {
        let session = self.registry.resolve(id, &record).await.unwrap();
        session.wait_until_active().await.unwrap();
        self.factory.connection(id).unwrap()
    }

    async fn stored(&self, id: &str, kind: MessageType) -> Vec<CanonicalMessage> {
        self.messages
            .list(id)
            .await
            .into_iter()
            .filter(|m| m.message_type() == kind)
            .collect()
    }
}

/// Poll until `check` holds; the event pump runs on its own task
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn tool_status(message: &CanonicalMessage, call_id: &str) -> Option<ToolStatus> {
    match &message.content {
        MessageContent::ToolGroup(calls) => calls
            .iter()
            .find(|c| c.call_id == call_id)
            .map(|c| c.status),
        _ => None,
    }
}

async fn tool_status_of(b: &Bridge, id: &str, call_id: &str) -> Option<ToolStatus> {
    b.stored(id, MessageType::ToolGroup)
        .await
        .iter()
        .find_map(|m| tool_status(m, call_id))
}

// ─── Bootstrap & Status ──────────────────────────────────────────

#[tokio::test]
async fn test_session_reaches_active_with_single_status_line() {
    let b = bridge();
    b.open("c1", ConversationRecord::new("c1", BackendKind::Codex, "/tmp"))
        .await;

    eventually(|| async {
        let statuses = b.stored("c1", MessageType::Status).await;
        statuses.len() == 1
            && matches!(
                &statuses[0].content,
                MessageContent::Status(s) if s.status == SessionStatus::SessionActive
            )
    })
    .await;
}

#[tokio::test]
async fn test_bootstrap_failure_fails_prompt_once() {
    let b = bridge_with(
        MemoryConnectionFactory::new().failing_connect("codex not installed"),
        BridgeConfig::default(),
    );
    let record = ConversationRecord::new("c1", BackendKind::Codex, "/tmp");
    b.registry.resolve("c1", &record).await.unwrap();

    let err = b
        .registry
        .send_message("c1", SendMessageRequest::new("hello").with_msg_id("u1"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Bootstrap(_)));

    eventually(|| async { b.stored("c1", MessageType::Error).await.len() == 1 }).await;
    let errors = b.stored("c1", MessageType::Error).await;
    assert_eq!(errors[0].msg_id, "u1");
    assert_eq!(errors[0].position, MessagePosition::Center);
    assert!(b.factory.connection("c1").unwrap().prompts().is_empty());
}

// ─── Streaming Text ──────────────────────────────────────────────

#[tokio::test]
async fn test_codex_streaming_turn() {
    let b = bridge();
    let conn = b
        .open("c1", ConversationRecord::new("c1", BackendKind::Codex, "/tmp"))
        .await;
    let mut events = b.registry.subscribe();

    b.registry
        .send_message("c1", SendMessageRequest::new("say hello").with_msg_id("u1"))
        .await
        .unwrap();
    conn.inject(BackendEvent::new("task_started", json!({})));
    conn.inject(BackendEvent::new("agent_message_delta", json!({"delta": "Hel"})));
    conn.inject(BackendEvent::new("agent_message_delta", json!({"delta": "Hello"})));
    conn.inject(BackendEvent::new("agent_message_delta", json!({"delta": "Hello"})));
    conn.inject(BackendEvent::new("agent_message_delta", json!({"delta": " world"})));
    conn.inject(BackendEvent::new("task_complete", json!({})));

    // Every text emission for the turn shares one msg id
    let mut text_ids = Vec::new();
    let mut last_text = None;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match &event.content {
            MessageContent::Text { content } => {
                text_ids.push(event.msg_id.clone());
                last_text = Some(content.clone());
            }
            MessageContent::Finish => break,
            _ => {}
        }
    }
    text_ids.dedup();
    assert_eq!(text_ids.len(), 1);
    assert_eq!(last_text.as_deref(), Some("Hello world"));

    eventually(|| async {
        b.messages
            .get("c1", &text_ids[0])
            .await
            .map(|m| m.content == MessageContent::text("Hello world"))
            .unwrap_or(false)
    })
    .await;

    let user = b.messages.get("c1", "u1").await.unwrap();
    assert_eq!(user.position, MessagePosition::Right);
}

#[tokio::test]
async fn test_response_stream_yields_events() {
    let b = bridge();
    let conn = b
        .open("c1", ConversationRecord::new("c1", BackendKind::Gemini, "/tmp"))
        .await;
    let stream = b.registry.response_stream();
    tokio::pin!(stream);

    conn.inject(BackendEvent::new("content", json!("hi there")));
    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.conversation_id, "c1");
    assert_eq!(event.content, MessageContent::text("hi there"));
}

#[tokio::test]
async fn test_responder_drives_full_turn() {
    let factory = MemoryConnectionFactory::new().with_responder(Arc::new(|prompt: &str| {
        vec![
            BackendEvent::new(
                "session_update",
                json!({"update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": format!("echo: {}", prompt)}
                }}),
            ),
            BackendEvent::new("prompt_complete", json!({"stopReason": "end_turn"})),
        ]
    }));
    let b = bridge_with(factory, BridgeConfig::default());
    b.open("c1", ConversationRecord::new("c1", BackendKind::Acp, "/tmp"))
        .await;

    b.registry
        .send_message("c1", SendMessageRequest::new("ping").with_msg_id("u1"))
        .await
        .unwrap();

    eventually(|| async {
        b.stored("c1", MessageType::Text)
            .await
            .iter()
            .any(|m| m.content == MessageContent::text("echo: ping"))
    })
    .await;
}

#[tokio::test]
async fn test_prompts_serialized_per_turn() {
    let b = bridge();
    let conn = b
        .open("c1", ConversationRecord::new("c1", BackendKind::Codex, "/tmp"))
        .await;

    b.registry
        .send_message("c1", SendMessageRequest::new("first").with_msg_id("u1"))
        .await
        .unwrap();
    conn.inject(BackendEvent::new("task_started", json!({})));
    conn.inject(BackendEvent::new("agent_message_delta", json!({"delta": "working"})));

    let second = b
        .registry
        .send_message("c1", SendMessageRequest::new("second").with_msg_id("u2"));
    tokio::pin!(second);
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut second)
        .await
        .is_err());
    assert_eq!(conn.prompts(), vec!["first"]);
    assert!(b.messages.get("c1", "u2").await.is_none());

    conn.inject(BackendEvent::new("task_complete", json!({})));
    tokio::time::timeout(Duration::from_secs(5), &mut second)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.prompts(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_back_to_back_turns_with_responder() {
    let factory = MemoryConnectionFactory::new().with_responder(Arc::new(|_prompt: &str| {
        vec![BackendEvent::new("prompt_complete", json!({"stopReason": "end_turn"}))]
    }));
    let b = bridge_with(factory, BridgeConfig::default());
    let conn = b
        .open("c1", ConversationRecord::new("c1", BackendKind::Acp, "/tmp"))
        .await;

    for prompt in ["one", "two", "three"] {
        tokio::time::timeout(
            Duration::from_secs(5),
            b.registry.send_message("c1", SendMessageRequest::new(prompt)),
        )
        .await
        .unwrap()
        .unwrap();
    }
    assert_eq!(conn.prompts(), vec!["one", "two", "three"]);
}

// ─── Tool Confirmation ───────────────────────────────────────────

#[tokio::test]
async fn test_codex_patch_applied_after_approval() {
    let dir = tempfile::tempdir().unwrap();
    let b = bridge();
    let conn = b
        .open("c1", ConversationRecord::new("c1", BackendKind::Codex, dir.path()))
        .await;

    conn.inject(BackendEvent::new(
        "apply_patch_approval_request",
        json!({"call_id": "p1", "changes": {"notes.txt": {"type": "add", "content": "hi\n"}}}),
    ));
    eventually(|| async { !b.stored("c1", MessageType::PermissionRequest).await.is_empty() })
        .await;
    assert!(!dir.path().join("notes.txt").exists());

    b.registry
        .confirm_message("c1", "p1", "approved")
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
        "hi\n"
    );
    let responses = conn.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].decision, ConfirmDecision::ApproveOnce);

    eventually(|| async { tool_status_of(&b, "c1", "p1").await == Some(ToolStatus::Success) })
        .await;

    // A second confirmation for the resolved call is ignored
    b.registry
        .confirm_message("c1", "p1", "approved")
        .await
        .unwrap();
    assert_eq!(conn.responses().len(), 1);
}

#[tokio::test]
async fn test_codex_patch_rejected_leaves_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let b = bridge();
    let conn = b
        .open("c1", ConversationRecord::new("c1", BackendKind::Codex, dir.path()))
        .await;

    conn.inject(BackendEvent::new(
        "apply_patch_approval_request",
        json!({"call_id": "p1", "changes": {"a.txt": {"content": "x"}}}),
    ));
    eventually(|| async { !b.stored("c1", MessageType::PermissionRequest).await.is_empty() })
        .await;

    b.registry
        .confirm_message("c1", "p1", "denied")
        .await
        .unwrap();
    assert!(!dir.path().join("a.txt").exists());
    assert_eq!(conn.responses()[0].decision, ConfirmDecision::Reject);
    eventually(|| async { tool_status_of(&b, "c1", "p1").await == Some(ToolStatus::Canceled) })
        .await;
}

#[tokio::test]
async fn test_acp_permission_selects_matching_option() {
    let b = bridge();
    let conn = b
        .open("c1", ConversationRecord::new("c1", BackendKind::Acp, "/tmp"))
        .await;

    conn.inject(BackendEvent::new(
        "permission_request",
        json!({
            "toolCall": {"toolCallId": "t1", "title": "Run tests", "kind": "execute"},
            "options": [
                {"optionId": "opt-allow", "name": "Allow", "kind": "allow_once"},
                {"optionId": "opt-always", "name": "Always", "kind": "allow_always"},
                {"optionId": "opt-deny", "name": "Deny", "kind": "reject_once"}
            ]
        }),
    ));
    eventually(|| async { !b.stored("c1", MessageType::PermissionRequest).await.is_empty() })
        .await;

    b.registry
        .confirm_message("c1", "t1", "allow_always")
        .await
        .unwrap();
    let responses = conn.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].option_id.as_deref(), Some("opt-always"));
}

#[tokio::test]
async fn test_gemini_yolo_auto_approves() {
    let b = bridge();
    let record = ConversationRecord::new("c1", BackendKind::Gemini, "/tmp").with_extra(
        ConversationExtra {
            approval_mode: Some(ApprovalMode::Yolo),
            ..Default::default()
        },
    );
    let conn = b.open("c1", record).await;

    conn.inject(BackendEvent::new(
        "tool_group",
        json!([{
            "callId": "g1",
            "name": "Shell",
            "status": "Confirming",
            "confirmationDetails": {"type": "exec", "title": "Run", "command": "rm -rf build"}
        }]),
    ));
    eventually(|| async { conn.responses().len() == 1 }).await;
    assert_eq!(conn.responses()[0].option_id.as_deref(), Some("proceed_once"));
    assert!(b.stored("c1", MessageType::PermissionRequest).await.is_empty());
}

#[tokio::test]
async fn test_gemini_default_mode_asks() {
    let b = bridge();
    let conn = b
        .open("c1", ConversationRecord::new("c1", BackendKind::Gemini, "/tmp"))
        .await;

    conn.inject(BackendEvent::new(
        "tool_group",
        json!([{
            "callId": "g1",
            "name": "Shell",
            "status": "Confirming",
            "confirmationDetails": {"type": "exec", "title": "Run", "command": "make"}
        }]),
    ));
    eventually(|| async { !b.stored("c1", MessageType::PermissionRequest).await.is_empty() })
        .await;
    assert!(conn.responses().is_empty());

    b.registry
        .confirm_message("c1", "g1", "proceed_once")
        .await
        .unwrap();
    assert_eq!(conn.responses().len(), 1);
}

#[tokio::test]
async fn test_confirm_unknown_session() {
    let b = bridge();
    assert!(matches!(
        b.registry.confirm_message("ghost", "c1", "approved").await,
        Err(BridgeError::SessionNotFound(_))
    ));
}

// ─── Eviction & Teardown ─────────────────────────────────────────

#[tokio::test]
async fn test_send_after_eviction_rebuilds_from_record() {
    let b = bridge();
    b.open("c1", ConversationRecord::new("c1", BackendKind::Codex, "/tmp"))
        .await;
    b.registry.kill("c1").await;
    assert!(b.registry.get("c1").await.is_none());
    assert!(b.conversations.load("c1").await.unwrap().is_some());

    b.registry
        .send_message("c1", SendMessageRequest::new("are you there?"))
        .await
        .unwrap();
    assert_eq!(b.factory.created("c1"), 2);
    assert_eq!(
        b.factory.connection("c1").unwrap().prompts(),
        vec!["are you there?"]
    );
}

#[tokio::test]
async fn test_send_to_unknown_conversation() {
    let b = bridge();
    assert!(matches!(
        b.registry
            .send_message("ghost", SendMessageRequest::new("hi"))
            .await,
        Err(BridgeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_kill_mid_turn_discards_partial_text() {
    let b = bridge_with(
        MemoryConnectionFactory::new(),
        BridgeConfig::default().with_idle_finalize_ms(30),
    );
    let conn = b
        .open("c1", ConversationRecord::new("c1", BackendKind::Codex, "/tmp"))
        .await;

    conn.inject(BackendEvent::new("agent_message_delta", json!({"delta": "half"})));
    tokio::time::sleep(Duration::from_millis(5)).await;
    b.registry.kill("c1").await;
    b.registry.kill("c1").await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(b.stored("c1", MessageType::Text).await.is_empty());
    assert!(b.stored("c1", MessageType::Finish).await.is_empty());
    assert!(conn.is_shut_down());
}

#[tokio::test]
async fn test_clear_and_workspace_lookup() {
    let b = bridge();
    b.open("a", ConversationRecord::new("a", BackendKind::Codex, "/work/a"))
        .await;
    b.open("b", ConversationRecord::new("b", BackendKind::Acp, "/work/b"))
        .await;
    assert_eq!(b.registry.list().await.len(), 2);

    b.registry.clear().await;
    assert!(b.registry.list().await.is_empty());
    assert!(b.factory.connection("a").unwrap().is_shut_down());

    // Durable records still answer workspace lookups
    assert_eq!(
        b.registry.get_workspace("b").await.unwrap(),
        Path::new("/work/b")
    );
}

#[tokio::test]
async fn test_backend_exit_disconnects_session() {
    let b = bridge();
    let conn = b
        .open("c1", ConversationRecord::new("c1", BackendKind::Codex, "/tmp"))
        .await;
    let session = b.registry.get("c1").await.unwrap();
    conn.close();

    eventually(|| async { session.status() == SessionStatus::Disconnected }).await;
    assert!(session.send_message(SendMessageRequest::new("hi")).await.is_err());
}
