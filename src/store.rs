//! Message and conversation persistence seams
//!
//! The bridge only consumes these traits. `MemoryMessageStore` is the
//! reference implementation of the upsert merge rule and is what tests and
//! single-process hosts use; real hosts plug in their database.

use crate::error::{BridgeError, Result};
use crate::types::{CanonicalMessage, ConversationRecord, MessageContent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Upsert target for canonical messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or merge a message by `(conversation_id, msg_id)`
    async fn upsert_message(&self, conversation_id: &str, message: CanonicalMessage) -> Result<()>;
}

/// Durable conversation records, used to rebuild evicted sessions
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationRecord>>;

    async fn save(&self, record: &ConversationRecord) -> Result<()>;

    async fn remove(&self, conversation_id: &str) -> Result<()>;
}

/// Merge `incoming` into `existing` with the same msg id
///
/// Tool groups merge entry-wise by `callId`; every other type replaces.
pub fn merge_message(existing: &mut CanonicalMessage, incoming: CanonicalMessage) {
    match (&mut existing.content, incoming.content) {
        (MessageContent::ToolGroup(current), MessageContent::ToolGroup(updates)) => {
            for call in updates {
                match current.iter_mut().find(|c| c.call_id == call.call_id) {
                    Some(slot) => *slot = call,
                    None => current.push(call),
                }
            }
        }
        (content, other) => *content = other,
    }
    existing.position = incoming.position;
    if incoming.status.is_some() {
        existing.status = incoming.status;
    }
}

// ============================================================================
// In-memory message store
// ============================================================================

/// In-memory message store for testing and single-process use
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<HashMap<String, Vec<CanonicalMessage>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of a conversation in insertion order
    pub async fn list(&self, conversation_id: &str) -> Vec<CanonicalMessage> {
        let messages = self.messages.read().await;
        messages.get(conversation_id).cloned().unwrap_or_default()
    }

    pub async fn get(&self, conversation_id: &str, msg_id: &str) -> Option<CanonicalMessage> {
        let messages = self.messages.read().await;
        messages
            .get(conversation_id)?
            .iter()
            .find(|m| m.msg_id == msg_id)
            .cloned()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn upsert_message(&self, conversation_id: &str, message: CanonicalMessage) -> Result<()> {
        let mut messages = self.messages.write().await;
        let list = messages.entry(conversation_id.to_string()).or_default();
        match list.iter_mut().find(|m| m.msg_id == message.msg_id) {
            Some(existing) => merge_message(existing, message),
            None => list.push(message),
        }
        Ok(())
    }
}

// ============================================================================
// Conversation stores
// ============================================================================

/// In-memory conversation store for testing
#[derive(Default)]
pub struct MemoryConversationStore {
    records: RwLock<HashMap<String, ConversationRecord>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationRecord>> {
        Ok(self.records.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, record: &ConversationRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, conversation_id: &str) -> Result<()> {
        self.records.write().await.remove(conversation_id);
        Ok(())
    }
}

/// JSON file-based conversation store
///
/// One `<id>.json` per conversation. Atomic writes via temp file + rename
/// to prevent corruption.
pub struct FileConversationStore {
    dir: PathBuf,
}

impl FileConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, conversation_id: &str) -> Result<PathBuf> {
        let valid = !conversation_id.is_empty()
            && conversation_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(BridgeError::Store(format!(
                "Invalid conversation id for file store: {:?}",
                conversation_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", conversation_id)))
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationRecord>> {
        let path = self.record_path(conversation_id)?;
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BridgeError::Store(format!(
                    "Failed to read conversation file {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let record: ConversationRecord = serde_json::from_str(&json).map_err(|e| {
            BridgeError::Store(format!(
                "Failed to parse conversation file {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %path.display(), "Conversation loaded");
        Ok(Some(record))
    }

    async fn save(&self, record: &ConversationRecord) -> Result<()> {
        let path = self.record_path(&record.id)?;
        let json = serde_json::to_string_pretty(record)?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            BridgeError::Store(format!(
                "Failed to create conversation directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        // Atomic write: write to temp file, then rename
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json).await.map_err(|e| {
            BridgeError::Store(format!(
                "Failed to write conversation file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(|e| {
            BridgeError::Store(format!(
                "Failed to rename conversation file {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %path.display(), "Conversation saved");
        Ok(())
    }

    async fn remove(&self, conversation_id: &str) -> Result<()> {
        let path = self.record_path(conversation_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BridgeError::Store(format!(
                "Failed to remove conversation file {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
