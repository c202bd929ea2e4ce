//! Canonical message emission
//!
//! Every message goes to the UI broadcast immediately. Persisted messages
//! are also queued to one background writer per session, which upserts
//! them in order without blocking emission on the store.

use crate::store::MessageStore;
use crate::types::{CanonicalMessage, MessageContent, ResponseEvent};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

enum PersistCommand {
    Upsert(CanonicalMessage),
    Flush(oneshot::Sender<()>),
}

/// Emits canonical messages for one conversation
#[derive(Clone)]
pub struct MessageEmitter {
    conversation_id: String,
    stream: broadcast::Sender<ResponseEvent>,
    persist: mpsc::UnboundedSender<PersistCommand>,
}

impl MessageEmitter {
    /// Create an emitter and spawn its persistence writer
    ///
    /// Must be called within a Tokio runtime. The writer exits once every
    /// clone of the emitter is dropped.
    pub fn new(
        conversation_id: impl Into<String>,
        store: Arc<dyn MessageStore>,
        stream: broadcast::Sender<ResponseEvent>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistCommand>();

        let writer_id = conversation_id.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    PersistCommand::Upsert(message) => {
                        let msg_id = message.msg_id.clone();
                        if let Err(e) = store.upsert_message(&writer_id, message).await {
                            tracing::warn!(
                                conversation_id = %writer_id,
                                msg_id = %msg_id,
                                error = %e,
                                "Failed to persist message"
                            );
                        }
                    }
                    PersistCommand::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self {
            conversation_id,
            stream,
            persist: tx,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Build a message for this conversation
    pub fn message(&self, msg_id: impl Into<String>, content: MessageContent) -> CanonicalMessage {
        CanonicalMessage::new(self.conversation_id.clone(), msg_id, content)
    }

    /// Send to the UI stream only
    pub fn emit(&self, message: &CanonicalMessage) {
        // No receivers is not an error; the UI may not be attached yet
        let _ = self.stream.send(message.to_response());
    }

    /// Send to the UI stream and queue for persistence
    pub fn emit_and_persist(&self, message: CanonicalMessage) {
        self.emit(&message);
        self.persist_only(message);
    }

    /// Queue for persistence without notifying the UI
    pub fn persist_only(&self, message: CanonicalMessage) {
        if self.persist.send(PersistCommand::Upsert(message)).is_err() {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                "Persistence writer stopped; message dropped"
            );
        }
    }

    /// Wait until every message queued so far has been handed to the store
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.persist.send(PersistCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}
