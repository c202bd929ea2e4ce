//! Session status state machine
//!
//! Every accepted transition emits one `status` message under the same
//! per-session msg id, so the UI shows a single status line that updates in
//! place.

use crate::emitter::MessageEmitter;
use crate::error::{BridgeError, Result};
use crate::types::{BackendKind, MessageContent, SessionStatus, StatusUpdate};
use std::time::Duration;
use tokio::sync::watch;

pub struct StatusTracker {
    backend: BackendKind,
    msg_id: String,
    emitter: MessageEmitter,
    tx: watch::Sender<SessionStatus>,
}

impl StatusTracker {
    pub fn new(backend: BackendKind, emitter: MessageEmitter) -> Self {
        let (tx, _) = watch::channel(SessionStatus::Initializing);
        Self {
            backend,
            msg_id: format!("status_{}", uuid::Uuid::new_v4()),
            emitter,
            tx,
        }
    }

    pub fn current(&self) -> SessionStatus {
        *self.tx.borrow()
    }

    /// Stable id of this session's status message
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    /// Move to `next` and emit the status message
    ///
    /// The check and the update happen atomically; an illegal edge leaves
    /// the status unchanged and emits nothing.
    pub fn transition(&self, next: SessionStatus, message: impl Into<String>) -> Result<()> {
        let mut rejected_from = None;
        self.tx.send_if_modified(|status| {
            if status.can_transition_to(next) {
                *status = next;
                true
            } else {
                rejected_from = Some(*status);
                false
            }
        });

        if let Some(from) = rejected_from {
            tracing::warn!(
                conversation_id = %self.emitter.conversation_id(),
                from = %from,
                to = %next,
                "Rejected session status transition"
            );
            return Err(BridgeError::InvalidTransition {
                from: from.to_string(),
                to: next.to_string(),
            });
        }

        tracing::info!(
            conversation_id = %self.emitter.conversation_id(),
            backend = %self.backend,
            status = %next,
            "Session status changed"
        );

        let update = StatusUpdate {
            backend: self.backend,
            status: next,
            message: message.into(),
        };
        let msg = self
            .emitter
            .message(self.msg_id.clone(), MessageContent::Status(update));
        self.emitter.emit_and_persist(msg);
        Ok(())
    }

    /// Wait until the session is active
    ///
    /// Fails fast once the session is in `error` or `disconnected`.
    pub async fn wait_for_active(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let wait = async {
            loop {
                let status = *rx.borrow_and_update();
                match status {
                    SessionStatus::SessionActive => return Ok(()),
                    SessionStatus::Error | SessionStatus::Disconnected => {
                        return Err(BridgeError::Bootstrap(format!(
                            "{} session is {}",
                            self.backend, status
                        )))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(BridgeError::Connection(
                        "Session status channel closed".to_string(),
                    ));
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            BridgeError::Timeout(format!(
                "{} session not active after {}ms",
                self.backend,
                timeout.as_millis()
            ))
        })?
    }
}
