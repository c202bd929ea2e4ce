//! Streaming text reconstruction
//!
//! Backends do not reliably send true increments: some resend the whole
//! cumulative text as a "delta", some replay the same fragment twice. The
//! accumulator merges fragments into one buffer per turn and always emits
//! the entire buffer under the turn's stable msg id, so the UI replaces the
//! displayed message instead of appending to it.
//!
//! An idle timer re-armed on every delta finalizes a turn the backend never
//! explicitly closes. The timer is owned here and cancelled by every
//! finalize path and by `cleanup`.

use crate::emitter::MessageEmitter;
use crate::types::{MessageContent, MessageStatus, TipsKind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How a delta changes the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// Cumulative resend: the delta becomes the buffer
    Replace,
    /// Exact repeat of the buffer: ignored
    Drop,
    Append,
}

/// Decide how `delta` merges into `buffer`
///
/// A longer delta that starts with the whole buffer is taken as a
/// cumulative resend. This cannot tell a resend from a large increment that
/// happens to begin with the buffered text.
pub fn merge_delta(buffer: &str, delta: &str) -> MergeAction {
    if delta.len() > buffer.len() && delta.starts_with(buffer) {
        MergeAction::Replace
    } else if delta == buffer && buffer.len() > 1 {
        MergeAction::Drop
    } else {
        MergeAction::Append
    }
}

/// What the accumulated text is rendered as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Assistant reply: `text` messages, closed with `finish`
    Assistant,
    /// Model reasoning: `tips` messages, no `finish`
    Reasoning,
}

#[derive(Default)]
struct DeltaState {
    turn_id: Option<String>,
    text: String,
    /// Bumped on every mutation; a timer only fires for its own generation
    generation: u64,
    timer: Option<JoinHandle<()>>,
    finished_since_complete: bool,
}

impl DeltaState {
    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.generation += 1;
    }
}

/// Merges a turn's streamed fragments into one replaceable message
#[derive(Clone)]
pub struct DeltaAccumulator {
    emitter: MessageEmitter,
    kind: StreamKind,
    idle: Duration,
    display: fn(&str) -> String,
    state: Arc<Mutex<DeltaState>>,
}

fn identity(text: &str) -> String {
    text.to_string()
}

impl DeltaAccumulator {
    pub fn new(emitter: MessageEmitter, idle: Duration) -> Self {
        Self::with_kind(emitter, StreamKind::Assistant, idle)
    }

    pub fn with_kind(emitter: MessageEmitter, kind: StreamKind, idle: Duration) -> Self {
        Self {
            emitter,
            kind,
            idle,
            display: identity,
            state: Arc::new(Mutex::new(DeltaState::default())),
        }
    }

    /// Transform applied to the buffer before it is shown or persisted
    pub fn with_display_filter(mut self, filter: fn(&str) -> String) -> Self {
        self.display = filter;
        self
    }

    fn lock(&self) -> MutexGuard<'_, DeltaState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current turn id, if a buffer is open
    pub fn turn_id(&self) -> Option<String> {
        self.lock().turn_id.clone()
    }

    /// Raw accumulated text of the open buffer
    pub fn text(&self) -> Option<String> {
        let state = self.lock();
        state.turn_id.as_ref().map(|_| state.text.clone())
    }

    pub fn is_open(&self) -> bool {
        self.lock().turn_id.is_some()
    }

    /// Merge a delta fragment and emit the whole buffer
    pub fn push_delta(&self, delta: &str) {
        if delta.is_empty() {
            return;
        }
        self.push(delta, false);
    }

    /// Replace the buffer with authoritative full text carried by a delta event
    pub fn push_full(&self, text: &str) {
        self.push(text, true);
    }

    fn push(&self, input: &str, authoritative: bool) {
        let (turn_id, snapshot) = {
            let mut state = self.lock();
            let turn_id = state
                .turn_id
                .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
                .clone();

            if authoritative {
                state.text = input.to_string();
            } else {
                match merge_delta(&state.text, input) {
                    MergeAction::Replace => state.text = input.to_string(),
                    MergeAction::Drop => {
                        tracing::debug!(turn_id = %turn_id, "Dropped repeated delta");
                    }
                    MergeAction::Append => state.text.push_str(input),
                }
            }

            state.cancel_timer();
            let generation = state.generation;
            let this = self.clone();
            let idle = self.idle;
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(idle).await;
                this.on_idle(generation);
            }));

            (turn_id, state.text.clone())
        };

        let display = (self.display)(&snapshot);
        if !display.is_empty() {
            let message = self
                .emitter
                .message(turn_id, self.content(display))
                .with_status(MessageStatus::Streaming);
            self.emitter.emit(&message);
        }
    }

    fn on_idle(&self, generation: u64) {
        let taken = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            // Our own handle; dropping it detaches rather than aborting this task
            state.timer = None;
            let turn = state.turn_id.take();
            let text = std::mem::take(&mut state.text);
            if turn.is_some() {
                state.finished_since_complete = true;
            }
            turn.map(|t| (t, text))
        };

        if let Some((turn_id, text)) = taken {
            tracing::debug!(turn_id = %turn_id, "Idle timeout finalized turn");
            self.finalize_emit(turn_id, text);
        }
    }

    /// Close the turn with an explicit final message
    ///
    /// Non-empty `final_text` is authoritative; otherwise the accumulated
    /// buffer is what gets persisted.
    pub fn finalize_message(&self, final_text: Option<&str>) {
        let (turn_id, text) = {
            let mut state = self.lock();
            state.cancel_timer();
            let turn_id = state
                .turn_id
                .take()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let buffered = std::mem::take(&mut state.text);
            state.finished_since_complete = true;
            let text = match final_text {
                Some(t) if !t.is_empty() => t.to_string(),
                _ => buffered,
            };
            (turn_id, text)
        };
        self.finalize_emit(turn_id, text);
    }

    /// Close the turn because the backend reported the task complete
    ///
    /// Flushes an open buffer. With nothing open, still emits one `finish`
    /// unless a turn was already finished since the previous completion.
    pub fn task_complete(&self) {
        enum Action {
            Flush(String, String),
            FinishOnly,
            Nothing,
        }

        let action = {
            let mut state = self.lock();
            state.cancel_timer();
            let action = match state.turn_id.take() {
                Some(turn) => Action::Flush(turn, std::mem::take(&mut state.text)),
                None if !state.finished_since_complete => Action::FinishOnly,
                None => Action::Nothing,
            };
            state.finished_since_complete = false;
            action
        };

        match action {
            Action::Flush(turn_id, text) => self.finalize_emit(turn_id, text),
            Action::FinishOnly => self.emit_finish(uuid::Uuid::new_v4().to_string()),
            Action::Nothing => {}
        }
    }

    /// Cancel the timer and discard any open buffer without emitting
    pub fn cleanup(&self) {
        let mut state = self.lock();
        state.cancel_timer();
        state.turn_id = None;
        state.text.clear();
        state.finished_since_complete = false;
    }

    fn content(&self, text: String) -> MessageContent {
        match self.kind {
            StreamKind::Assistant => MessageContent::text(text),
            StreamKind::Reasoning => MessageContent::tips(text, TipsKind::Info),
        }
    }

    fn finalize_emit(&self, turn_id: String, text: String) {
        let display = (self.display)(&text);
        if !display.is_empty() {
            let message = self
                .emitter
                .message(turn_id.clone(), self.content(display))
                .with_status(MessageStatus::Done);
            self.emitter.emit_and_persist(message);
        }
        if self.kind == StreamKind::Assistant {
            self.emit_finish(turn_id);
        }
    }

    fn emit_finish(&self, turn_id: String) {
        let finish = self.emitter.message(turn_id, MessageContent::Finish);
        self.emitter.emit(&finish);
    }
}
