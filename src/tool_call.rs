//! Tool-call lifecycle tracking
//!
//! All call-id-indexed state of a session (calls, output buffers, cached
//! change sets, the pending-confirmation set, UI message ids) lives in one
//! arena behind one lock, so `cleanup` releases everything at once.
//!
//! Status changes go through `ToolStatus::can_transition_to`; an event that
//! would move a call backwards or out of a terminal state is dropped.

use crate::emitter::MessageEmitter;
use crate::patch::{summarize_changes, PatchChangeSet, PatchEngine, PatchError};
use crate::types::{ConfirmDecision, MessageContent, ToolCall, ToolKind, ToolStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    #[default]
    Stdout,
    Stderr,
}

/// Description of a tool call as it begins
#[derive(Debug, Clone)]
pub struct ToolBegin {
    pub call_id: String,
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
    /// Needs a user decision before it may run
    pub requires_confirmation: bool,
    /// Status to start in when it differs from what `requires_confirmation` implies
    pub initial_status: Option<ToolStatus>,
    /// File changes to apply once approved (or immediately if auto-approved)
    pub changes: Option<PatchChangeSet>,
    pub result_display: Option<String>,
    pub render_output_as_markdown: bool,
}

impl ToolBegin {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            kind,
            description: String::new(),
            requires_confirmation: false,
            initial_status: None,
            changes: None,
            result_display: None,
            render_output_as_markdown: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn requiring_confirmation(mut self, required: bool) -> Self {
        self.requires_confirmation = required;
        self
    }

    /// Start in `status` without joining the pending-confirmation set
    pub fn with_status(mut self, status: ToolStatus) -> Self {
        self.initial_status = Some(status);
        self
    }

    pub fn with_changes(mut self, changes: PatchChangeSet) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn with_result_display(mut self, display: impl Into<String>) -> Self {
        self.result_display = Some(display.into());
        self
    }

    pub fn markdown(mut self) -> Self {
        self.render_output_as_markdown = true;
        self
    }
}

/// Result of a user confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Not pending: unknown or already resolved
    Ignored,
    /// Call canceled, cached changes discarded
    Rejected,
    /// Call executing; `patched` tells whether cached changes were applied here
    Approved { patched: bool },
}

/// Finished calls kept for lookups and late-event suppression
pub const FINISHED_HISTORY: usize = 256;

#[derive(Default)]
struct OutputBuffer {
    stdout: String,
    stderr: String,
    combined: String,
}

#[derive(Default)]
struct CallArena {
    calls: HashMap<String, ToolCall>,
    /// callId → tool_group msg id, stable until the call is terminal
    group_ids: HashMap<String, String>,
    outputs: HashMap<String, OutputBuffer>,
    changes: HashMap<String, PatchChangeSet>,
    summaries: HashMap<String, String>,
    pending: HashSet<String>,
    /// Terminal call ids, oldest first
    finished: VecDeque<String>,
}

impl CallArena {
    /// Apply a status change, returning the updated call when allowed
    fn transition(&mut self, call_id: &str, next: ToolStatus) -> Option<&mut ToolCall> {
        let call = self.calls.get_mut(call_id)?;
        if !call.status.can_transition_to(next) {
            tracing::debug!(
                call_id = %call_id,
                from = %call.status,
                to = %next,
                "Ignored non-monotonic tool status"
            );
            return None;
        }
        call.status = next;
        Some(call)
    }

    fn group_id(&mut self, call_id: &str) -> String {
        self.group_ids
            .entry(call_id.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    /// Drop per-call buffers once a call is terminal
    ///
    /// The call itself stays visible until `FINISHED_HISTORY` newer calls
    /// have finished. An event for an evicted id starts a new call.
    fn retire(&mut self, call_id: &str) {
        self.outputs.remove(call_id);
        self.changes.remove(call_id);
        self.summaries.remove(call_id);
        self.pending.remove(call_id);
        self.group_ids.remove(call_id);

        let terminal = self
            .calls
            .get(call_id)
            .map_or(false, |c| c.status.is_terminal());
        if !terminal || self.finished.iter().any(|id| id == call_id) {
            return;
        }
        self.finished.push_back(call_id.to_string());
        while self.finished.len() > FINISHED_HISTORY {
            if let Some(oldest) = self.finished.pop_front() {
                self.calls.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.calls.clear();
        self.group_ids.clear();
        self.outputs.clear();
        self.changes.clear();
        self.summaries.clear();
        self.pending.clear();
        self.finished.clear();
    }
}

/// Per-session tool-call state machine
pub struct ToolCallLifecycle {
    emitter: MessageEmitter,
    engine: PatchEngine,
    arena: Mutex<CallArena>,
}

impl ToolCallLifecycle {
    /// Relative patch paths resolve against `workspace`
    pub fn new(emitter: MessageEmitter, workspace: impl Into<PathBuf>) -> Self {
        Self {
            emitter,
            engine: PatchEngine::new(workspace),
            arena: Mutex::new(CallArena::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallArena> {
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, call_id: &str) -> Option<ToolCall> {
        self.lock().calls.get(call_id).cloned()
    }

    pub fn is_pending(&self, call_id: &str) -> bool {
        self.lock().pending.contains(call_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn has_cached_changes(&self, call_id: &str) -> bool {
        self.lock().changes.contains_key(call_id)
    }

    /// Number of calls held, live and recently finished
    pub fn tracked_calls(&self) -> usize {
        self.lock().calls.len()
    }

    /// Number of calls with live output buffers
    pub fn live_buffers(&self) -> usize {
        self.lock().outputs.len()
    }

    /// Create a call, or merge into a live one with the same id
    ///
    /// Auto-approved calls carrying changes are applied immediately.
    pub async fn begin(&self, spec: ToolBegin) {
        let call_id = spec.call_id.clone();
        let auto_apply = {
            let mut arena = self.lock();

            if let Some(changes) = spec.changes.clone() {
                arena
                    .summaries
                    .insert(call_id.clone(), summarize_changes(&changes));
                arena.changes.insert(call_id.clone(), changes);
            }

            let desired = match spec.initial_status {
                Some(status) if !spec.requires_confirmation => status,
                _ if spec.requires_confirmation => ToolStatus::Confirming,
                _ => ToolStatus::Executing,
            };
            let display = spec
                .result_display
                .clone()
                .or_else(|| arena.summaries.get(&call_id).cloned());

            match arena.calls.get(&call_id).map(|c| c.status) {
                Some(status) if status.is_terminal() => {
                    tracing::debug!(call_id = %call_id, "Begin for finished tool call ignored");
                    arena.changes.remove(&call_id);
                    arena.summaries.remove(&call_id);
                    return;
                }
                Some(_) => {
                    if let Some(call) = arena.calls.get_mut(&call_id) {
                        if !spec.name.is_empty() {
                            call.name = spec.name.clone();
                        }
                        if !spec.description.is_empty() {
                            call.description = spec.description.clone();
                        }
                        if let Some(display) = display {
                            call.result_display = display;
                        }
                    }
                    arena.transition(&call_id, desired);
                }
                None => {
                    let mut call = ToolCall::new(&call_id, &spec.name, spec.kind);
                    call.description = spec.description.clone();
                    call.status = desired;
                    call.render_output_as_markdown = spec.render_output_as_markdown;
                    call.result_display = display.unwrap_or_default();
                    arena.calls.insert(call_id.clone(), call);
                    arena.outputs.insert(call_id.clone(), OutputBuffer::default());
                    tracing::debug!(call_id = %call_id, status = %desired, "Tool call started");
                }
            }

            let status = arena.calls.get(&call_id).map(|c| c.status);
            if spec.requires_confirmation && status == Some(ToolStatus::Confirming) {
                arena.pending.insert(call_id.clone());
            }
            self.emit_locked(&mut arena, &call_id);
            if status.map_or(false, |s| s.is_terminal()) {
                arena.retire(&call_id);
            }

            status == Some(ToolStatus::Executing) && arena.changes.contains_key(&call_id)
        };

        if auto_apply {
            self.apply_cached(&call_id).await;
        }
    }

    /// Put a live call into the pending-confirmation set
    ///
    /// Used when a permission request arrives for a call that already
    /// exists. Returns false for unknown or finished calls.
    pub fn request_confirmation(&self, call_id: &str) -> bool {
        let mut arena = self.lock();
        match arena.calls.get(call_id).map(|c| c.status) {
            Some(status) if !status.is_terminal() => {
                if !arena.pending.insert(call_id.to_string()) {
                    return true;
                }
                if status != ToolStatus::Confirming {
                    tracing::debug!(
                        call_id = %call_id,
                        status = %status,
                        "Permission requested for running tool call"
                    );
                }
                self.emit_locked(&mut arena, call_id);
                true
            }
            _ => false,
        }
    }

    /// Append streamed output and re-emit with the combined output
    pub fn output(&self, call_id: &str, stream: OutputStream, chunk: &str) {
        let mut arena = self.lock();
        if arena.calls.get(call_id).map_or(true, |c| c.status.is_terminal()) {
            tracing::debug!(call_id = %call_id, "Output for unknown or finished tool call dropped");
            return;
        }

        let combined = {
            let buf = arena.outputs.entry(call_id.to_string()).or_default();
            match stream {
                OutputStream::Stdout => buf.stdout.push_str(chunk),
                OutputStream::Stderr => buf.stderr.push_str(chunk),
            }
            buf.combined.push_str(chunk);
            buf.combined.clone()
        };

        if let Some(call) = arena.transition(call_id, ToolStatus::Executing) {
            call.result_display = combined;
        }
        self.emit_locked(&mut arena, call_id);
    }

    /// Collected stdout and stderr of a live call
    pub fn output_of(&self, call_id: &str) -> Option<(String, String)> {
        let arena = self.lock();
        arena
            .outputs
            .get(call_id)
            .map(|b| (b.stdout.clone(), b.stderr.clone()))
    }

    /// Non-terminal progress update (status and/or display)
    pub fn progress(&self, call_id: &str, status: ToolStatus, result_display: Option<String>) {
        if status.is_terminal() {
            self.end_with_status(call_id, status, result_display);
            return;
        }
        let mut arena = self.lock();
        match arena.transition(call_id, status) {
            Some(call) => {
                if let Some(display) = result_display {
                    call.result_display = display;
                }
            }
            None => return,
        }
        self.emit_locked(&mut arena, call_id);
    }

    /// Finish a call from a success flag or zero exit code
    ///
    /// Buffered output wins over `output`, which is the backend's own
    /// aggregate and only used when nothing was streamed.
    pub fn end(&self, call_id: &str, success: bool, output: Option<String>) {
        let status = if success {
            ToolStatus::Success
        } else {
            ToolStatus::Error
        };
        self.end_with_status(call_id, status, output);
    }

    fn end_with_status(&self, call_id: &str, status: ToolStatus, output: Option<String>) {
        let mut arena = self.lock();
        let buffered = arena
            .outputs
            .get(call_id)
            .map(|b| b.combined.clone())
            .filter(|s| !s.is_empty());

        match arena.transition(call_id, status) {
            Some(call) => {
                if let Some(display) = buffered.or(output).filter(|s| !s.is_empty()) {
                    call.result_display = display;
                }
            }
            None => {
                if !arena.calls.contains_key(call_id) {
                    tracing::warn!(call_id = %call_id, "End for unknown tool call dropped");
                }
                return;
            }
        }

        tracing::debug!(call_id = %call_id, status = %status, "Tool call finished");
        self.emit_locked(&mut arena, call_id);
        arena.retire(call_id);
    }

    /// Resolve a pending confirmation
    ///
    /// A call that is not pending is left alone, so a double-fired
    /// confirmation only takes effect once.
    pub async fn confirm(&self, call_id: &str, decision: ConfirmDecision) -> ConfirmOutcome {
        let has_changes = {
            let mut arena = self.lock();
            if !arena.pending.remove(call_id) {
                tracing::debug!(call_id = %call_id, "Confirmation for non-pending call ignored");
                return ConfirmOutcome::Ignored;
            }

            if !decision.is_approved() {
                arena.changes.remove(call_id);
                if arena.transition(call_id, ToolStatus::Canceled).is_some() {
                    self.emit_locked(&mut arena, call_id);
                }
                arena.retire(call_id);
                tracing::info!(call_id = %call_id, "Tool call rejected");
                return ConfirmOutcome::Rejected;
            }

            if arena.transition(call_id, ToolStatus::Executing).is_some() {
                self.emit_locked(&mut arena, call_id);
            }
            arena.changes.contains_key(call_id)
        };

        tracing::info!(call_id = %call_id, decision = ?decision, "Tool call approved");
        if has_changes {
            self.apply_cached(call_id).await;
        }
        ConfirmOutcome::Approved {
            patched: has_changes,
        }
    }

    /// Apply the cached change set of an executing call and finish it
    async fn apply_cached(&self, call_id: &str) {
        let Some(changes) = self.lock().changes.remove(call_id) else {
            return;
        };

        let engine = self.engine.clone();
        let result = tokio::task::spawn_blocking(move || engine.apply(&changes)).await;
        let (status, display) = match result {
            Ok(Ok(report)) => (ToolStatus::Success, report.summary()),
            Ok(Err(e)) => {
                tracing::warn!(call_id = %call_id, error = %e, "Patch application failed");
                let summary = self.lock().summaries.get(call_id).cloned();
                (ToolStatus::Error, failure_display(&e, summary.as_deref()))
            }
            Err(e) => (ToolStatus::Error, format!("Patch task failed: {}", e)),
        };

        // The session may have been torn down while the patch ran
        let mut arena = self.lock();
        if let Some(call) = arena.transition(call_id, status) {
            call.result_display = display;
            self.emit_locked(&mut arena, call_id);
            arena.retire(call_id);
        }
    }

    /// Release every call and buffer
    pub fn cleanup(&self) {
        let mut arena = self.lock();
        let live = arena.calls.len();
        arena.clear();
        tracing::debug!(calls = live, "Tool call arena cleared");
    }

    fn emit_locked(&self, arena: &mut CallArena, call_id: &str) {
        let Some(call) = arena.calls.get(call_id).cloned() else {
            return;
        };
        let msg_id = arena.group_id(call_id);
        let message = self
            .emitter
            .message(msg_id, MessageContent::ToolGroup(vec![call]));
        self.emitter.emit_and_persist(message);
    }
}

fn failure_display(error: &PatchError, summary: Option<&str>) -> String {
    let mut display = format!("Patch failed: {}", error);
    if let PatchError::Partial { applied, .. } = error {
        display.push_str("\nAlready written:");
        for path in applied {
            display.push_str("\n  ");
            display.push_str(path);
        }
    }
    if let Some(summary) = summary {
        display.push_str("\n\n");
        display.push_str(summary);
    }
    display
}
