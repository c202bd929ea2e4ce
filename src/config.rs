//! Bridge configuration
//!
//! Loaded from a JSON file or built in code. Every field has a default so a
//! partial file (or `{}`) is a valid configuration.

use crate::error::{BridgeError, Result};
use crate::types::BackendKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Idle window after the last delta before a turn is auto-finalized
pub const DEFAULT_IDLE_FINALIZE_MS: u64 = 3_000;

/// How long `send_message` waits for a session to become active
pub const DEFAULT_BOOTSTRAP_TIMEOUT_MS: u64 = 60_000;

/// Capacity of the UI response broadcast channel
pub const DEFAULT_RESPONSE_BUFFER: usize = 1024;

/// Which tool calls are approved without asking the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalMode {
    /// Ask for every mutating call
    #[default]
    Default,
    /// Auto-approve file edits and informational calls
    AutoEdit,
    /// Auto-approve everything
    Yolo,
}

// ============================================================================
// Backend settings
// ============================================================================

/// How to launch one backend CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSettings {
    /// Executable path; `None` means resolve from `PATH`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<PathBuf>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Configuration for the agent bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Idle auto-finalize window in milliseconds (default: 3000)
    #[serde(default = "default_idle_finalize_ms")]
    pub idle_finalize_ms: u64,

    /// Bootstrap wait in milliseconds (default: 60000)
    #[serde(default = "default_bootstrap_timeout_ms")]
    pub bootstrap_timeout_ms: u64,

    /// UI broadcast channel capacity (default: 1024)
    #[serde(default = "default_response_buffer")]
    pub response_buffer_size: usize,

    /// Default approval mode when a conversation does not set one
    #[serde(default)]
    pub approval_mode: ApprovalMode,

    /// Directory for the file-backed conversation store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_dir: Option<PathBuf>,

    /// Launch settings keyed by backend name ("codex", "gemini", or an ACP backend name)
    #[serde(default)]
    pub backends: HashMap<String, BackendSettings>,
}

fn default_idle_finalize_ms() -> u64 {
    DEFAULT_IDLE_FINALIZE_MS
}

fn default_bootstrap_timeout_ms() -> u64 {
    DEFAULT_BOOTSTRAP_TIMEOUT_MS
}

fn default_response_buffer() -> usize {
    DEFAULT_RESPONSE_BUFFER
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            idle_finalize_ms: DEFAULT_IDLE_FINALIZE_MS,
            bootstrap_timeout_ms: DEFAULT_BOOTSTRAP_TIMEOUT_MS,
            response_buffer_size: DEFAULT_RESPONSE_BUFFER,
            approval_mode: ApprovalMode::Default,
            conversation_dir: None,
            backends: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            BridgeError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        tracing::debug!(path = %path.display(), "Bridge config loaded");
        Ok(config)
    }

    /// Reject values that would make sessions unusable
    pub fn validate(&self) -> Result<()> {
        if self.idle_finalize_ms == 0 {
            return Err(BridgeError::Config(
                "idleFinalizeMs must be greater than 0".to_string(),
            ));
        }
        if self.bootstrap_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "bootstrapTimeoutMs must be greater than 0".to_string(),
            ));
        }
        if self.response_buffer_size == 0 {
            return Err(BridgeError::Config(
                "responseBufferSize must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_idle_finalize_ms(mut self, ms: u64) -> Self {
        self.idle_finalize_ms = ms;
        self
    }

    pub fn with_bootstrap_timeout_ms(mut self, ms: u64) -> Self {
        self.bootstrap_timeout_ms = ms;
        self
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_conversation_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.conversation_dir = Some(dir.into());
        self
    }

    pub fn with_backend(mut self, name: impl Into<String>, settings: BackendSettings) -> Self {
        self.backends.insert(name.into(), settings);
        self
    }

    pub fn idle_finalize(&self) -> Duration {
        Duration::from_millis(self.idle_finalize_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    /// Launch settings for a backend, by ACP backend name when given
    pub fn backend_settings(
        &self,
        kind: BackendKind,
        acp_backend: Option<&str>,
    ) -> Option<&BackendSettings> {
        match (kind, acp_backend) {
            (BackendKind::Acp, Some(name)) => self.backends.get(name),
            _ => self.backends.get(kind.as_str()),
        }
    }
}
