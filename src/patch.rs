//! Strict unified-diff parsing and application
//!
//! The patcher is intentionally non-fuzzy: every context and deletion line
//! must match the base file exactly at the expected position. A mismatch
//! aborts that file before anything is written, so a failed patch never
//! leaves a half-applied file behind.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Path used by unified diffs to mean "no file"
pub const NULL_PATH: &str = "/dev/null";

/// Errors raised while parsing or applying a patch
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("context mismatch in {path} at line {line}: expected {expected:?}, found {found:?}")]
    ContextMismatch {
        path: String,
        line: usize,
        expected: String,
        found: String,
    },

    #[error("deletion mismatch in {path} at line {line}: expected {expected:?}, found {found:?}")]
    DeletionMismatch {
        path: String,
        line: usize,
        expected: String,
        found: String,
    },

    #[error("invalid hunk header: {0}")]
    InvalidHunkHeader(String),

    #[error("hunk in {path} starts at line {line} but the file has {len} lines")]
    HunkOutOfRange { path: String, line: usize, len: usize },

    #[error("hunk in {path} at line {line} overlaps the previous hunk")]
    HunkOverlap { path: String, line: usize },

    #[error("diff for {0} contains no hunks")]
    EmptyDiff(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{source} (after {} file(s) were already written)", .applied.len())]
    Partial {
        applied: Vec<String>,
        #[source]
        source: Box<PatchError>,
    },
}

impl PatchError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

// ============================================================================
// Change specs
// ============================================================================

/// How one file should change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawChange", into = "FileChange")]
pub enum ChangeSpec {
    /// Overwrite the file with literal content
    Content { content: String },
    /// Apply a unified diff, optionally moving the result
    UnifiedDiff {
        unified_diff: String,
        move_path: Option<String>,
    },
    /// Remove the file
    Delete,
}

impl ChangeSpec {
    pub fn content(content: impl Into<String>) -> Self {
        Self::Content {
            content: content.into(),
        }
    }

    pub fn diff(unified_diff: impl Into<String>) -> Self {
        Self::UnifiedDiff {
            unified_diff: unified_diff.into(),
            move_path: None,
        }
    }

    fn action_label(&self) -> &'static str {
        match self {
            Self::Content { .. } => "add",
            Self::UnifiedDiff { .. } => "update",
            Self::Delete => "delete",
        }
    }
}

/// Typed change form emitted by streaming-JSON backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FileChange {
    Add {
        content: String,
    },
    Delete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Update {
        unified_diff: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        move_path: Option<String>,
    },
}

/// Every accepted input shape for a change
#[derive(Deserialize)]
#[serde(untagged)]
enum RawChange {
    Typed(FileChange),
    Diff {
        #[serde(alias = "unifiedDiff")]
        unified_diff: String,
        #[serde(default, alias = "movePath")]
        move_path: Option<String>,
    },
    Content {
        content: String,
    },
}

impl From<RawChange> for ChangeSpec {
    fn from(raw: RawChange) -> Self {
        match raw {
            RawChange::Typed(FileChange::Add { content }) | RawChange::Content { content } => {
                ChangeSpec::Content { content }
            }
            RawChange::Typed(FileChange::Delete { .. }) => ChangeSpec::Delete,
            RawChange::Typed(FileChange::Update {
                unified_diff,
                move_path,
            })
            | RawChange::Diff {
                unified_diff,
                move_path,
            } => ChangeSpec::UnifiedDiff {
                unified_diff,
                move_path,
            },
        }
    }
}

impl From<ChangeSpec> for FileChange {
    fn from(spec: ChangeSpec) -> Self {
        match spec {
            ChangeSpec::Content { content } => FileChange::Add { content },
            ChangeSpec::UnifiedDiff {
                unified_diff,
                move_path,
            } => FileChange::Update {
                unified_diff,
                move_path,
            },
            ChangeSpec::Delete => FileChange::Delete { content: None },
        }
    }
}

/// File path → change, applied in path order
pub type PatchChangeSet = BTreeMap<String, ChangeSpec>;

/// One line per file ("update: src/main.rs"), or "No changes"
pub fn summarize_changes(changes: &PatchChangeSet) -> String {
    if changes.is_empty() {
        return "No changes".to_string();
    }
    changes
        .iter()
        .map(|(path, spec)| format!("{}: {}", spec.action_label(), path))
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// Parsing
// ============================================================================

/// One line inside a hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Delete(String),
}

/// A parsed `@@ -a,b +c,d @@` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    pub lines: Vec<HunkLine>,
}

/// Result of parsing one file's unified diff
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDiff {
    /// `--- /dev/null`: there is no original file
    pub creates: bool,
    /// `+++ /dev/null`: the file is removed and hunks are not parsed
    pub deletes: bool,
    pub hunks: Vec<Hunk>,
}

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap()
    })
}

fn is_null_path(header_rest: &str) -> bool {
    // Headers may carry a tab-separated timestamp after the path
    header_rest.split('\t').next().map(str::trim) == Some(NULL_PATH)
}

fn parse_hunk_header(line: &str) -> Result<Hunk, PatchError> {
    let caps = hunk_header_re()
        .captures(line)
        .ok_or_else(|| PatchError::InvalidHunkHeader(line.to_string()))?;
    let num = |i: usize, default: usize| -> Result<usize, PatchError> {
        match caps.get(i) {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|_| PatchError::InvalidHunkHeader(line.to_string())),
            None => Ok(default),
        }
    };
    Ok(Hunk {
        old_start: num(1, 0)?,
        old_lines: num(2, 1)?,
        new_start: num(3, 0)?,
        new_lines: num(4, 1)?,
        lines: Vec::new(),
    })
}

/// Parse a single-file unified diff
///
/// File header lines are only recognized before the first hunk; inside a
/// hunk a line starting with `-` is always a deletion.
pub fn parse_unified_diff(diff: &str) -> Result<ParsedDiff, PatchError> {
    let mut parsed = ParsedDiff::default();
    let mut current: Option<Hunk> = None;

    for line in diff.lines() {
        if line.starts_with("@@") {
            if let Some(hunk) = current.take() {
                parsed.hunks.push(hunk);
            }
            current = Some(parse_hunk_header(line)?);
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            if let Some(rest) = line.strip_prefix("--- ") {
                parsed.creates = is_null_path(rest);
            } else if let Some(rest) = line.strip_prefix("+++ ") {
                if is_null_path(rest) {
                    parsed.deletes = true;
                    return Ok(parsed);
                }
            }
            continue;
        };

        if let Some(text) = line.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(text.to_string()));
        } else if let Some(text) = line.strip_prefix('+') {
            hunk.lines.push(HunkLine::Add(text.to_string()));
        } else if let Some(text) = line.strip_prefix('-') {
            hunk.lines.push(HunkLine::Delete(text.to_string()));
        } else if line.is_empty() {
            // Some generators drop the leading space of blank context lines
            hunk.lines.push(HunkLine::Context(String::new()));
        }
        // "\ No newline at end of file" and anything else is ignored
    }

    if let Some(hunk) = current.take() {
        parsed.hunks.push(hunk);
    }
    Ok(parsed)
}

// ============================================================================
// Application
// ============================================================================

/// Apply hunks to `base`, returning the new content
///
/// `path` is only used in error messages.
pub fn apply_hunks(base: &str, hunks: &[Hunk], path: &str) -> Result<String, PatchError> {
    let eol = if base.contains("\r\n") { "\r\n" } else { "\n" };
    let keep_trailing_newline = base.is_empty() || base.ends_with('\n');
    let base_lines: Vec<&str> = base.lines().collect();

    let mut out: Vec<&str> = Vec::with_capacity(base_lines.len());
    let mut cursor = 0usize;

    for hunk in hunks {
        // A pure insertion (`-N,0`) goes after line N; otherwise the hunk starts at line N
        let target = if hunk.old_lines == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        if target < cursor {
            return Err(PatchError::HunkOverlap {
                path: path.to_string(),
                line: hunk.old_start,
            });
        }
        if target > base_lines.len() {
            return Err(PatchError::HunkOutOfRange {
                path: path.to_string(),
                line: hunk.old_start,
                len: base_lines.len(),
            });
        }
        out.extend_from_slice(&base_lines[cursor..target]);
        cursor = target;

        for line in &hunk.lines {
            match line {
                HunkLine::Context(expected) => match base_lines.get(cursor) {
                    Some(actual) if actual == expected => {
                        out.push(actual);
                        cursor += 1;
                    }
                    found => {
                        return Err(PatchError::ContextMismatch {
                            path: path.to_string(),
                            line: cursor + 1,
                            expected: expected.clone(),
                            found: found.unwrap_or(&"<end of file>").to_string(),
                        })
                    }
                },
                HunkLine::Delete(expected) => match base_lines.get(cursor) {
                    Some(actual) if actual == expected => cursor += 1,
                    found => {
                        return Err(PatchError::DeletionMismatch {
                            path: path.to_string(),
                            line: cursor + 1,
                            expected: expected.clone(),
                            found: found.unwrap_or(&"<end of file>").to_string(),
                        })
                    }
                },
                HunkLine::Add(text) => out.push(text),
            }
        }
    }
    out.extend_from_slice(&base_lines[cursor..]);

    let mut result = out.join(eol);
    if !out.is_empty() && keep_trailing_newline {
        result.push_str(eol);
    }
    Ok(result)
}

/// What happened to one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutcome {
    pub path: String,
    pub action: FileAction,
}

/// Outcome of a fully applied change set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchReport {
    pub files: Vec<FileOutcome>,
}

impl PatchReport {
    /// Human-readable summary, one `A`/`M`/`D` line per file
    pub fn summary(&self) -> String {
        let mut lines = vec!["Success. Updated the following files:".to_string()];
        for outcome in &self.files {
            let marker = match outcome.action {
                FileAction::Added => "A",
                FileAction::Modified => "M",
                FileAction::Deleted => "D",
            };
            lines.push(format!("{} {}", marker, outcome.path));
        }
        lines.join("\n")
    }
}

/// Applies change sets to files under a workspace root
#[derive(Debug, Clone)]
pub struct PatchEngine {
    root: PathBuf,
}

impl PatchEngine {
    /// Relative paths in change sets resolve against `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    /// Apply every change in path order, stopping at the first failure
    ///
    /// Files written before the failure stay written; the error lists them.
    pub fn apply(&self, changes: &PatchChangeSet) -> Result<PatchReport, PatchError> {
        let mut report = PatchReport::default();
        for (path, spec) in changes {
            match self.apply_change(path, spec) {
                Ok(outcome) => report.files.push(outcome),
                Err(e) if report.files.is_empty() => return Err(e),
                Err(e) => {
                    return Err(PatchError::Partial {
                        applied: report.files.into_iter().map(|o| o.path).collect(),
                        source: Box::new(e),
                    })
                }
            }
        }
        tracing::debug!(
            root = %self.root.display(),
            files = report.files.len(),
            "Patch applied"
        );
        Ok(report)
    }

    /// Apply one change to one file
    pub fn apply_change(&self, path: &str, spec: &ChangeSpec) -> Result<FileOutcome, PatchError> {
        let target = self.resolve(path);
        match spec {
            ChangeSpec::Content { content } => {
                let existed = target.exists();
                write_atomic(&target, content)?;
                Ok(FileOutcome {
                    path: path.to_string(),
                    action: if existed {
                        FileAction::Modified
                    } else {
                        FileAction::Added
                    },
                })
            }
            ChangeSpec::Delete => {
                remove_if_present(&target)?;
                Ok(FileOutcome {
                    path: path.to_string(),
                    action: FileAction::Deleted,
                })
            }
            ChangeSpec::UnifiedDiff {
                unified_diff,
                move_path,
            } => {
                let parsed = parse_unified_diff(unified_diff)?;
                if parsed.deletes {
                    remove_if_present(&target)?;
                    return Ok(FileOutcome {
                        path: path.to_string(),
                        action: FileAction::Deleted,
                    });
                }
                if parsed.hunks.is_empty() && !parsed.creates {
                    return Err(PatchError::EmptyDiff(path.to_string()));
                }

                let existed = target.exists();
                let base = if parsed.creates || !existed {
                    String::new()
                } else {
                    std::fs::read_to_string(&target).map_err(|e| PatchError::io(&target, e))?
                };
                let updated = apply_hunks(&base, &parsed.hunks, path)?;

                match move_path {
                    Some(dest) => {
                        let dest_path = self.resolve(dest);
                        write_atomic(&dest_path, &updated)?;
                        if dest_path != target {
                            remove_if_present(&target)?;
                        }
                        Ok(FileOutcome {
                            path: dest.clone(),
                            action: FileAction::Modified,
                        })
                    }
                    None => {
                        write_atomic(&target, &updated)?;
                        Ok(FileOutcome {
                            path: path.to_string(),
                            action: if existed && !parsed.creates {
                                FileAction::Modified
                            } else {
                                FileAction::Added
                            },
                        })
                    }
                }
            }
        }
    }
}

/// Write via temp file + rename so readers never see a partial file
fn write_atomic(path: &Path, content: &str) -> Result<(), PatchError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PatchError::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.patch.tmp", file_name));
    std::fs::write(&tmp_path, content).map_err(|e| PatchError::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| PatchError::io(path, e))?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), PatchError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "File already absent");
            Ok(())
        }
        Err(e) => Err(PatchError::io(path, e)),
    }
}
