//! Display-text sanitizing and stable error ids
//!
//! Filters run on the text shown to the user, never on the accumulated
//! buffer, so a marker split across two deltas is still removed once the
//! whole line is present.

use regex::Regex;
use std::sync::OnceLock;

fn internal_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?im)^(?:\*\*(?:Preparing|Considering|Thinking|Processing|Analyzing|Evaluating|Generating|Formulating|Crafting|Creating).*|Preparing\s+.*|Considering\s+user\s+input.*|---+[ \t]*|[ \t]*\.\.\.[ \t]*|[ \t]*Loading\.\.\.[ \t]*|[ \t]*Please\s+wait\.\.\.[ \t]*)$",
        )
        .unwrap()
    })
}

fn blank_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]+$").unwrap())
}

fn newline_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").unwrap())
}

fn collapse_newlines(text: &str) -> String {
    newline_run_re().replace_all(text, "\n\n").into_owned()
}

/// Remove progress marker lines some backends interleave with real output
///
/// Lines such as `**Preparing response**`, `Loading...` or a bare `---`
/// are dropped, blank runs collapse to one empty line, and the result is
/// trimmed.
pub fn filter_internal_markers(content: &str) -> String {
    let filtered = internal_marker_re().replace_all(content, "");
    let filtered = blank_line_re().replace_all(&filtered, "");
    collapse_newlines(&filtered).trim().to_string()
}

fn think_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<\s*think\s*>.*?<\s*/\s*think\s*>|<\s*thinking\s*>.*?<\s*/\s*thinking\s*>")
            .unwrap()
    })
}

fn orphan_close_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)\A.*?<\s*/\s*think(?:ing)?\s*>").unwrap())
}

fn think_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<\s*/?\s*think(?:ing)?\s*>").unwrap())
}

/// Whether the text contains any think tag, opening or closing
pub fn has_think_tags(content: &str) -> bool {
    think_tag_re().is_match(content)
}

/// Strip `<think>`/`<thinking>` reasoning from model output
///
/// Complete blocks are removed first. Some models omit the opening tag,
/// so everything before the first orphan closing tag is reasoning too.
/// Remaining stray tags are dropped while surrounding text is kept.
pub fn strip_think_tags(content: &str) -> String {
    if !has_think_tags(content) {
        return content.to_string();
    }
    let stripped = think_block_re().replace_all(content, "");
    let stripped = orphan_close_prefix_re().replace(&stripped, "");
    let stripped = think_tag_re().replace_all(&stripped, "");
    collapse_newlines(&stripped).trim().to_string()
}

fn retry_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i);\s*retrying\s+\d+/\d+\s+in\s+[\d.]+[ms]+[^;]*$").unwrap()
    })
}

/// Message with any `; retrying N/M in Xms` suffix removed
pub fn normalize_retry_message(message: &str) -> String {
    if message.contains("retrying") {
        retry_suffix_re().replace(message, "").into_owned()
    } else {
        message.to_string()
    }
}

/// Short stable hash of an error message, in base 36
///
/// 31-based wrapping 32-bit hash over UTF-16 code units, so ids match the
/// ones already persisted by earlier clients.
pub fn error_hash(message: &str) -> String {
    let normalized = normalize_retry_message(message);
    let mut hash: i32 = 0;
    for unit in normalized.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(unit));
    }
    to_base36(u64::from(hash.unsigned_abs()))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Message id for a stream error
///
/// Retry notices and the final "error sending request" share one id so the
/// final error replaces the retry line.
pub fn stream_error_msg_id(message: &str) -> String {
    let hash = error_hash(message);
    if message.contains("retrying") || message.contains("error sending request") {
        format!("stream_retry_{}", hash)
    } else {
        format!("stream_error_{}", hash)
    }
}

/// Message id for a generic backend error
pub fn error_msg_id(message: &str) -> String {
    format!("error_{}", error_hash(message))
}
