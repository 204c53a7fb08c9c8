//! Failure signature and output-trimming policy (design §4.9, §4.11.4).
//!
//! Grounded in the general shape of the teacher's `verifier::report`
//! (bundling non-passing gate command + output pairs) plus its
//! `escalation::state` error-category bookkeeping, but narrowed to what
//! design §4.11.4 specifies exactly: a SHA-256 hex digest over sorted
//! `"argv:output"` strings, order-insensitive, and a tail-preserving
//! line/byte trim with a visible truncation marker.

use crate::verifier::VerificationOutput;
use sha2::{Digest, Sha256};

const TRUNCATION_MARKER: &str = "...[truncated]...\n";

/// SHA-256 hex of the sorted, newline-joined `"argv:output"` strings for
/// every non-passed command; empty string if nothing failed. Order of the
/// input slice does not affect the result.
pub fn compute_failure_signature(outputs: &[VerificationOutput]) -> String {
    let mut parts: Vec<String> = outputs
        .iter()
        .filter(|o| !o.passed)
        .map(|o| format!("{}:{}", o.command.join(" "), o.output))
        .collect();

    if parts.is_empty() {
        return String::new();
    }

    parts.sort();
    let joined = parts.join("\n");

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Trim `text` to at most `max_lines` lines and `max_bytes` bytes,
/// preserving the tail (most recent output is usually the most relevant).
/// A limit of `0` disables that dimension's check. When trimming occurs
/// the result begins with the truncation marker.
pub fn trim_preserving_tail(text: &str, max_lines: usize, max_bytes: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();

    let line_trimmed: Vec<&str> = if max_lines > 0 && lines.len() > max_lines {
        lines[lines.len() - max_lines..].to_vec()
    } else {
        lines
    };

    let mut joined = line_trimmed.join("\n");
    let mut truncated = line_trimmed.len() < text.lines().count();

    if max_bytes > 0 && joined.len() > max_bytes {
        // Reserve room for the marker itself so the final, marker-prefixed
        // result still fits within `max_bytes` (design §4.11.4).
        let keep = max_bytes.saturating_sub(TRUNCATION_MARKER.len());
        let mut start = joined.len().saturating_sub(keep);
        while start < joined.len() && !joined.is_char_boundary(start) {
            start += 1;
        }
        joined = joined[start..].to_string();
        truncated = true;
    }

    if truncated {
        format!("{TRUNCATION_MARKER}{joined}")
    } else {
        joined
    }
}
