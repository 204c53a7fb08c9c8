//! Prompt builder (design §4.7): two pure builders sharing one template
//! surface — an initial prompt for a fresh task attempt, and a retry
//! prompt for a follow-up attempt after a failed verification.
//!
//! Grounded in the teacher's `work_packet::generator::WorkPacketGenerator`
//! (assembles task objective, touched files, diff stat, and failure
//! signals into one context bundle before handing it to an agent) but
//! trimmed to what design §4.7 actually asks for: no AST symbol
//! extraction, no escalation-tier bookkeeping, just the task, progress
//! memory, diff state, and agent-memory-file snippets, each independently
//! clipped to a configured byte cap.

use crate::signature::trim_preserving_tail;
use crate::task::Task;
use serde::{Deserialize, Serialize};

const TRUNCATION_MARKER: &str = "...[truncated]...";

#[derive(Debug, Clone, Default)]
pub struct WorkspaceState {
    pub diff_stat: String,
    pub changed_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptLimits {
    pub codebase_patterns_bytes: usize,
    pub diff_bytes: usize,
    pub memory_file_bytes: usize,
    pub failure_output_bytes: usize,
    /// Failure output is also capped by line count before the byte cap is
    /// applied (design §4.11.3/§4.11.4); `0` disables the line dimension.
    pub failure_output_lines: usize,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            codebase_patterns_bytes: 4096,
            diff_bytes: 2048,
            memory_file_bytes: 2048,
            failure_output_bytes: 8192,
            failure_output_lines: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Clip `s` to at most `limit` bytes (on a char boundary), prefixing the
/// truncation marker when clipping occurred. `limit == 0` disables
/// clipping.
fn clip(s: &str, limit: usize) -> String {
    if limit == 0 || s.len() <= limit {
        return s.to_string();
    }
    let keep = limit.saturating_sub(TRUNCATION_MARKER.len() + 1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{TRUNCATION_MARKER}\n{}", &s[..end])
}

pub fn build_initial_prompt(
    task: &Task,
    codebase_patterns: &str,
    workspace: &WorkspaceState,
    memory_files: &[MemoryFile],
    limits: &PromptLimits,
) -> BuiltPrompt {
    let system_prompt = "You are an autonomous coding agent working one task at a time. \
Make the smallest correct change that satisfies the task's acceptance criteria. \
Do not create a git commit; the harness commits on your behalf after verification passes."
        .to_string();

    let mut user_prompt = String::new();
    user_prompt.push_str(&format!("# Task: {}\n\n", task.title));
    if !task.description.is_empty() {
        user_prompt.push_str(&format!("{}\n\n", task.description));
    }

    if !task.acceptance.is_empty() {
        user_prompt.push_str("## Acceptance criteria\n");
        for item in &task.acceptance {
            user_prompt.push_str(&format!("- {item}\n"));
        }
        user_prompt.push('\n');
    }

    if !task.verify.is_empty() {
        user_prompt.push_str("## Verification commands\n");
        for argv in &task.verify {
            user_prompt.push_str(&format!("- `{}`\n", argv.join(" ")));
        }
        user_prompt.push('\n');
    }

    if !codebase_patterns.trim().is_empty() {
        user_prompt.push_str("## Known codebase patterns\n");
        user_prompt.push_str(&clip(codebase_patterns, limits.codebase_patterns_bytes));
        user_prompt.push_str("\n\n");
    }

    if !workspace.diff_stat.trim().is_empty() || !workspace.changed_files.is_empty() {
        user_prompt.push_str("## Current workspace state\n");
        if !workspace.changed_files.is_empty() {
            user_prompt.push_str(&format!("Changed files: {}\n", workspace.changed_files.join(", ")));
        }
        if !workspace.diff_stat.trim().is_empty() {
            user_prompt.push_str(&clip(&workspace.diff_stat, limits.diff_bytes));
            user_prompt.push('\n');
        }
        user_prompt.push('\n');
    }

    for file in memory_files {
        user_prompt.push_str(&format!("## Notes from {}\n", file.path));
        user_prompt.push_str(&clip(&file.content, limits.memory_file_bytes));
        user_prompt.push_str("\n\n");
    }

    BuiltPrompt {
        system_prompt,
        user_prompt,
    }
}

pub fn build_retry_prompt(
    task: &Task,
    failure_output: &str,
    failure_signature: &str,
    attempt: u32,
    operator_feedback: Option<&str>,
    limits: &PromptLimits,
) -> BuiltPrompt {
    let system_prompt = "You are an autonomous coding agent resuming a task whose previous \
attempt failed verification. Make the smallest corrective edit. \
Do not create a git commit; the harness commits on your behalf after verification passes."
        .to_string();

    let mut user_prompt = String::new();
    user_prompt.push_str(&format!("# Task: {}\n\n", task.title));
    user_prompt.push_str(&format!("This is attempt #{attempt}. The previous attempt was tried and failed verification.\n\n"));

    user_prompt.push_str("## What failed\n");
    // Tail-preserving (design §4.11.3): the end of a verification log is
    // usually where the actual error lives, unlike the other sections
    // above which clip from the front.
    user_prompt.push_str(&trim_preserving_tail(
        failure_output,
        limits.failure_output_lines,
        limits.failure_output_bytes,
    ));
    user_prompt.push_str("\n\n");

    if !failure_signature.is_empty() {
        user_prompt.push_str(&format!("Failure signature: {failure_signature}\n\n"));
    }

    if let Some(feedback) = operator_feedback {
        if !feedback.trim().is_empty() {
            user_prompt.push_str("## Operator feedback\n");
            user_prompt.push_str(feedback.trim());
            user_prompt.push_str("\n\n");
        }
    }

    user_prompt.push_str("Make a corrective edit that addresses the failure above.\n");

    BuiltPrompt {
        system_prompt,
        user_prompt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        let mut t = Task::new("t-1", "Add parser for config files");
        t.description = "Parse TOML configs into the Config struct.".to_string();
        t.acceptance = vec!["toml files load without panicking".to_string()];
        t.verify = vec![vec!["cargo".to_string(), "test".to_string()]];
        t
    }

    #[test]
    fn initial_prompt_includes_task_fields() {
        let task = sample_task();
        let built = build_initial_prompt(&task, "", &WorkspaceState::default(), &[], &PromptLimits::default());
        assert!(built.user_prompt.contains("Add parser for config files"));
        assert!(built.user_prompt.contains("toml files load without panicking"));
        assert!(built.user_prompt.contains("cargo test"));
        assert!(built.system_prompt.contains("Do not create a git commit"));
    }

    #[test]
    fn codebase_patterns_are_clipped_with_marker() {
        let task = sample_task();
        let long = "x".repeat(10_000);
        let limits = PromptLimits {
            codebase_patterns_bytes: 100,
            ..PromptLimits::default()
        };
        let built = build_initial_prompt(&task, &long, &WorkspaceState::default(), &[], &limits);
        assert!(built.user_prompt.contains(TRUNCATION_MARKER));
    }

    #[test]
    fn memory_files_are_each_clipped_independently() {
        let task = sample_task();
        let files = vec![
            MemoryFile {
                path: "AGENTS.md".into(),
                content: "a".repeat(5000),
            },
            MemoryFile {
                path: "CLAUDE.md".into(),
                content: "short".into(),
            },
        ];
        let limits = PromptLimits {
            memory_file_bytes: 50,
            ..PromptLimits::default()
        };
        let built = build_initial_prompt(&task, "", &WorkspaceState::default(), &files, &limits);
        assert!(built.user_prompt.contains("Notes from AGENTS.md"));
        assert!(built.user_prompt.contains("Notes from CLAUDE.md"));
        assert!(built.user_prompt.contains("short"));
    }

    #[test]
    fn retry_prompt_includes_attempt_number_and_signature() {
        let task = sample_task();
        let built = build_retry_prompt(&task, "test failed: assertion error", "abc123", 2, None, &PromptLimits::default());
        assert!(built.user_prompt.contains("attempt #2"));
        assert!(built.user_prompt.contains("abc123"));
        assert!(built.user_prompt.contains("assertion error"));
    }

    #[test]
    fn retry_prompt_preserves_the_tail_of_long_failure_output() {
        let task = sample_task();
        let lines: Vec<String> = (1..=500).map(|n| format!("log line {n}")).collect();
        let failure_output = lines.join("\n");
        let limits = PromptLimits {
            failure_output_lines: 10,
            ..PromptLimits::default()
        };
        let built = build_retry_prompt(&task, &failure_output, "sig", 2, None, &limits);
        assert!(built.user_prompt.contains("log line 500"), "tail must survive trimming");
        assert!(!built.user_prompt.contains("log line 1\n"), "head should be dropped");
    }

    #[test]
    fn retry_prompt_includes_operator_feedback_when_present() {
        let task = sample_task();
        let built = build_retry_prompt(
            &task,
            "failed",
            "sig",
            1,
            Some("please check the edge case with empty input"),
            &PromptLimits::default(),
        );
        assert!(built.user_prompt.contains("Operator feedback"));
        assert!(built.user_prompt.contains("empty input"));
    }

    #[test]
    fn zero_limit_disables_clipping() {
        let task = sample_task();
        let long = "y".repeat(1000);
        let limits = PromptLimits {
            codebase_patterns_bytes: 0,
            ..PromptLimits::default()
        };
        let built = build_initial_prompt(&task, &long, &WorkspaceState::default(), &[], &limits);
        assert!(!built.user_prompt.contains(TRUNCATION_MARKER));
        assert!(built.user_prompt.contains(&long));
    }
}
