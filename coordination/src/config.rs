//! Ambient configuration (design §1A): the single typed surface an
//! operator fills in (via TOML or YAML) to stand up a controller — working
//! directory, branch naming, retry/verification budgets, the nested limits
//! structs owned by the budget/gutter/prompt modules, the verifier's
//! command allow-list, and the agent subprocess argv.
//!
//! Grounded in the teacher's `harness::startup` config-loading shape (one
//! struct, `Default` fills every field so a bare TOML file with just the
//! fields an operator cares about still deserializes) generalized from the
//! teacher's swarm-specific fields to the iteration controller's own knobs.

use crate::budget::BudgetLimits;
use crate::gutter::GutterThresholds;
use crate::prompt::PromptLimits;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Repository root the controller operates in.
    pub working_dir: PathBuf,
    /// Prefix prepended to a slugified task id/title to name the feature
    /// branch, e.g. `ralph/` -> `ralph/add-parser-a1b2c3d4`.
    pub branch_prefix: String,
    /// When set, overrides the derived branch name entirely.
    pub branch_override: Option<String>,

    /// Subdirectory (relative to `working_dir`) holding per-task JSON files.
    pub tasks_dir: PathBuf,
    /// Subdirectory holding per-iteration JSON records, named
    /// `iteration-<id>.json`. Shares a root with `logs_dir` by default, per
    /// the persisted layout in design §6.
    pub iterations_dir: PathBuf,
    /// Subdirectory holding controller state (budget/gutter snapshots, pause flag).
    pub state_dir: PathBuf,
    /// Subdirectory holding verification command scratch logs and agent
    /// transcripts (design §6: `.ralph/logs/<subdir>/...`).
    pub logs_dir: PathBuf,
    /// Path (relative to `working_dir`) of the progress-memory markdown file.
    pub progress_path: PathBuf,
    /// Subdirectory progress memory archives pruned log lines into.
    pub progress_archive_dir: PathBuf,

    /// Attempts allowed for a task before the controller gives up and marks
    /// it failed. `0` means unlimited.
    pub retry_budget: u32,
    /// Verification retry attempts within a single task attempt (design
    /// §4/§6: up to this many additional tries after the first, each
    /// feeding the failure back to the agent) before the attempt itself is
    /// counted against `retry_budget`. `0` means no retries: one shot.
    pub verification_retry_budget: u32,
    /// Wall-clock ceiling for one iteration (PROMPT_BUILD through COMMIT
    /// inclusive of verification retries). `0` means unbounded.
    pub max_minutes_per_iteration: i64,

    pub budget: BudgetLimits,
    pub gutter: GutterThresholds,

    /// argv for the agent subprocess, e.g. `["claude", "-p", "--output-format", "stream-json"]`.
    pub agent_command: Vec<String>,
    /// Echo assistant text to stdout as it streams in.
    pub stream_echo: bool,
    /// Tool names the agent subprocess is allowed to use; empty means no
    /// restriction is communicated (the subprocess's own defaults apply).
    pub allowed_tools: Vec<String>,

    /// Per-command timeout for verification commands, in seconds. `0` means
    /// unbounded.
    pub verify_command_timeout_secs: u64,
    /// Combined stdout+stderr byte cap per verification command. `0`
    /// disables truncation.
    pub verify_output_byte_limit: usize,
    /// If non-empty, only these argv[0] values may run as verification
    /// commands.
    pub verify_allow_list: Vec<String>,

    pub prompt_limits: PromptLimits,

    /// Minimum most-recent progress-log lines always kept on prune.
    pub progress_min_recent_lines: usize,
    /// Prune the progress log once it exceeds this many lines. `0` disables
    /// pruning.
    pub progress_max_log_lines: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            branch_prefix: "ralph/".to_string(),
            branch_override: None,

            tasks_dir: PathBuf::from(".ralph/tasks"),
            iterations_dir: PathBuf::from(".ralph/logs"),
            state_dir: PathBuf::from(".ralph/state"),
            logs_dir: PathBuf::from(".ralph/logs"),
            progress_path: PathBuf::from("progress.md"),
            progress_archive_dir: PathBuf::from(".ralph/archive"),

            retry_budget: 3,
            verification_retry_budget: 2,
            max_minutes_per_iteration: 30,

            budget: BudgetLimits::default(),
            gutter: GutterThresholds::default(),

            agent_command: vec!["claude".to_string(), "-p".to_string(), "--output-format".to_string(), "stream-json".to_string()],
            stream_echo: false,
            allowed_tools: Vec::new(),

            verify_command_timeout_secs: 300,
            verify_output_byte_limit: 64 * 1024,
            verify_allow_list: Vec::new(),

            prompt_limits: PromptLimits::default(),

            progress_min_recent_lines: 20,
            progress_max_log_lines: 200,
        }
    }
}

impl Config {
    /// Parse from a TOML document (the primary on-disk format, per §1A).
    pub fn from_toml_str(s: &str) -> crate::error::RalphResult<Self> {
        toml::from_str(s).map_err(|e| crate::error::RalphError::parse(e.to_string()))
    }

    /// Parse from a YAML document, accepted as an alternate format since
    /// task import already uses YAML (design §3).
    pub fn from_yaml_str(s: &str) -> crate::error::RalphResult<Self> {
        serde_yaml::from_str(s).map_err(|e| crate::error::RalphError::parse(e.to_string()))
    }

    pub fn load(path: &std::path::Path) -> crate::error::RalphResult<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn tasks_dir_abs(&self) -> PathBuf {
        self.working_dir.join(&self.tasks_dir)
    }

    pub fn iterations_dir_abs(&self) -> PathBuf {
        self.working_dir.join(&self.iterations_dir)
    }

    pub fn state_dir_abs(&self) -> PathBuf {
        self.working_dir.join(&self.state_dir)
    }

    pub fn logs_dir_abs(&self) -> PathBuf {
        self.working_dir.join(&self.logs_dir)
    }

    pub fn progress_path_abs(&self) -> PathBuf {
        self.working_dir.join(&self.progress_path)
    }

    pub fn progress_archive_dir_abs(&self) -> PathBuf {
        self.working_dir.join(&self.progress_archive_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_zero_budgets_meaning_unlimited() {
        let cfg = Config::default();
        assert_eq!(cfg.budget.max_iterations, 0);
        assert_eq!(cfg.gutter.max_same_failure, 3);
    }

    #[test]
    fn minimal_toml_fills_in_defaults() {
        let toml = r#"
            working_dir = "/repo"
            retry_budget = 5
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.working_dir, PathBuf::from("/repo"));
        assert_eq!(cfg.retry_budget, 5);
        assert_eq!(cfg.branch_prefix, "ralph/");
        assert_eq!(cfg.agent_command, vec!["claude", "-p", "--output-format", "stream-json"]);
    }

    #[test]
    fn yaml_round_trips_nested_limits() {
        let yaml = r#"
working_dir: /repo
budget:
  max_iterations: 10
  max_minutes: 0
  max_cost_usd: 0.0
gutter:
  max_same_failure: 5
  max_churn_iterations: 10
  churn_threshold: 4
  max_oscillations: 3
  enable_content_hash: true
"#;
        let cfg = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.budget.max_iterations, 10);
        assert_eq!(cfg.gutter.max_same_failure, 5);
    }

    #[test]
    fn abs_paths_join_working_dir() {
        let mut cfg = Config::default();
        cfg.working_dir = PathBuf::from("/repo");
        assert_eq!(cfg.tasks_dir_abs(), PathBuf::from("/repo/.ralph/tasks"));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(Config::from_toml_str("not = [valid").is_err());
    }
}
