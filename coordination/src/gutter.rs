//! Gutter detector (design §4.9): spot repeated-failure, file-churn, and
//! oscillation stall patterns from a sliding window of iteration records.
//!
//! Grounded in the teacher's `escalation::state::EscalationState` (bounded
//! sliding window of per-iteration error categories, a repeat counter, a
//! `check_progress`-style gate) and `escalation::friction::FrictionDetector`
//! (oscillation defined as a signal reappearing after being seen before),
//! re-targeted from semantic error categories to design §4.9's file-path
//! sets and SHA-256 failure signatures, since this harness's "stall" is
//! about the codebase churning, not about which compiler-error category
//! recurs.

use crate::iteration_record::{IterationRecord, Outcome};
use crate::signature::compute_failure_signature;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GutterThresholds {
    /// 0 disables the repeated-failure check.
    pub max_same_failure: u32,
    /// Sliding window length; 0 disables window-based checks.
    pub max_churn_iterations: usize,
    /// A file must appear at least this many times in the window; 0 disables.
    pub churn_threshold: u32,
    /// 0 disables the oscillation check.
    pub max_oscillations: u32,
    /// Gates the oscillation check entirely.
    pub enable_content_hash: bool,
}

impl Default for GutterThresholds {
    fn default() -> Self {
        Self {
            max_same_failure: 3,
            max_churn_iterations: 10,
            churn_threshold: 4,
            max_oscillations: 3,
            enable_content_hash: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GutterState {
    /// failure signature -> occurrence count
    pub failure_counts: HashMap<String, u32>,
    /// sliding window of changed-file sets, one per recent iteration
    pub window: VecDeque<Vec<String>>,
    /// per-file reappearance counter (oscillation)
    pub file_reappearance: HashMap<String, u32>,
    /// per-file: has this file been seen before (for reappearance detection)
    pub file_seen_before: HashMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallStatus {
    None,
    RepeatedFailure { signature_prefix: String, count: u32 },
    Oscillation { file: String, count: u32 },
    FileChurn { file: String, count: u32 },
}

pub struct GutterDetector {
    thresholds: GutterThresholds,
    state: GutterState,
}

impl GutterDetector {
    pub fn new(thresholds: GutterThresholds) -> Self {
        Self {
            thresholds,
            state: GutterState::default(),
        }
    }

    pub fn with_state(thresholds: GutterThresholds, state: GutterState) -> Self {
        Self { thresholds, state }
    }

    pub fn get_state(&self) -> GutterState {
        self.state.clone()
    }

    pub fn set_state(&mut self, state: GutterState) {
        self.state = state;
    }

    pub fn record_iteration(&mut self, record: &IterationRecord) {
        if !record.files_changed.is_empty() {
            self.state.window.push_back(record.files_changed.clone());
            if self.thresholds.max_churn_iterations > 0 {
                while self.state.window.len() > self.thresholds.max_churn_iterations {
                    self.state.window.pop_front();
                }
            }

            if self.thresholds.enable_content_hash {
                for file in &record.files_changed {
                    let seen_before = *self.state.file_seen_before.get(file).unwrap_or(&false);
                    if seen_before {
                        *self.state.file_reappearance.entry(file.clone()).or_insert(0) += 1;
                    }
                    self.state.file_seen_before.insert(file.clone(), true);
                }
            }
        }

        if record.outcome == Outcome::Failed {
            let signature = compute_failure_signature(&record.verification_outputs);
            if !signature.is_empty() {
                *self.state.failure_counts.entry(signature).or_insert(0) += 1;
            }
        }
    }

    /// First-matching stall status, in priority order: repeated_failure,
    /// oscillation, file_churn.
    pub fn check(&self) -> StallStatus {
        if self.thresholds.max_same_failure > 0 {
            if let Some((signature, count)) = self
                .state
                .failure_counts
                .iter()
                .find(|(_, &count)| count >= self.thresholds.max_same_failure)
            {
                return StallStatus::RepeatedFailure {
                    signature_prefix: signature.chars().take(12).collect(),
                    count: *count,
                };
            }
        }

        if self.thresholds.max_oscillations > 0 {
            if let Some((file, count)) = self
                .state
                .file_reappearance
                .iter()
                .find(|(_, &count)| count >= self.thresholds.max_oscillations)
            {
                return StallStatus::Oscillation {
                    file: file.clone(),
                    count: *count,
                };
            }
        }

        if self.thresholds.churn_threshold > 0 {
            let mut occurrences: HashMap<&str, u32> = HashMap::new();
            for files in &self.state.window {
                for file in files {
                    *occurrences.entry(file.as_str()).or_insert(0) += 1;
                }
            }
            if let Some((file, count)) = occurrences
                .iter()
                .find(|(_, &count)| count >= self.thresholds.churn_threshold)
            {
                return StallStatus::FileChurn {
                    file: file.to_string(),
                    count: *count,
                };
            }
        }

        StallStatus::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration_record::AgentInvocation;
    use crate::verifier::VerificationOutput;
    use chrono::Utc;

    fn failed_record(files: &[&str], failing_output: &str) -> IterationRecord {
        let now = Utc::now();
        IterationRecord {
            iteration_id: "iter0001".to_string(),
            task_id: "t-1".to_string(),
            start_time: now,
            end_time: now,
            attempt: 1,
            claude_invocation: AgentInvocation {
                command: vec!["claude".to_string()],
                model: None,
                session_id: None,
                total_cost_usd: 0.0,
                input_tokens: 0,
                output_tokens: 0,
            },
            base_commit: "base".to_string(),
            result_commit: String::new(),
            verification_outputs: vec![VerificationOutput {
                command: vec!["cargo".to_string(), "test".to_string()],
                passed: false,
                output: failing_output.to_string(),
                duration_ms: 0,
            }],
            files_changed: files.iter().map(|f| f.to_string()).collect(),
            outcome: Outcome::Failed,
            feedback: None,
        }
    }

    #[test]
    fn repeated_failure_triggers_at_threshold() {
        let thresholds = GutterThresholds {
            max_same_failure: 3,
            ..GutterThresholds::default()
        };
        let mut gutter = GutterDetector::new(thresholds);
        for _ in 0..2 {
            gutter.record_iteration(&failed_record(&["a.rs"], "same error"));
        }
        assert_eq!(gutter.check(), StallStatus::None);
        gutter.record_iteration(&failed_record(&["a.rs"], "same error"));
        match gutter.check() {
            StallStatus::RepeatedFailure { count, .. } => assert_eq!(count, 3),
            other => panic!("expected RepeatedFailure, got {other:?}"),
        }
    }

    #[test]
    fn oscillation_triggers_when_file_reappears_enough() {
        let thresholds = GutterThresholds {
            max_same_failure: 0,
            max_oscillations: 2,
            churn_threshold: 0,
            ..GutterThresholds::default()
        };
        let mut gutter = GutterDetector::new(thresholds);
        for _ in 0..3 {
            gutter.record_iteration(&failed_record(&["a.rs"], "err"));
        }
        match gutter.check() {
            StallStatus::Oscillation { file, count } => {
                assert_eq!(file, "a.rs");
                assert_eq!(count, 2);
            }
            other => panic!("expected Oscillation, got {other:?}"),
        }
    }

    #[test]
    fn file_churn_triggers_on_window_occurrence_threshold() {
        let thresholds = GutterThresholds {
            max_same_failure: 0,
            max_oscillations: 0,
            enable_content_hash: false,
            churn_threshold: 3,
            max_churn_iterations: 10,
        };
        let mut gutter = GutterDetector::new(thresholds);
        for _ in 0..3 {
            gutter.record_iteration(&failed_record(&["b.rs"], "err"));
        }
        match gutter.check() {
            StallStatus::FileChurn { file, count } => {
                assert_eq!(file, "b.rs");
                assert_eq!(count, 3);
            }
            other => panic!("expected FileChurn, got {other:?}"),
        }
    }

    #[test]
    fn repeated_failure_priority_over_churn() {
        let thresholds = GutterThresholds {
            max_same_failure: 2,
            max_oscillations: 0,
            enable_content_hash: false,
            churn_threshold: 2,
            max_churn_iterations: 10,
        };
        let mut gutter = GutterDetector::new(thresholds);
        for _ in 0..2 {
            gutter.record_iteration(&failed_record(&["c.rs"], "identical failure"));
        }
        match gutter.check() {
            StallStatus::RepeatedFailure { .. } => {}
            other => panic!("expected RepeatedFailure to take priority, got {other:?}"),
        }
    }

    #[test]
    fn window_is_trimmed_to_configured_length() {
        let thresholds = GutterThresholds {
            max_same_failure: 0,
            max_oscillations: 0,
            enable_content_hash: false,
            churn_threshold: 0,
            max_churn_iterations: 2,
        };
        let mut gutter = GutterDetector::new(thresholds);
        for i in 0..5 {
            gutter.record_iteration(&failed_record(&[&format!("f{i}.rs")], "err"));
        }
        assert_eq!(gutter.get_state().window.len(), 2);
    }

    #[test]
    fn zero_thresholds_disable_their_checks() {
        let gutter = GutterDetector::new(GutterThresholds {
            max_same_failure: 0,
            max_churn_iterations: 0,
            churn_threshold: 0,
            max_oscillations: 0,
            enable_content_hash: false,
        });
        assert_eq!(gutter.check(), StallStatus::None);
    }

    #[test]
    fn state_round_trips() {
        let mut gutter = GutterDetector::new(GutterThresholds::default());
        gutter.record_iteration(&failed_record(&["d.rs"], "err"));
        let state = gutter.get_state();

        let mut resumed = GutterDetector::new(GutterThresholds::default());
        resumed.set_state(state.clone());
        assert_eq!(resumed.get_state().window.len(), state.window.len());
    }
}
