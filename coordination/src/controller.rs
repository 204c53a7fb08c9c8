//! Iteration controller (design §2/§5): the outer task-selection loop and
//! the per-task iteration state machine (PROMPT_BUILD -> AGENT_CALL ->
//! CHANGE_CHECK -> VERIFY[retry] -> COMMIT) that drives every other module
//! in this crate.
//!
//! Grounded in the teacher's `harness::session::SessionManager` for the
//! iteration-counting/budget-checking outer shape, and in
//! `council::mod.rs`'s pattern of holding collaborators behind trait
//! objects so the whole thing is testable without a real subprocess.
//! Cancellation and per-iteration deadlines are expressed with
//! `tokio_util::sync::CancellationToken` combined with `tokio::select!`
//! (design notes §9's "cancellable context," realized the idiomatic async
//! way rather than as a polled boolean).

use crate::agent_runner::{AgentRequest, AgentRunnerHandle, AgentResponse};
use crate::budget::{BudgetTracker, StopReason};
use crate::config::Config;
use crate::error::{RalphError, RalphResult};
use crate::fsutil::{read_json, write_json_atomic};
use crate::graph::DependencyGraph;
use crate::gutter::{GutterDetector, StallStatus};
use crate::iteration_record::{AgentInvocation, IterationRecord, IterationRecordStore, Outcome, new_iteration_id};
use crate::progress_memory::ProgressMemory;
use crate::prompt::{self, MemoryFile, WorkspaceState};
use crate::selector::{descendants_of, Selector};
use crate::signature::compute_failure_signature;
use crate::task::{Task, TaskStatus};
use crate::task_store::TaskStore;
use crate::verifier::{all_passed, Verifier, VerifierConfig, VerificationOutput};
use crate::vcs::VcsManager;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MEMORY_FILE_NAMES: &[&str] = &["AGENTS.md", "CLAUDE.md"];
/// Cap on the one-line "what changed" summary appended to progress memory
/// on success (design §4.11.2); the agent's final text is usually much
/// longer than one line.
const PROGRESS_SUMMARY_MAX_CHARS: usize = 200;

/// Why `run_loop` stopped selecting new tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Every task in scope reached a terminal status (completed, skipped,
    /// or gave up as failed).
    AllTasksCompleted,
    /// No task in scope is both open and ready, but the scope is not fully
    /// terminal either (e.g. everything remaining is blocked on a
    /// dependency that will never complete, or on a human).
    NoReadyTask,
    BudgetExceeded(StopReason),
    GutterDetected(StallStatus),
    /// An operator-dropped pause flag was present at the top of an
    /// iteration; the loop stopped before starting a new task.
    Paused,
}

pub struct Controller {
    config: Config,
    task_store: TaskStore,
    agent: Arc<dyn AgentRunnerHandle>,
    verifier: Verifier,
    vcs: VcsManager,
    progress: ProgressMemory,
    records: IterationRecordStore,
    budget: BudgetTracker,
    gutter: GutterDetector,
}

impl Controller {
    /// Build every collaborator from `config`, resuming persisted
    /// budget/gutter state from `<state_dir>/{budget,gutter}.json` if
    /// present (design §6: the controller must survive a process
    /// restart mid-run).
    pub fn new(config: Config, agent: Arc<dyn AgentRunnerHandle>) -> RalphResult<Self> {
        let task_store = TaskStore::new(config.tasks_dir_abs())?;
        let records = IterationRecordStore::new(config.iterations_dir_abs())?;
        std::fs::create_dir_all(config.state_dir_abs())?;
        std::fs::create_dir_all(config.logs_dir_abs())?;

        let verifier = Verifier::new(VerifierConfig {
            working_dir: config.working_dir.clone(),
            command_timeout: if config.verify_command_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(config.verify_command_timeout_secs))
            },
            output_byte_limit: config.verify_output_byte_limit,
            allow_list: config.verify_allow_list.clone(),
        });

        let vcs = VcsManager::new(&config.working_dir);
        vcs.init()?;

        let progress = ProgressMemory::new(
            config.progress_path_abs(),
            config.progress_archive_dir_abs(),
            config.progress_min_recent_lines,
            config.progress_max_log_lines,
        );

        let budget_state = read_json(&config.state_dir_abs().join("budget.json")).unwrap_or_default();
        let gutter_state = read_json(&config.state_dir_abs().join("gutter.json")).unwrap_or_default();

        Ok(Self {
            budget: BudgetTracker::with_state(config.budget, budget_state),
            gutter: GutterDetector::with_state(config.gutter, gutter_state),
            config,
            task_store,
            agent,
            verifier,
            vcs,
            progress,
            records,
        })
    }

    pub fn task_store(&self) -> &TaskStore {
        &self.task_store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn persist_state(&self) -> RalphResult<()> {
        write_json_atomic(&self.config.state_dir_abs().join("budget.json"), &self.budget.get_state())?;
        write_json_atomic(&self.config.state_dir_abs().join("gutter.json"), &self.gutter.get_state())?;
        Ok(())
    }

    fn pause_flag_path(&self) -> PathBuf {
        self.config.state_dir_abs().join("PAUSE")
    }

    pub fn is_paused(&self) -> bool {
        self.pause_flag_path().exists()
    }

    /// Drop the pause flag file an operator uses to halt the loop between
    /// iterations without killing the process.
    pub fn pause(&self) -> RalphResult<()> {
        std::fs::write(self.pause_flag_path(), b"")?;
        Ok(())
    }

    pub fn resume(&self) -> RalphResult<()> {
        let path = self.pause_flag_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn feedback_path(&self, task_id: &str) -> PathBuf {
        self.config.state_dir_abs().join(format!("feedback-{task_id}.md"))
    }

    /// An operator may drop a file here between iterations; its contents
    /// are folded into the next retry prompt for that task (design §4.7).
    fn read_feedback(&self, task_id: &str) -> Option<String> {
        std::fs::read_to_string(self.feedback_path(task_id)).ok()
    }

    fn remove_feedback_if_present(&self, task_id: &str) {
        let _ = std::fs::remove_file(self.feedback_path(task_id));
    }

    fn failed_attempt_count(&self, task_id: &str) -> RalphResult<u32> {
        let records = self.records.load_all()?;
        Ok(records
            .iter()
            .filter(|r| r.task_id == task_id && r.outcome == Outcome::Failed)
            .count() as u32)
    }

    /// The most recent failed `IterationRecord` for `task_id`, newest-first
    /// by `end_time` (design §4.11.3: supplies the failure output and
    /// signature for the inter-iteration retry prompt when a task is
    /// re-selected after a previous attempt failed).
    fn most_recent_failed_record(&self, task_id: &str) -> RalphResult<Option<IterationRecord>> {
        let mut records: Vec<IterationRecord> = self
            .records
            .load_all()?
            .into_iter()
            .filter(|r| r.task_id == task_id && r.outcome == Outcome::Failed)
            .collect();
        records.sort_by_key(|r| r.end_time);
        Ok(records.pop())
    }

    fn read_memory_files(&self) -> Vec<MemoryFile> {
        MEMORY_FILE_NAMES
            .iter()
            .filter_map(|name| {
                let path = self.config.working_dir.join(name);
                std::fs::read_to_string(&path).ok().map(|content| MemoryFile {
                    path: (*name).to_string(),
                    content,
                })
            })
            .collect()
    }

    fn workspace_state(&self) -> WorkspaceState {
        WorkspaceState {
            diff_stat: self.vcs.diff_stat().unwrap_or_default(),
            changed_files: self.vcs.changed_files().unwrap_or_default(),
        }
    }

    /// Derive a stable branch name for `task`: the configured override if
    /// set, else `<prefix><slugified-title>-<task-id>`.
    pub fn branch_name(&self, task: &Task) -> String {
        if let Some(name) = &self.config.branch_override {
            return name.clone();
        }
        format!("{}{}-{}", self.config.branch_prefix, slugify(&task.title), task.id)
    }

    /// Builds the persisted `AgentInvocation`: model/session id come from
    /// the most recent agent response, but cost and token counts are the
    /// running totals accumulated across every agent call this iteration
    /// made so far — the initial call plus every in-iteration verification
    /// retry (design §3/§8's cost-aggregation invariant).
    fn invocation_from(
        &self,
        response: Option<&AgentResponse>,
        agg_cost_usd: f64,
        agg_input_tokens: u64,
        agg_output_tokens: u64,
    ) -> AgentInvocation {
        AgentInvocation {
            command: self.config.agent_command.clone(),
            model: response.and_then(|r| r.model.clone()),
            session_id: response.and_then(|r| r.session_id.clone()),
            total_cost_usd: agg_cost_usd,
            input_tokens: agg_input_tokens,
            output_tokens: agg_output_tokens,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_iteration(
        &mut self,
        iteration_id: &str,
        task: &Task,
        start_time: DateTime<Utc>,
        attempt: u32,
        base_commit: &str,
        response: Option<&AgentResponse>,
        agg_cost_usd: f64,
        agg_input_tokens: u64,
        agg_output_tokens: u64,
        outputs: Vec<VerificationOutput>,
        outcome: Outcome,
        feedback: Option<String>,
    ) -> RalphResult<IterationRecord> {
        let record = IterationRecord {
            iteration_id: iteration_id.to_string(),
            task_id: task.id.clone(),
            start_time,
            end_time: Utc::now(),
            attempt,
            claude_invocation: self.invocation_from(response, agg_cost_usd, agg_input_tokens, agg_output_tokens),
            base_commit: base_commit.to_string(),
            result_commit: String::new(),
            verification_outputs: outputs,
            files_changed: self.vcs.changed_files().unwrap_or_default(),
            outcome,
            feedback,
        };
        self.records.save(&record)?;
        self.gutter.record_iteration(&record);
        Ok(record)
    }

    /// Verification is itself a suspension point the per-iteration deadline
    /// must bound (design §4.11.2/§5), same as the agent call.
    async fn verify_bounded(
        &self,
        argv: &[crate::task::Argv],
        remaining: Option<Duration>,
        cancel: &CancellationToken,
    ) -> RalphResult<Vec<VerificationOutput>> {
        bounded(async { Ok(self.verifier.verify(argv, cancel).await) }, remaining, cancel).await
    }

    /// One task attempt: builds the entry prompt (or a retry prompt, up to
    /// `verification_retry_budget + 1` total agent calls), calls the
    /// agent, checks whether it changed anything, verifies, and commits on
    /// success. Always produces exactly one `IterationRecord`, win or lose
    /// (design §8's iteration-atomicity invariant).
    ///
    /// Two distinct attempt numbers are in play (design §3/§4.11.3): the
    /// *entry attempt* (`entry_attempt`, stored on the record) counts this
    /// task's attempts across the outer loop — 1 the first time the task is
    /// ever picked, N+1 after N prior failed `IterationRecord`s — and drives
    /// whether PROMPT_BUILD uses the initial prompt or an inter-iteration
    /// retry prompt sourced from the most recent failed record. The
    /// in-iteration `verify_attempt` loop counter, by contrast, tracks
    /// verification retries within this single call and never escapes it;
    /// every retry past the first always uses the retry prompt and
    /// continues the same agent session.
    pub async fn run_once(&mut self, task: &Task, cancel: &CancellationToken) -> RalphResult<IterationRecord> {
        let start_time = Utc::now();
        let iteration_id = new_iteration_id();

        self.task_store.update_status(&task.id, TaskStatus::InProgress)?;

        let branch = self.branch_name(task);
        self.vcs.ensure_branch(&branch)?;

        let base_commit = self.vcs.current_commit().unwrap_or_default();

        let codebase_patterns = self.progress.codebase_patterns().unwrap_or_default();
        let memory_files = self.read_memory_files();
        let operator_feedback = self.read_feedback(&task.id);

        let entry_attempt = self.failed_attempt_count(&task.id)? + 1;
        let prior_failure = if entry_attempt > 1 {
            self.most_recent_failed_record(&task.id)?
        } else {
            None
        };

        // An absolute deadline rather than a fixed per-call duration: every
        // suspension point below (agent call, verifier, commit) draws its
        // budget from the time left before this, so the ceiling covers the
        // whole iteration — including in-iteration verification retries —
        // not just the first agent call (design §4.11.2).
        let deadline = if self.config.max_minutes_per_iteration == 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_secs((self.config.max_minutes_per_iteration.max(0) as u64) * 60))
        };

        let max_verify_attempts = self.config.verification_retry_budget + 1;
        let mut verify_attempt: u32 = 1;
        let mut last_response: Option<AgentResponse> = None;
        let mut last_outputs: Vec<VerificationOutput> = Vec::new();
        let mut continue_session = false;

        // Accumulated across every agent call this iteration makes — the
        // initial call plus every in-iteration verification retry — per
        // design §3/§8's cost-aggregation invariant.
        let mut agg_cost_usd: f64 = 0.0;
        let mut agg_input_tokens: u64 = 0;
        let mut agg_output_tokens: u64 = 0;

        loop {
            let built = if verify_attempt == 1 {
                if entry_attempt == 1 {
                    prompt::build_initial_prompt(
                        task,
                        &codebase_patterns,
                        &self.workspace_state(),
                        &memory_files,
                        &self.config.prompt_limits,
                    )
                } else {
                    let (failure_output, signature) = match &prior_failure {
                        Some(record) => {
                            let output = record
                                .verification_outputs
                                .iter()
                                .find(|o| !o.passed)
                                .map(|o| o.output.clone())
                                .or_else(|| record.feedback.clone())
                                .unwrap_or_default();
                            (output, compute_failure_signature(&record.verification_outputs))
                        }
                        None => (String::new(), String::new()),
                    };
                    prompt::build_retry_prompt(
                        task,
                        &failure_output,
                        &signature,
                        entry_attempt,
                        operator_feedback.as_deref(),
                        &self.config.prompt_limits,
                    )
                }
            } else {
                let failure_output = last_outputs
                    .iter()
                    .find(|o| !o.passed)
                    .map(|o| o.output.as_str())
                    .unwrap_or("");
                let signature = compute_failure_signature(&last_outputs);
                prompt::build_retry_prompt(
                    task,
                    failure_output,
                    &signature,
                    entry_attempt,
                    operator_feedback.as_deref(),
                    &self.config.prompt_limits,
                )
            };

            let request = AgentRequest {
                system_prompt: built.system_prompt,
                user_prompt: built.user_prompt,
                continue_session,
                allowed_tools: self.config.allowed_tools.clone(),
            };

            let remaining = match remaining_duration(deadline) {
                Ok(r) => r,
                Err(()) => {
                    return self.finish_iteration(
                        &iteration_id,
                        task,
                        start_time,
                        entry_attempt,
                        &base_commit,
                        last_response.as_ref(),
                        agg_cost_usd,
                        agg_input_tokens,
                        agg_output_tokens,
                        last_outputs,
                        Outcome::BudgetExceeded,
                        Some("Iteration timeout exceeded".to_string()),
                    );
                }
            };

            let agent_result = bounded(self.agent.run(&request), remaining, cancel).await;

            let response = match agent_result {
                Ok(r) => r,
                Err(RalphError::ContextDeadline) => {
                    return self.finish_iteration(
                        &iteration_id,
                        task,
                        start_time,
                        entry_attempt,
                        &base_commit,
                        last_response.as_ref(),
                        agg_cost_usd,
                        agg_input_tokens,
                        agg_output_tokens,
                        last_outputs,
                        Outcome::BudgetExceeded,
                        Some("Iteration timeout exceeded".to_string()),
                    );
                }
                Err(e) => {
                    warn!(task = %task.id, entry_attempt, verify_attempt, error = %e, "agent call failed");
                    return self.finish_iteration(
                        &iteration_id,
                        task,
                        start_time,
                        entry_attempt,
                        &base_commit,
                        last_response.as_ref(),
                        agg_cost_usd,
                        agg_input_tokens,
                        agg_output_tokens,
                        Vec::new(),
                        Outcome::Failed,
                        Some(e.to_string()),
                    );
                }
            };

            agg_cost_usd += response.total_cost_usd;
            agg_input_tokens += response.input_tokens;
            agg_output_tokens += response.output_tokens;
            continue_session = true;
            last_response = Some(response);

            if remaining_duration(deadline).is_err() {
                return self.finish_iteration(
                    &iteration_id,
                    task,
                    start_time,
                    entry_attempt,
                    &base_commit,
                    last_response.as_ref(),
                    agg_cost_usd,
                    agg_input_tokens,
                    agg_output_tokens,
                    last_outputs,
                    Outcome::BudgetExceeded,
                    Some("Iteration timeout exceeded".to_string()),
                );
            }

            let has_changes = self.vcs.has_changes().unwrap_or(false);
            if !has_changes {
                last_outputs = Vec::new();
                if verify_attempt >= max_verify_attempts {
                    return self.finish_iteration(
                        &iteration_id,
                        task,
                        start_time,
                        entry_attempt,
                        &base_commit,
                        last_response.as_ref(),
                        agg_cost_usd,
                        agg_input_tokens,
                        agg_output_tokens,
                        Vec::new(),
                        Outcome::Failed,
                        Some("agent made no changes to the working tree".to_string()),
                    );
                }
                verify_attempt += 1;
                continue;
            }

            let verify_remaining = match remaining_duration(deadline) {
                Ok(r) => r,
                Err(()) => {
                    return self.finish_iteration(
                        &iteration_id,
                        task,
                        start_time,
                        entry_attempt,
                        &base_commit,
                        last_response.as_ref(),
                        agg_cost_usd,
                        agg_input_tokens,
                        agg_output_tokens,
                        last_outputs,
                        Outcome::BudgetExceeded,
                        Some("Iteration timeout exceeded".to_string()),
                    );
                }
            };

            let outputs = match self.verify_bounded(&task.verify, verify_remaining, cancel).await {
                Ok(outputs) => outputs,
                Err(RalphError::ContextDeadline) => {
                    return self.finish_iteration(
                        &iteration_id,
                        task,
                        start_time,
                        entry_attempt,
                        &base_commit,
                        last_response.as_ref(),
                        agg_cost_usd,
                        agg_input_tokens,
                        agg_output_tokens,
                        last_outputs,
                        Outcome::BudgetExceeded,
                        Some("Iteration timeout exceeded".to_string()),
                    );
                }
                Err(e) => {
                    return self.finish_iteration(
                        &iteration_id,
                        task,
                        start_time,
                        entry_attempt,
                        &base_commit,
                        last_response.as_ref(),
                        agg_cost_usd,
                        agg_input_tokens,
                        agg_output_tokens,
                        last_outputs,
                        Outcome::Failed,
                        Some(e.to_string()),
                    );
                }
            };
            last_outputs = outputs.clone();

            if all_passed(&outputs) {
                if remaining_duration(deadline).is_err() {
                    return self.finish_iteration(
                        &iteration_id,
                        task,
                        start_time,
                        entry_attempt,
                        &base_commit,
                        last_response.as_ref(),
                        agg_cost_usd,
                        agg_input_tokens,
                        agg_output_tokens,
                        outputs,
                        Outcome::BudgetExceeded,
                        Some("Iteration timeout exceeded".to_string()),
                    );
                }

                // Captured before `commit`, which stages and commits
                // everything in the working tree; reading it afterward
                // would always see a clean tree (design §3's "list of file
                // paths touched").
                let files_changed = self.vcs.changed_files().unwrap_or_default();

                let message = format_commit_message(task, &iteration_id);
                let result_commit = self.vcs.commit(&message)?;

                let record = IterationRecord {
                    iteration_id: iteration_id.clone(),
                    task_id: task.id.clone(),
                    start_time,
                    end_time: Utc::now(),
                    attempt: entry_attempt,
                    claude_invocation: self.invocation_from(
                        last_response.as_ref(),
                        agg_cost_usd,
                        agg_input_tokens,
                        agg_output_tokens,
                    ),
                    base_commit: base_commit.clone(),
                    result_commit,
                    verification_outputs: outputs,
                    files_changed: files_changed.clone(),
                    outcome: Outcome::Success,
                    feedback: None,
                };
                self.records.save(&record)?;
                self.task_store.update_status(&task.id, TaskStatus::Completed)?;

                let final_text = last_response.as_ref().map(|r| r.final_text.as_str()).unwrap_or("");
                let summary = if final_text.trim().is_empty() {
                    "no summary provided by the agent".to_string()
                } else {
                    one_line_summary(final_text, PROGRESS_SUMMARY_MAX_CHARS)
                };
                let files_note = if files_changed.is_empty() {
                    "none".to_string()
                } else {
                    files_changed.join(", ")
                };
                self.progress.append_iteration(&format!(
                    "{}: {} — {summary} (files: {files_note}) [Success]",
                    task.id, task.title
                ))?;

                self.remove_feedback_if_present(&task.id);
                self.gutter.record_iteration(&record);
                info!(task = %task.id, iteration = %iteration_id, "task completed");
                return Ok(record);
            }

            if verify_attempt >= max_verify_attempts {
                let failure_output = outputs.iter().find(|o| !o.passed).map(|o| o.output.clone());
                return self.finish_iteration(
                    &iteration_id,
                    task,
                    start_time,
                    entry_attempt,
                    &base_commit,
                    last_response.as_ref(),
                    agg_cost_usd,
                    agg_input_tokens,
                    agg_output_tokens,
                    outputs,
                    Outcome::Failed,
                    failure_output,
                );
            }

            verify_attempt += 1;
        }
    }

    /// Whichever one task is currently `in_progress` (there should be at
    /// most one at a time) is marked `blocked`, best-effort, when the
    /// gutter detector fires. Design §4.9 leaves the exact remediation to
    /// the controller; this harness's remediation is to stop driving that
    /// task automatically and surface it to an operator.
    fn mark_one_in_progress_blocked(&self) -> RalphResult<()> {
        let tasks = self.task_store.list()?;
        if let Some(task) = tasks.iter().find(|t| t.status == TaskStatus::InProgress) {
            self.task_store.update_status(&task.id, TaskStatus::Blocked)?;
        }
        Ok(())
    }

    fn classify_no_candidate(&self, tasks: &[Task], parent_id: &str) -> LoopOutcome {
        let scope = descendants_of(tasks, parent_id);
        let in_scope: Vec<&Task> = tasks.iter().filter(|t| scope.contains(&t.id)).collect();
        let all_terminal = in_scope
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped | TaskStatus::Failed));
        if all_terminal {
            LoopOutcome::AllTasksCompleted
        } else {
            LoopOutcome::NoReadyTask
        }
    }

    /// The outer loop (design §2/§5): repeatedly select a ready task under
    /// `parent_id` (empty string scopes to the whole tree) and drive one
    /// iteration, until the budget is exhausted, the gutter detector
    /// fires, an operator pauses the run, or no candidate remains.
    pub async fn run_loop(&mut self, parent_id: &str, cancel: CancellationToken) -> RalphResult<LoopOutcome> {
        let mut last_completed: Option<Task> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(RalphError::ContextCancelled);
            }

            if self.is_paused() {
                return Ok(LoopOutcome::Paused);
            }

            let stop_reason = self.budget.check_budget();
            if stop_reason != StopReason::None {
                self.persist_state()?;
                return Ok(LoopOutcome::BudgetExceeded(stop_reason));
            }

            let tasks = self.task_store.list()?;
            let graph = DependencyGraph::build(&tasks)?;
            let selected = Selector::select_next(&tasks, &graph, parent_id, last_completed.as_ref()).cloned();

            let Some(task) = selected else {
                return Ok(self.classify_no_candidate(&tasks, parent_id));
            };

            let record = self.run_once(&task, &cancel).await?;
            let cost = record.claude_invocation.total_cost_usd;
            self.budget.record_iteration(cost);
            self.persist_state()?;

            match record.outcome {
                Outcome::Success => {
                    last_completed = Some(self.task_store.get(&task.id)?);
                }
                Outcome::Failed => {
                    let failed_attempts = self.failed_attempt_count(&task.id)?;
                    if self.config.retry_budget != 0 && failed_attempts >= self.config.retry_budget {
                        self.task_store.update_status(&task.id, TaskStatus::Failed)?;
                    } else {
                        self.task_store.update_status(&task.id, TaskStatus::Open)?;
                    }
                }
                Outcome::BudgetExceeded | Outcome::Blocked => {}
            }

            let stall = self.gutter.check();
            if stall != StallStatus::None {
                self.persist_state()?;
                self.mark_one_in_progress_blocked()?;
                return Ok(LoopOutcome::GutterDetected(stall));
            }
        }
    }
}

/// Race `fut` against an optional timeout and the cancellation token,
/// surfacing whichever fires first as a typed error rather than leaving
/// the caller to poll a boolean each loop tick.
async fn bounded<T, F>(fut: F, timeout: Option<Duration>, cancel: &CancellationToken) -> RalphResult<T>
where
    F: std::future::Future<Output = RalphResult<T>>,
{
    match timeout {
        Some(duration) => {
            tokio::select! {
                res = tokio::time::timeout(duration, fut) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(RalphError::ContextDeadline),
                },
                _ = cancel.cancelled() => Err(RalphError::ContextCancelled),
            }
        }
        None => {
            tokio::select! {
                res = fut => res,
                _ = cancel.cancelled() => Err(RalphError::ContextCancelled),
            }
        }
    }
}

/// `Ok(Some(d))` is the time left before `deadline`; `Ok(None)` means there
/// is no deadline at all; `Err(())` means it has already passed. Checked at
/// every suspension point inside `run_once` so the per-iteration timeout
/// (design §4.11.2) bounds the agent call, the verifier, and the commit —
/// not just the first agent call.
fn remaining_duration(deadline: Option<Instant>) -> Result<Option<Duration>, ()> {
    match deadline {
        None => Ok(None),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                Err(())
            } else {
                Ok(Some(d - now))
            }
        }
    }
}

/// Collapse `text` to a single line and clip it to `max_chars`: the "what
/// changed" summary design §4.11.2 appends to progress memory on success.
fn one_line_summary(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let truncated: String = collapsed.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}

/// Lower-case, ascii-alphanumeric-only, dash-separated slug used to build
/// branch names from task titles.
fn slugify(s: &str) -> String {
    let mut out = String::new();
    let mut last_was_dash = false;
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Leading-keyword conventional-commit type inference from a task title.
/// Not configurable or pluggable (design §1 keeps the formatter itself out
/// of the controller's public collaborator surface); this is just the
/// minimal internal step COMMIT needs, and design §8 requires testing its
/// round trip. Only three types are produced; everything not matched by
/// the `feat`/`fix` keyword lists falls back to `chore`.
fn infer_commit_type(title: &str) -> &'static str {
    let first_word = title.split_whitespace().next().unwrap_or("").to_lowercase();
    match first_word.as_str() {
        "add" | "implement" | "create" | "new" => "feat",
        "fix" | "repair" | "resolve" | "correct" => "fix",
        _ => "chore",
    }
}

fn format_commit_message(task: &Task, iteration_id: &str) -> String {
    let commit_type = infer_commit_type(&task.title);
    format!("{commit_type}: {}\n\nRalph iteration: {iteration_id}", task.title)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedCommit {
    commit_type: String,
    title: String,
    iteration_id: String,
}

fn parse_commit_message(message: &str) -> Option<ParsedCommit> {
    let first_line = message.lines().next()?;
    let (commit_type, title) = first_line.split_once(": ")?;
    if !matches!(commit_type, "feat" | "fix" | "chore") {
        return None;
    }
    let marker = "Ralph iteration: ";
    let iteration_id = message.lines().find_map(|l| l.strip_prefix(marker))?.to_string();
    Some(ParsedCommit {
        commit_type: commit_type.to_string(),
        title: title.to_string(),
        iteration_id,
    })
}
