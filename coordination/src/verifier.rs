//! Verifier (design §4.4): run a sequence of verification commands with a
//! timeout each, capture bounded combined output, honor an optional argv[0]
//! allow-list.
//!
//! Grounded in the teacher's `verifier::pipeline` (spawns gates via
//! `tokio::process::Command` under `tokio::time::timeout`, one `GateResult`
//! per gate) generalized from a fixed set of cargo subcommands to an
//! arbitrary operator-supplied argv list, since this harness's verify step
//! is user-defined shell commands rather than a fixed cargo pipeline.

use crate::task::Argv;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const TRUNCATION_MARKER: &str = "\n...[output truncated]...\n";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutput {
    pub command: Argv,
    pub passed: bool,
    pub output: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Working directory each command is spawned in.
    pub working_dir: std::path::PathBuf,
    /// Wall-clock timeout per command; `None` means unbounded.
    pub command_timeout: Option<Duration>,
    /// Combined stdout+stderr byte cap per command; `0` disables truncation.
    pub output_byte_limit: usize,
    /// If non-empty, only argv[0] values in this set may run; everything
    /// else is rejected with a synthetic failing result. Empty means no
    /// restriction (the allow-list is a cooperative rail, not a sandbox).
    pub allow_list: Vec<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            working_dir: std::path::PathBuf::from("."),
            command_timeout: Some(Duration::from_secs(300)),
            output_byte_limit: 64 * 1024,
            allow_list: Vec::new(),
        }
    }
}

pub struct Verifier {
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// Run every command in order, continuing after earlier failures so the
    /// operator sees the whole picture. A cancelled command produces a
    /// non-passed result rather than aborting the sequence; the caller
    /// decides whether the overall context cancellation should stop the
    /// run.
    pub async fn verify(&self, commands: &[Argv], cancel: &CancellationToken) -> Vec<VerificationOutput> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            results.push(self.run_one(command, cancel).await);
        }
        results
    }

    async fn run_one(&self, command: &Argv, cancel: &CancellationToken) -> VerificationOutput {
        let start = Instant::now();

        if let Some(prog) = command.first() {
            if !self.config.allow_list.is_empty() && !self.config.allow_list.iter().any(|a| a == prog) {
                return VerificationOutput {
                    command: command.clone(),
                    passed: false,
                    output: format!("command '{prog}' is not in the verification allow-list"),
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
        } else {
            return VerificationOutput {
                command: command.clone(),
                passed: false,
                output: "empty verification command".to_string(),
                duration_ms: 0,
            };
        }

        let mut cmd = tokio::process::Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(&self.config.working_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let spawned = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return VerificationOutput {
                    command: command.clone(),
                    passed: false,
                    output: format!("failed to spawn '{}': {e}", command.join(" ")),
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
        };

        let wait_fut = spawned.wait_with_output();
        let outcome = match self.config.command_timeout {
            Some(timeout) => {
                tokio::select! {
                    res = tokio::time::timeout(timeout, wait_fut) => res.map_err(|_| VerifyFailure::Timeout),
                    _ = cancel.cancelled() => Err(VerifyFailure::Cancelled),
                }
            }
            None => tokio::select! {
                res = wait_fut => Ok(Ok(res)),
                _ = cancel.cancelled() => Err(VerifyFailure::Cancelled),
            },
        };

        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(Ok(output))) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                VerificationOutput {
                    command: command.clone(),
                    passed: output.status.success(),
                    output: self.truncate(&combined),
                    duration_ms,
                }
            }
            Ok(Ok(Err(e))) => VerificationOutput {
                command: command.clone(),
                passed: false,
                output: format!("error waiting for '{}': {e}", command.join(" ")),
                duration_ms,
            },
            Ok(Err(VerifyFailure::Timeout)) => VerificationOutput {
                command: command.clone(),
                passed: false,
                output: format!("command '{}' timed out", command.join(" ")),
                duration_ms,
            },
            Err(VerifyFailure::Cancelled) => VerificationOutput {
                command: command.clone(),
                passed: false,
                output: "cancelled before the command finished".to_string(),
                duration_ms,
            },
            Ok(Err(VerifyFailure::Cancelled)) => unreachable!(),
        }
    }

    fn truncate(&self, combined: &str) -> String {
        if self.config.output_byte_limit == 0 || combined.len() <= self.config.output_byte_limit {
            return combined.to_string();
        }
        let keep = self.config.output_byte_limit.saturating_sub(TRUNCATION_MARKER.len());
        let start = combined.len() - keep.min(combined.len());
        let tail = char_boundary_slice(combined, start);
        format!("{TRUNCATION_MARKER}{tail}")
    }
}

enum VerifyFailure {
    Timeout,
    Cancelled,
}

fn char_boundary_slice(s: &str, mut start: usize) -> &str {
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

pub fn all_passed(outputs: &[VerificationOutput]) -> bool {
    outputs.iter().all(|o| o.passed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(dir: &Path) -> VerifierConfig {
        VerifierConfig {
            working_dir: dir.to_path_buf(),
            command_timeout: Some(Duration::from_secs(5)),
            output_byte_limit: 64 * 1024,
            allow_list: Vec::new(),
        }
    }

    #[tokio::test]
    async fn passing_command_is_recorded_as_passed() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(cfg(dir.path()));
        let cancel = CancellationToken::new();
        let results = verifier
            .verify(&[vec!["true".to_string()]], &cancel)
            .await;
        assert!(results[0].passed);
    }

    #[tokio::test]
    async fn failing_command_is_recorded_and_others_still_run() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(cfg(dir.path()));
        let cancel = CancellationToken::new();
        let commands = vec![vec!["false".to_string()], vec!["true".to_string()]];
        let results = verifier.verify(&commands, &cancel).await;
        assert!(!results[0].passed);
        assert!(results[1].passed, "later commands must still run after an earlier failure");
    }

    #[tokio::test]
    async fn allow_list_rejects_unlisted_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cfg(dir.path());
        c.allow_list = vec!["true".to_string()];
        let verifier = Verifier::new(c);
        let cancel = CancellationToken::new();
        let results = verifier.verify(&[vec!["false".to_string()]], &cancel).await;
        assert!(!results[0].passed);
        assert!(results[0].output.contains("allow-list"));
    }

    #[tokio::test]
    async fn output_is_truncated_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = cfg(dir.path());
        c.output_byte_limit = 16;
        let verifier = Verifier::new(c);
        let cancel = CancellationToken::new();
        let results = verifier
            .verify(&[vec!["printf".to_string(), "0123456789abcdefghijklmnop".to_string()]], &cancel)
            .await;
        assert!(results[0].output.starts_with(TRUNCATION_MARKER.trim_end()));
        assert!(results[0].output.ends_with("nop"));
    }

    #[test]
    fn all_passed_is_true_only_when_every_result_passed() {
        let pass = VerificationOutput {
            command: vec!["true".into()],
            passed: true,
            output: String::new(),
            duration_ms: 0,
        };
        let fail = VerificationOutput {
            command: vec!["false".into()],
            passed: false,
            output: String::new(),
            duration_ms: 0,
        };
        assert!(all_passed(&[pass.clone()]));
        assert!(!all_passed(&[pass, fail]));
    }
}
