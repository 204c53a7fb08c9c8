//! Version-control manager (design §4.5): a thin wrapper over a local git
//! subprocess. Grounded directly in the teacher's `harness::git_manager`
//! (same run-git/run-git-with-retry shape, same exponential backoff), but
//! generalized to the operations this harness needs: branch ensure/switch
//! with orphan-branch handling for an empty repo, rename-aware changed-file
//! parsing, and a no-changes guard on commit.

use crate::error::{RalphError, RalphResult};
use std::path::{Path, PathBuf};
use std::process::Command;

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

pub struct VcsManager {
    working_dir: PathBuf,
    max_retries: u32,
}

impl VcsManager {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn run(&self, args: &[&str]) -> RalphResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| RalphError::SubprocessSpawn {
                command: format!("git {}", args.join(" ")),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_git_error(args, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_with_retry(&self, args: &[&str]) -> RalphResult<String> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.run(args) {
                Ok(out) => return Ok(out),
                Err(e) => {
                    if is_retryable(&e) && attempt < self.max_retries {
                        let delay = RETRY_BASE_DELAY_MS * (1u64 << attempt);
                        std::thread::sleep(std::time::Duration::from_millis(delay));
                        last_error = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or(RalphError::CommitFailed {
            message: "max retries exceeded".to_string(),
        }))
    }

    /// No-op if already a git repository.
    pub fn init(&self) -> RalphResult<()> {
        if self.working_dir.join(".git").exists() {
            return Ok(());
        }
        self.run(&["init"])?;
        Ok(())
    }

    fn has_commits(&self) -> bool {
        self.run(&["rev-parse", "--verify", "HEAD"]).is_ok()
    }

    /// If the current branch already equals `prefix+name`, return. Else if
    /// the branch exists, switch to it; else create and switch. Copes with
    /// an empty repo (no commits yet) by checking out an orphan branch.
    pub fn ensure_branch(&self, full_name: &str) -> RalphResult<()> {
        if let Ok(current) = self.current_branch() {
            if current == full_name {
                return Ok(());
            }
        }

        let exists = self
            .run(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{full_name}")])
            .is_ok();

        if exists {
            self.run_with_retry(&["checkout", full_name])?;
            return Ok(());
        }

        if self.has_commits() {
            self.run_with_retry(&["checkout", "-b", full_name])?;
        } else {
            self.run_with_retry(&["checkout", "--orphan", full_name])?;
        }
        Ok(())
    }

    pub fn current_branch(&self) -> RalphResult<String> {
        self.run(&["symbolic-ref", "--short", "HEAD"])
    }

    pub fn current_commit(&self) -> RalphResult<String> {
        if !self.has_commits() {
            return Err(RalphError::NoCommits);
        }
        self.run(&["rev-parse", "HEAD"])
    }

    pub fn commit_message(&self, hash: &str) -> RalphResult<String> {
        self.run(&["log", "-1", "--format=%B", hash])
    }

    pub fn has_changes(&self) -> RalphResult<bool> {
        let status = self.run(&["status", "--porcelain"])?;
        Ok(!status.is_empty())
    }

    pub fn diff_stat(&self) -> RalphResult<String> {
        self.run(&["diff", "--stat", "HEAD"])
    }

    /// Changed files from porcelain status, renames reported as the new
    /// path (`"old -> new"` -> `new`).
    pub fn changed_files(&self) -> RalphResult<Vec<String>> {
        let status = self.run(&["status", "--porcelain"])?;
        Ok(status
            .lines()
            .filter_map(|line| parse_porcelain_line(line))
            .collect())
    }

    /// Stage everything and commit. Errors with `NoChanges` if the working
    /// tree is clean. Returns the new HEAD hash.
    pub fn commit(&self, message: &str) -> RalphResult<String> {
        self.run_with_retry(&["add", "-A"])?;

        if !self.has_changes()? {
            return Err(RalphError::NoChanges);
        }

        self.run_with_retry(&["commit", "-m", message])
            .map_err(|e| match e {
                RalphError::CommitFailed { message } => RalphError::CommitFailed { message },
                other => other,
            })?;

        self.current_commit()
    }
}

fn is_retryable(err: &RalphError) -> bool {
    matches!(err, RalphError::SubprocessSpawn { .. } | RalphError::CommitFailed { .. })
}

fn classify_git_error(args: &[&str], stderr: &str) -> RalphError {
    let lower = stderr.to_lowercase();
    if lower.contains("not a git repository") {
        return RalphError::NotARepo {
            path: PathBuf::from("."),
        };
    }
    if args.first() == Some(&"commit") {
        return RalphError::CommitFailed {
            message: stderr.to_string(),
        };
    }
    if args.first() == Some(&"checkout") && lower.contains("already exists") {
        let name = args.last().copied().unwrap_or("").to_string();
        return RalphError::BranchExists { name };
    }
    RalphError::CommitFailed {
        message: format!("git {}: {}", args.join(" "), stderr),
    }
}

fn parse_porcelain_line(line: &str) -> Option<String> {
    if line.len() < 4 {
        return None;
    }
    let rest = &line[3..];
    if let Some(idx) = rest.find(" -> ") {
        Some(rest[idx + 4..].trim().trim_matches('"').to_string())
    } else {
        Some(rest.trim().trim_matches('"').to_string())
    }
}
