//! The `Task` data model (design §3).

use crate::error::{RalphError, RalphResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Completed,
    Blocked,
    Failed,
    Skipped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// One argv entry of a verification command.
pub type Argv = Vec<String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "parentId", alias = "parent_id")]
    pub parent_id: Option<String>,
    #[serde(default, rename = "dependsOn", alias = "depends_on")]
    pub depends_on: BTreeSet<String>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub verify: Vec<Argv>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Open
}

impl Task {
    /// Construct a brand-new task, stamping both timestamps to `now`.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            parent_id: None,
            depends_on: BTreeSet::new(),
            status: TaskStatus::Open,
            acceptance: Vec::new(),
            verify: Vec::new(),
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate the invariants named in design §3 that this task alone can
    /// check (id/title non-empty, status already well-typed by construction).
    /// Cross-task invariants (depends_on/parent_id referring to existing
    /// tasks) are checked by the dependency graph builder and the task
    /// store, which have the full task set in view.
    pub fn validate_self(&self) -> RalphResult<()> {
        if self.id.trim().is_empty() {
            return Err(RalphError::validation("task id must not be empty"));
        }
        if self.title.trim().is_empty() {
            return Err(RalphError::validation(format!(
                "task {} has an empty title",
                self.id
            )));
        }
        Ok(())
    }

    pub fn area(&self) -> Option<&str> {
        self.labels.get("area").map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_open_with_equal_timestamps() {
        let t = Task::new("t-1", "Do the thing");
        assert_eq!(t.status, TaskStatus::Open);
        assert_eq!(t.created_at, t.updated_at);
    }

    #[test]
    fn validate_self_rejects_empty_id_or_title() {
        let mut t = Task::new("t-1", "x");
        t.id = "  ".into();
        assert!(t.validate_self().is_err());

        let mut t = Task::new("t-1", "x");
        t.title = "".into();
        assert!(t.validate_self().is_err());
    }

    #[test]
    fn status_display_matches_snake_case() {
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert_eq!(TaskStatus::Open.to_string(), "open");
    }

    #[test]
    fn deserializes_task_yaml_camel_case_fields() {
        let yaml = r#"
id: t-2
title: Second task
parentId: t-1
dependsOn: [t-0]
verify:
  - ["echo", "ok"]
labels:
  area: backend
created_at: 2024-01-01T00:00:00Z
updated_at: 2024-01-01T00:00:00Z
"#;
        let t: Task = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(t.parent_id.as_deref(), Some("t-1"));
        assert!(t.depends_on.contains("t-0"));
        assert_eq!(t.area(), Some("backend"));
        assert_eq!(t.verify, vec![vec!["echo".to_string(), "ok".to_string()]]);
    }
}
