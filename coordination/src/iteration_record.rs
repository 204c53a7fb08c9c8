//! Iteration record and its append-only store (design §3/§4.10/§6).
//!
//! Grounded in the teacher's state-store CRUD shape (`task_store.rs`,
//! itself adapted from the teacher's RocksDB `StateStore`) for the
//! Save/Load/LoadAll operations, and in `harness::progress`'s
//! append-one-file-per-event convention for the naming scheme.

use crate::fsutil::{read_json, write_json_atomic};
use crate::verifier::VerificationOutput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    BudgetExceeded,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub command: Vec<String>,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub total_cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration_id: String,
    pub task_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub attempt: u32,
    pub claude_invocation: AgentInvocation,
    pub base_commit: String,
    #[serde(default)]
    pub result_commit: String,
    pub verification_outputs: Vec<VerificationOutput>,
    pub files_changed: Vec<String>,
    pub outcome: Outcome,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// Generate an 8-character random iteration id (alphanumeric, lowercase).
pub fn new_iteration_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..8)
        .map(|_| {
            let idx = rand::random::<usize>() % CHARSET.len();
            CHARSET[idx] as char
        })
        .collect()
}

pub struct IterationRecordStore {
    dir: std::path::PathBuf,
}

impl IterationRecordStore {
    pub fn new(dir: impl Into<std::path::PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, iteration_id: &str) -> std::path::PathBuf {
        self.dir.join(format!("iteration-{iteration_id}.json"))
    }

    pub fn save(&self, record: &IterationRecord) -> crate::error::RalphResult<()> {
        write_json_atomic(&self.path_for(&record.iteration_id), record)
    }

    pub fn load(&self, path: &Path) -> crate::error::RalphResult<IterationRecord> {
        read_json(path)
    }

    /// Walk the directory, silently skipping files that don't match the
    /// `iteration-*.json` convention or fail to parse.
    pub fn load_all(&self) -> std::io::Result<Vec<IterationRecord>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("iteration-") || !name.ends_with(".json") {
                continue;
            }
            if let Ok(record) = read_json::<IterationRecord>(&path) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
