//! Task store (design §4.1): a key-addressable persistence layer for
//! `Task`s, one JSON file per id under `<work_dir>/.ralph/tasks/`.
//!
//! Grounded in the CRUD-method shape of the teacher's RocksDB-backed
//! `StateStore` (put/get/list-by-prefix, a mutex-guarded handle, typed
//! errors) but backed by flat files with atomic write-to-temp+rename,
//! since the persisted layout in design §6 names the exact paths.

use crate::error::{RalphError, RalphResult};
use crate::fsutil::{read_json, write_json_atomic};
use crate::task::{Task, TaskStatus};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct TaskStore {
    dir: PathBuf,
    // Guards concurrent callers within this process (design §4.1); the
    // directory itself is not required to be safe across processes.
    lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> RalphResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn get(&self, id: &str) -> RalphResult<Task> {
        let _guard = self.lock.lock().unwrap();
        self.get_unlocked(id)
    }

    fn get_unlocked(&self, id: &str) -> RalphResult<Task> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(RalphError::TaskNotFound { id: id.to_string() });
        }
        read_json(&path)
    }

    pub fn list(&self) -> RalphResult<Vec<Task>> {
        let _guard = self.lock.lock().unwrap();
        self.list_unlocked()
    }

    fn list_unlocked(&self) -> RalphResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            tasks.push(read_json(&path)?);
        }
        Ok(tasks)
    }

    /// Tasks whose `parent_id` equals `parent_id`; an empty string matches
    /// roots (parent_id absent).
    pub fn list_by_parent(&self, parent_id: &str) -> RalphResult<Vec<Task>> {
        let all = self.list()?;
        Ok(all
            .into_iter()
            .filter(|t| match &t.parent_id {
                Some(p) => p == parent_id,
                None => parent_id.is_empty(),
            })
            .collect())
    }

    /// Validate, stamp `updated_at`, and persist atomically.
    pub fn save(&self, mut task: Task) -> RalphResult<Task> {
        task.validate_self()?;
        let _guard = self.lock.lock().unwrap();
        task.updated_at = Utc::now();
        write_json_atomic(&self.path_for(&task.id), &task)?;
        Ok(task)
    }

    pub fn update_status(&self, id: &str, status: TaskStatus) -> RalphResult<Task> {
        let _guard = self.lock.lock().unwrap();
        let mut task = self.get_unlocked(id)?;
        task.status = status;
        task.updated_at = Utc::now();
        write_json_atomic(&self.path_for(id), &task)?;
        Ok(task)
    }

    pub fn delete(&self, id: &str) -> RalphResult<()> {
        let _guard = self.lock.lock().unwrap();
        let path = self.path_for(id);
        if !path.exists() {
            return Err(RalphError::TaskNotFound { id: id.to_string() });
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::new(dir.path().join(".ralph/tasks")).unwrap();
        (dir, store)
    }

    #[test]
    fn save_then_get_round_trips() {
        let (_d, store) = store();
        let t = Task::new("t-1", "Title");
        store.save(t.clone()).unwrap();
        let loaded = store.get("t-1").unwrap();
        assert_eq!(loaded.id, "t-1");
        assert_eq!(loaded.title, "Title");
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_d, store) = store();
        let err = store.get("nope").unwrap_err();
        assert!(matches!(err, RalphError::TaskNotFound { .. }));
    }

    #[test]
    fn update_status_mutates_and_stamps() {
        let (_d, store) = store();
        let t = Task::new("t-1", "Title");
        let saved = store.save(t).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let updated = store.update_status("t-1", TaskStatus::InProgress).unwrap();
        assert_eq!(updated.status, TaskStatus::InProgress);
        assert!(updated.updated_at >= saved.updated_at);
    }

    #[test]
    fn list_by_parent_matches_roots_on_empty_string() {
        let (_d, store) = store();
        let root = Task::new("root", "Root");
        let mut child = Task::new("child", "Child");
        child.parent_id = Some("root".to_string());
        store.save(root).unwrap();
        store.save(child).unwrap();

        let roots = store.list_by_parent("").unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, "root");

        let children = store.list_by_parent("root").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "child");
    }

    #[test]
    fn delete_missing_is_not_found() {
        let (_d, store) = store();
        assert!(matches!(
            store.delete("nope").unwrap_err(),
            RalphError::TaskNotFound { .. }
        ));
    }

    #[test]
    fn save_rejects_invalid_task() {
        let (_d, store) = store();
        let mut t = Task::new("t-1", "Title");
        t.title = "".into();
        assert!(store.save(t).is_err());
    }
}
