//! Selector (design §4.3): pick the next task to run given a parent scope,
//! the last-completed task (for area preference), and deterministic
//! tie-breaks.

use crate::graph::DependencyGraph;
use crate::task::{Task, TaskStatus};
use std::collections::{BTreeSet, VecDeque};

pub struct Selector;

impl Selector {
    /// Returns at most one task: the best candidate under design §4.3's
    /// rules, or `None` if no candidate qualifies.
    pub fn select_next<'a>(
        tasks: &'a [Task],
        graph: &DependencyGraph,
        parent_id: &str,
        last_completed: Option<&Task>,
    ) -> Option<&'a Task> {
        let descendants = descendants_of(tasks, parent_id);
        let leaves = leaf_ids(tasks);

        let candidates: Vec<&Task> = tasks
            .iter()
            .filter(|t| descendants.contains(&t.id))
            .filter(|t| t.status == TaskStatus::Open)
            .filter(|t| is_ready(t, graph, tasks))
            .filter(|t| leaves.contains(&t.id))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let pool: Vec<&Task> = match last_completed.and_then(|lc| lc.area()) {
            Some(area) => {
                let same_area: Vec<&Task> = candidates
                    .iter()
                    .copied()
                    .filter(|t| t.area() == Some(area))
                    .collect();
                if same_area.is_empty() {
                    candidates
                } else {
                    same_area
                }
            }
            None => candidates,
        };

        pool.into_iter()
            .min_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
    }
}

/// Every id whose dependencies (depends_on set) all have status completed.
fn is_ready(task: &Task, graph: &DependencyGraph, tasks: &[Task]) -> bool {
    use std::collections::BTreeMap;
    let by_id: BTreeMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    graph
        .dependencies(&task.id)
        .iter()
        .all(|dep| by_id.get(dep.as_str()).map(|t| t.status == TaskStatus::Completed).unwrap_or(false))
}

/// A task is a leaf iff no other task's parent_id equals its id.
fn leaf_ids(tasks: &[Task]) -> BTreeSet<String> {
    let parents: BTreeSet<&str> = tasks
        .iter()
        .filter_map(|t| t.parent_id.as_deref())
        .collect();
    tasks
        .iter()
        .filter(|t| !parents.contains(t.id.as_str()))
        .map(|t| t.id.clone())
        .collect()
}

/// BFS from `parent_id` over the parent-id tree, returning all descendant
/// ids including `parent_id` itself. An empty `parent_id` means "every
/// task" (the whole tree is in scope).
pub fn descendants_of(tasks: &[Task], parent_id: &str) -> BTreeSet<String> {
    if parent_id.is_empty() {
        return tasks.iter().map(|t| t.id.clone()).collect();
    }

    use std::collections::BTreeMap;
    let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for t in tasks {
        if let Some(p) = &t.parent_id {
            children.entry(p.as_str()).or_default().push(t.id.as_str());
        }
    }

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    seen.insert(parent_id.to_string());
    queue.push_back(parent_id);

    while let Some(id) = queue.pop_front() {
        if let Some(kids) = children.get(id) {
            for kid in kids {
                if seen.insert(kid.to_string()) {
                    queue.push_back(kid);
                }
            }
        }
    }

    seen
}
