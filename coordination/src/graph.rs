//! Dependency graph (design §4.2): nodes are task ids, edge A→B means
//! "A depends on B." Hand-rolled rather than built on a generic graph
//! crate because both traversals the design calls out (cycle detection,
//! topological sort) require a specific sorted-id tie-break for
//! determinism that a general-purpose graph library does not guarantee
//! out of the box; a `BTreeMap`/`BTreeSet`-backed adjacency list gives us
//! that ordering for free.

use crate::error::{RalphError, RalphResult};
use crate::task::Task;
use std::collections::{BTreeMap, BTreeSet};

pub struct DependencyGraph {
    /// id -> set of ids it depends on (out-edges)
    depends_on: BTreeMap<String, BTreeSet<String>>,
    /// id -> set of ids that depend on it (in-edges / reverse)
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Register all task ids as nodes, add an edge (and its reverse) for
    /// every `depends_on` entry. Fails if a dependency refers to an
    /// unknown id, naming both the offending task and the missing
    /// dependency.
    pub fn build(tasks: &[Task]) -> RalphResult<Self> {
        let mut depends_on: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for task in tasks {
            depends_on.entry(task.id.clone()).or_default();
            dependents.entry(task.id.clone()).or_default();
        }

        let known: BTreeSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

        for task in tasks {
            for dep in &task.depends_on {
                if !known.contains(dep.as_str()) {
                    return Err(RalphError::MissingDependency {
                        task: task.id.clone(),
                        missing: dep.clone(),
                    });
                }
                depends_on.entry(task.id.clone()).or_default().insert(dep.clone());
                dependents.entry(dep.clone()).or_default().insert(task.id.clone());
            }
        }

        Ok(Self {
            depends_on,
            dependents,
        })
    }

    pub fn dependencies(&self, id: &str) -> BTreeSet<String> {
        self.depends_on.get(id).cloned().unwrap_or_default()
    }

    pub fn dependents(&self, id: &str) -> BTreeSet<String> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.depends_on.keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.depends_on.contains_key(id)
    }

    /// Depth-first search with tri-color marking (white/gray/black),
    /// visiting nodes in sorted id order for determinism. Returns the
    /// first cycle found as a path of ids (first and last equal), or
    /// `None` if the graph is acyclic.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: BTreeMap<&str, Color> =
            self.depends_on.keys().map(|k| (k.as_str(), Color::White)).collect();
        let mut stack: Vec<String> = Vec::new();

        fn visit<'a>(
            node: &'a str,
            graph: &'a DependencyGraph,
            color: &mut BTreeMap<&'a str, Color>,
            stack: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            color.insert(node, Color::Gray);
            stack.push(node.to_string());

            let mut deps: Vec<&String> = graph.depends_on.get(node).into_iter().flatten().collect();
            deps.sort();

            for dep in deps {
                match color.get(dep.as_str()).copied().unwrap_or(Color::White) {
                    Color::White => {
                        if let Some(cycle) = visit(dep, graph, color, stack) {
                            return Some(cycle);
                        }
                    }
                    Color::Gray => {
                        // Found a back-edge into a node still on the stack.
                        // Reconstruct the cycle path from its first
                        // occurrence on the stack to here, plus the closing
                        // repeat.
                        let mut cycle: Vec<String> = match stack.iter().position(|n| n == dep) {
                            Some(start) => stack[start..].to_vec(),
                            None => vec![dep.clone()],
                        };
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Color::Black => {}
                }
            }

            stack.pop();
            color.insert(node, Color::Black);
            None
        }

        let ids: Vec<String> = self.depends_on.keys().cloned().collect();
        for id in &ids {
            if color.get(id.as_str()).copied().unwrap_or(Color::White) == Color::White {
                if let Some(cycle) = visit(id, self, &mut color, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Kahn's algorithm over in-degrees (where an "edge" for this purpose
    /// is dependency -> dependent, i.e. topological order has
    /// dependencies before dependents); ties broken by sorted id.
    pub fn topological_sort(&self) -> RalphResult<Vec<String>> {
        let mut in_degree: BTreeMap<String, usize> = self
            .depends_on
            .keys()
            .map(|id| (id.clone(), self.depends_on[id].len()))
            .collect();

        let mut ready: BTreeSet<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());

        while let Some(id) = ready.iter().next().cloned() {
            ready.remove(&id);
            order.push(id.clone());
            let mut dependents: Vec<&String> = self.dependents.get(&id).into_iter().flatten().collect();
            dependents.sort();
            for dependent in dependents {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent.clone());
                    }
                }
            }
        }

        if order.len() != in_degree.len() {
            let cycle = self.detect_cycle().unwrap_or_default();
            return Err(RalphError::GraphCycle { path: cycle });
        }

        Ok(order)
    }
}
