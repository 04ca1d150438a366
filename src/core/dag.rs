//! In-memory dependency graph built from a snapshot of a team's tasks.
//!
//! The persisted tasks are the source of truth; this view is rebuilt on
//! demand (inside the tasks lock) to answer reachability and ordering
//! questions with petgraph.

use std::collections::HashMap;

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};

/// Directed graph with an edge `task -> dependency` for every declared
/// dependency. Dependencies on ids that no longer exist are ignored.
pub struct DependencyGraph {
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Build the graph from every task of a team.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut dag = Self::new();
        let tasks: Vec<&Task> = tasks.into_iter().collect();
        for task in &tasks {
            dag.add_node(task.id);
        }
        for task in &tasks {
            for dep in &task.dependencies {
                dag.add_edge(task.id, *dep);
            }
        }
        dag
    }

    fn add_node(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&index) = self.index.get(&id) {
            return index;
        }
        let index = self.graph.add_node(id);
        self.index.insert(id, index);
        index
    }

    fn add_edge(&mut self, from: TaskId, to: TaskId) {
        if let (Some(&a), Some(&b)) = (self.index.get(&from), self.index.get(&to)) {
            if self.graph.find_edge(a, b).is_none() {
                self.graph.add_edge(a, b, ());
            }
        }
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check whether giving `id` the dependency list `proposed` would close
    /// a cycle.
    ///
    /// Walks from each proposed dependency along existing dependency edges;
    /// reaching `id` means the edge `id -> dep` would complete a loop. The
    /// offending dependency is returned. A self-dependency counts.
    pub fn find_cycle(&self, id: &TaskId, proposed: &[TaskId]) -> Option<TaskId> {
        if proposed.contains(id) {
            return Some(*id);
        }
        let target = *self.index.get(id)?;
        proposed.iter().copied().find(|dep| {
            self.index
                .get(dep)
                .map(|&start| has_path_connecting(&self.graph, start, target, None))
                .unwrap_or(false)
        })
    }

    /// Tasks that list `id` as a dependency, derived from the edges rather
    /// than from `blocks`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&index) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n).copied())
            .collect();
        out.sort();
        out
    }

    /// Task ids ordered so that each comes after all of its dependencies.
    ///
    /// # Errors
    /// Returns `CircularDependency` if the persisted graph has a cycle
    /// (only possible after manual edits of the task files).
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::CircularDependency {
                task: id.clone(),
                via: id,
            }
        })?;

        // Edges point at dependencies, so reverse to put them first.
        Ok(sorted
            .into_iter()
            .rev()
            .filter_map(|index| self.graph.node_weight(index).copied())
            .collect())
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
