//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! This module provides the TaskDAG structure that represents task dependencies
//! as a directed acyclic graph. Declared dependencies come from the plan; file
//! overlap inference adds more edges; the graph is then layered into waves of
//! tasks that may run concurrently.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Type of dependency between tasks.
///
/// An edge `from -> to` means `from` must be Done before `to` starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyType {
    /// Listed in the plan's `depends` metadata.
    Declared,
    /// Both tasks declare at least one common file.
    FileOverlap {
        /// Files both tasks touch.
        files: Vec<PathBuf>,
    },
}

impl Default for DependencyType {
    fn default() -> Self {
        Self::Declared
    }
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Declared => write!(f, "declared"),
            DependencyType::FileOverlap { files } => {
                write!(f, "files: {}", files.len())
            }
        }
    }
}

/// A group of tasks with no dependency between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    /// 1-based position in execution order.
    pub index: usize,
    /// Task ids in ascending order.
    pub tasks: Vec<TaskId>,
}

impl Wave {
    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.binary_search(id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// The task dependency graph.
///
/// Nodes are tasks in declaration order, so node index order is plan order.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Task, DependencyType>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Create a new empty TaskDAG.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build the graph from parsed tasks, adding one `Declared` edge per
    /// declared dependency.
    ///
    /// Explicit cycles are accepted here and reported by [`compute_waves`].
    ///
    /// [`compute_waves`]: TaskDAG::compute_waves
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            if dag.contains_task(&task.id) {
                return Err(Error::MalformedPlan(format!("duplicate task id {}", task.id)));
            }
            dag.add_task(task);
        }

        let edges: Vec<(TaskId, TaskId)> = dag
            .graph
            .node_weights()
            .flat_map(|task| task.dependencies.iter().map(move |dep| (*dep, task.id)))
            .collect();

        for (from, to) in edges {
            if !dag.contains_task(&from) {
                return Err(Error::MalformedPlan(format!(
                    "task {} depends on unknown task {}",
                    to, from
                )));
            }
            dag.add_dependency(&from, &to, DependencyType::Declared)?;
        }

        Ok(dag)
    }

    /// Add a task to the DAG.
    ///
    /// If the task already exists (same TaskId), returns the existing NodeIndex.
    pub fn add_task(&mut self, task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Add a dependency edge: `from` must complete before `to` can start.
    ///
    /// The dependency is also recorded on the dependent task. Cycles are not
    /// checked here.
    pub fn add_dependency(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        dep_type: DependencyType,
    ) -> Result<()> {
        let from_index = self.require_index(from)?;
        let to_index = self.require_index(to)?;

        if self.graph.find_edge(from_index, to_index).is_none() {
            self.graph.add_edge(from_index, to_index, dep_type);
        }
        self.graph[to_index].dependencies.insert(*from);
        Ok(())
    }

    fn require_index(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or(Error::TaskNotFound(*id))
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependencies (edges) in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if a direct edge `from -> to` exists.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.task_index.get(from), self.task_index.get(to))
        {
            self.graph.find_edge(from_idx, to_idx).is_some()
        } else {
            false
        }
    }

    /// Get the dependency type between two tasks, if one exists.
    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<&DependencyType> {
        let from_idx = self.task_index.get(from)?;
        let to_idx = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge)
    }

    /// Ids of the tasks `id` depends on, ascending.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut deps: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|n| self.graph[n].id)
            .collect();
        deps.sort();
        deps
    }

    /// All tasks in declaration order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// Check if the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the DAG contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Consume the DAG, returning tasks in declaration order with
    /// `dependencies` holding declared plus inferred edges.
    pub fn into_tasks(self) -> Vec<Task> {
        let (nodes, _) = self.graph.into_nodes_edges();
        nodes.into_iter().map(|node| node.weight).collect()
    }

    /// Find a cycle, if any, as ascending task ids.
    ///
    /// Multi-node strongly connected components and self loops both count.
    /// When several cycles exist, the one containing the smallest id is
    /// reported so the error is stable across runs.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut cycles: Vec<Vec<TaskId>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || self.graph.find_edge(component[0], component[0]).is_some()
            })
            .map(|component| {
                let mut ids: Vec<TaskId> =
                    component.iter().map(|&n| self.graph[n].id).collect();
                ids.sort();
                ids
            })
            .collect();
        cycles.sort();
        cycles.into_iter().next()
    }

    // ========== Planning Operations ==========

    /// Add `FileOverlap` edges between tasks that share touched files.
    ///
    /// For every pair with no direct edge in either direction whose file sets
    /// intersect, the later-declared task is made to depend on the
    /// earlier-declared one. Skipped when declared edges already form a
    /// cycle. Returns the number of edges added.
    ///
    /// # Errors
    /// `CyclicOverlap` when an inferred edge closes a cycle.
    pub fn infer_file_overlaps(&mut self) -> Result<usize> {
        if self.find_cycle().is_some() {
            tracing::debug!("declared dependencies are cyclic, skipping overlap inference");
            return Ok(0);
        }

        let order: Vec<NodeIndex> = self.graph.node_indices().collect();
        let mut added = 0;

        for (i, &earlier) in order.iter().enumerate() {
            for &later in &order[i + 1..] {
                if self.graph.find_edge(earlier, later).is_some()
                    || self.graph.find_edge(later, earlier).is_some()
                {
                    continue;
                }

                let shared: Vec<PathBuf> = self.graph[earlier]
                    .touched_files
                    .intersection(&self.graph[later].touched_files)
                    .cloned()
                    .collect();
                if shared.is_empty() {
                    continue;
                }

                let earlier_id = self.graph[earlier].id;
                let later_id = self.graph[later].id;
                let edge = self.graph.add_edge(
                    earlier,
                    later,
                    DependencyType::FileOverlap {
                        files: shared.clone(),
                    },
                );

                if is_cyclic_directed(&self.graph) {
                    let cycle = self
                        .find_cycle()
                        .unwrap_or_else(|| vec![earlier_id, later_id]);
                    self.graph.remove_edge(edge);
                    return Err(Error::CyclicOverlap { cycle });
                }

                self.graph[later].dependencies.insert(earlier_id);
                tracing::debug!(
                    earlier = %earlier_id,
                    later = %later_id,
                    files = shared.len(),
                    "inferred file overlap dependency"
                );
                added += 1;
            }
        }

        Ok(added)
    }

    /// Layer the graph into waves.
    ///
    /// layer(t) is 0 without dependencies, else 1 + the maximum layer of its
    /// dependencies. Waves are returned in layer order with ascending ids.
    ///
    /// # Errors
    /// `CyclicPlan` when the graph contains a cycle.
    pub fn compute_waves(&self) -> Result<Vec<Wave>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(Error::CyclicPlan { cycle });
        }

        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::CyclicPlan {
            cycle: vec![self.graph[cycle.node_id()].id],
        })?;

        let mut layer: HashMap<NodeIndex, usize> = HashMap::new();
        let mut grouped: BTreeMap<usize, Vec<TaskId>> = BTreeMap::new();

        for index in sorted {
            let depth = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|dep| layer.get(&dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            layer.insert(index, depth);
            grouped.entry(depth).or_default().push(self.graph[index].id);
        }

        Ok(grouped
            .into_values()
            .enumerate()
            .map(|(i, mut tasks)| {
                tasks.sort();
                Wave {
                    index: i + 1,
                    tasks,
                }
            })
            .collect())
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
