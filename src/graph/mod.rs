// Dependency graph builder
//
// Pure recomputation: every build derives a fresh graph from the immutable
// task list plus the latest assignments. Nothing here is mutated in place,
// so the scheduler's decisions stay a pure function of (tasks, assignments).

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeSet, HashMap};

use crate::error::EngineError;
use crate::models::{AssignmentStatus, NodeStatus, Task, TaskAssignment};

/// A task with its derived status and adjacency, valid for one graph build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub task_id: String,
    pub status: NodeStatus,
    /// Task ids this node waits on, sorted.
    pub dependencies: Vec<String>,
    /// Task ids waiting on this node, sorted.
    pub dependents: Vec<String>,
    pub assignment_id: Option<String>,
}

/// Immutable snapshot of the task dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyGraph {
    nodes: HashMap<String, TaskNode>,
    /// (dependency, dependent) pairs, sorted.
    edges: Vec<(String, String)>,
    roots: Vec<String>,
    leaves: Vec<String>,
    /// Longest dependency chain by node count, in execution order.
    critical_path: Vec<String>,
    max_depth: usize,
}

/// Build a dependency graph from raw tasks and the latest assignments.
///
/// Fails fast with `MalformedGraph` on duplicate ids, dangling `blocked_by`
/// references, or cycles. Callers must not feed cyclic input; the error
/// is fatal to the build call only.
pub fn build(
    tasks: &[Task],
    assignments: &[TaskAssignment],
) -> Result<DependencyGraph, EngineError> {
    // Index tasks, rejecting duplicates
    let mut deps_by_id: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for task in tasks {
        let deps: BTreeSet<&str> = task.blocked_by.iter().map(|d| d.as_str()).collect();
        if deps_by_id.insert(task.id.as_str(), deps).is_some() {
            return Err(EngineError::MalformedGraph(format!(
                "duplicate task id '{}'",
                task.id
            )));
        }
    }

    // Validate edges and build adjacency
    let mut dependents_by_id: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for task in tasks {
        for dep in deps_by_id[task.id.as_str()].iter() {
            if !deps_by_id.contains_key(dep) {
                return Err(EngineError::MalformedGraph(format!(
                    "task '{}' is blocked by unknown task '{}'",
                    task.id, dep
                )));
            }
            dependents_by_id
                .entry(dep)
                .or_default()
                .insert(task.id.as_str());
        }
    }

    // Kahn's algorithm with a min-heap so the topological order (and every
    // downstream tie-break) is deterministic by lowest task id
    let mut indegree: HashMap<&str, usize> = deps_by_id
        .iter()
        .map(|(id, deps)| (*id, deps.len()))
        .collect();
    let mut heap: BinaryHeap<Reverse<&str>> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut topo_order: Vec<&str> = Vec::with_capacity(tasks.len());
    while let Some(Reverse(id)) = heap.pop() {
        topo_order.push(id);
        if let Some(dependents) = dependents_by_id.get(id) {
            for dependent in dependents {
                let degree = indegree
                    .get_mut(dependent)
                    .ok_or_else(|| EngineError::MalformedGraph(format!(
                        "missing indegree entry for task '{}'",
                        dependent
                    )))?;
                *degree -= 1;
                if *degree == 0 {
                    heap.push(Reverse(*dependent));
                }
            }
        }
    }

    if topo_order.len() != tasks.len() {
        let mut cyclic: Vec<&str> = deps_by_id
            .keys()
            .filter(|id| !topo_order.contains(*id))
            .copied()
            .collect();
        cyclic.sort_unstable();
        return Err(EngineError::MalformedGraph(format!(
            "cycle involving tasks: {}",
            cyclic.join(", ")
        )));
    }

    // Latest assignment per task wins
    let mut assignment_by_task: HashMap<&str, &TaskAssignment> = HashMap::new();
    for assignment in assignments {
        assignment_by_task.insert(assignment.task_id.as_str(), assignment);
    }
    let completed = |id: &str| -> bool {
        assignment_by_task
            .get(id)
            .map(|a| a.status == AssignmentStatus::Completed)
            .unwrap_or(false)
    };

    // Derive node statuses. A node is blocked iff any dependency is not
    // completed; a failed dependency keeps dependents blocked, it does not
    // mark them failed.
    let mut nodes: HashMap<String, TaskNode> = HashMap::with_capacity(tasks.len());
    for task in tasks {
        let deps = &deps_by_id[task.id.as_str()];
        let assignment = assignment_by_task.get(task.id.as_str());

        let status = if deps.iter().any(|dep| !completed(dep)) {
            NodeStatus::Blocked
        } else {
            match assignment.map(|a| a.status) {
                Some(AssignmentStatus::Sent) => NodeStatus::Sent,
                Some(AssignmentStatus::InProgress) => NodeStatus::InProgress,
                Some(AssignmentStatus::Completed) => NodeStatus::Completed,
                Some(AssignmentStatus::Failed) => NodeStatus::Failed,
                None => NodeStatus::Ready,
            }
        };

        nodes.insert(
            task.id.clone(),
            TaskNode {
                task_id: task.id.clone(),
                status,
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                dependents: dependents_by_id
                    .get(task.id.as_str())
                    .map(|set| set.iter().map(|d| d.to_string()).collect())
                    .unwrap_or_default(),
                assignment_id: assignment.map(|a| a.id.clone()),
            },
        );
    }

    // Critical path: longest chain by node count, DP over the topological
    // order, ties broken by lowest task id at every choice point
    let mut chain_len: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
    let mut chain_prev: HashMap<&str, Option<&str>> = HashMap::with_capacity(tasks.len());
    for id in &topo_order {
        let mut best_len = 0usize;
        let mut best_prev: Option<&str> = None;
        for dep in deps_by_id[id].iter() {
            let len = chain_len[dep];
            let better = len > best_len
                || (len == best_len && best_prev.map(|p| *dep < p).unwrap_or(false));
            if better {
                best_len = len;
                best_prev = Some(dep);
            }
        }
        chain_len.insert(id, best_len + 1);
        chain_prev.insert(id, best_prev);
    }

    let mut end: Option<&str> = None;
    for id in &topo_order {
        let better = match end {
            None => true,
            Some(current) => {
                chain_len[id] > chain_len[current]
                    || (chain_len[id] == chain_len[current] && *id < current)
            }
        };
        if better {
            end = Some(id);
        }
    }

    let mut critical_path: Vec<String> = Vec::new();
    let mut cursor = end;
    while let Some(id) = cursor {
        critical_path.push(id.to_string());
        cursor = chain_prev[id];
    }
    critical_path.reverse();
    let max_depth = critical_path.len();

    // Topology summaries, sorted for deterministic equality
    let mut roots: Vec<String> = deps_by_id
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(id, _)| id.to_string())
        .collect();
    roots.sort_unstable();

    let mut leaves: Vec<String> = deps_by_id
        .keys()
        .filter(|id| !dependents_by_id.contains_key(*id))
        .map(|id| id.to_string())
        .collect();
    leaves.sort_unstable();

    let mut edges: Vec<(String, String)> = Vec::new();
    for (dep, dependents) in &dependents_by_id {
        for dependent in dependents {
            edges.push((dep.to_string(), dependent.to_string()));
        }
    }
    edges.sort_unstable();

    Ok(DependencyGraph {
        nodes,
        edges,
        roots,
        leaves,
        critical_path,
        max_depth,
    })
}

impl DependencyGraph {
    pub fn node(&self, task_id: &str) -> Option<&TaskNode> {
        self.nodes.get(task_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn leaves(&self) -> &[String] {
        &self.leaves
    }

    pub fn critical_path(&self) -> &[String] {
        &self.critical_path
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_on_critical_path(&self, task_id: &str) -> bool {
        self.critical_path.iter().any(|id| id == task_id)
    }

    /// Ready nodes sorted by task id. The scheduler applies the
    /// critical-path-first policy on top of this.
    pub fn ready_nodes(&self) -> Vec<&TaskNode> {
        let mut ready: Vec<&TaskNode> = self
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Ready)
            .collect();
        ready.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        ready
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// Every node completed. Vacuously true for an empty graph.
    pub fn is_complete(&self) -> bool {
        self.nodes.values().all(|n| n.status == NodeStatus::Completed)
    }

    pub fn has_failures(&self) -> bool {
        self.nodes.values().any(|n| n.status == NodeStatus::Failed)
    }

    /// True while any node can still be dispatched or is in flight. When
    /// this turns false with failures present, the plan can make no further
    /// progress.
    pub fn dispatchable_exists(&self) -> bool {
        self.nodes.values().any(|n| {
            matches!(
                n.status,
                NodeStatus::Ready | NodeStatus::Sent | NodeStatus::InProgress
            )
        })
    }
}
