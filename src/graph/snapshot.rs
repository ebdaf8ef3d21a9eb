//! Immutable per-project view of tasks, dependency edges and CPM analysis.

use crate::error::{SyncError, SyncResult};
use crate::types::{Dependency, GraphAnalysis, ProjectId, Task, TaskId, now_ms};
use std::collections::{HashMap, HashSet, VecDeque};

/// One project's tasks and dependency edges at a point in time.
///
/// Snapshots are never patched. A refresh builds a new value and the store
/// swaps it in wholesale, so a guard evaluation always sees one consistent
/// generation of the graph.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub project_id: ProjectId,
    pub tasks: HashMap<TaskId, Task>,
    pub edges: Vec<Dependency>,
    /// Latest scheduling analysis, if the service produced one.
    pub analysis: Option<GraphAnalysis>,
    pub fetched_at: i64,
}

impl GraphSnapshot {
    pub fn new(
        project_id: ProjectId,
        tasks: impl IntoIterator<Item = Task>,
        edges: Vec<Dependency>,
        analysis: Option<GraphAnalysis>,
    ) -> Self {
        Self {
            project_id,
            tasks: tasks.into_iter().map(|t| (t.id, t)).collect(),
            edges,
            analysis,
            fetched_at: now_ms(),
        }
    }

    /// Empty snapshot for a project that has not been fetched yet.
    pub fn empty(project_id: ProjectId) -> Self {
        Self::new(project_id, Vec::new(), Vec::new(), None)
    }

    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    /// Ids this task waits for, including dangling ones.
    pub fn predecessors(&self, task_id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.edges
            .iter()
            .filter(move |e| e.task_id == task_id)
            .map(|e| e.depends_on_task_id)
    }

    /// Edges whose endpoints are missing from `tasks`.
    pub fn dangling_edges(&self) -> Vec<&Dependency> {
        self.edges
            .iter()
            .filter(|e| {
                !self.tasks.contains_key(&e.task_id)
                    || !self.tasks.contains_key(&e.depends_on_task_id)
            })
            .collect()
    }

    /// Check if adding `task_id -> depends_on` would close a cycle.
    ///
    /// A cycle would occur if `depends_on` already waits, directly or
    /// transitively, for `task_id`.
    pub fn would_create_cycle(&self, task_id: TaskId, depends_on: TaskId) -> bool {
        if task_id == depends_on {
            return true;
        }

        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        queue.push_back(depends_on);

        while let Some(current) = queue.pop_front() {
            if current == task_id {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            for next in self.predecessors(current) {
                if !visited.contains(&next) {
                    queue.push_back(next);
                }
            }
        }

        false
    }

    /// Reject a new edge that is a self-loop or would close a cycle.
    pub fn check_new_dependency(&self, task_id: TaskId, depends_on: TaskId) -> SyncResult<()> {
        if self.would_create_cycle(task_id, depends_on) {
            return Err(SyncError::DependencyCycle {
                task_id,
                depends_on,
            });
        }
        Ok(())
    }

    /// Find one dependency cycle, if any.
    ///
    /// The returned path starts and ends on the same task id.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Active,
            Finished,
        }

        let mut adjacency: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for edge in &self.edges {
            adjacency
                .entry(edge.task_id)
                .or_default()
                .push(edge.depends_on_task_id);
        }

        let mut starts: Vec<TaskId> = adjacency.keys().copied().collect();
        starts.sort_unstable();

        let mut marks: HashMap<TaskId, Mark> = HashMap::new();
        for start in starts {
            if marks.contains_key(&start) {
                continue;
            }

            // Iterative DFS: (node, index of next child to visit)
            let mut stack: Vec<(TaskId, usize)> = vec![(start, 0)];
            let mut path: Vec<TaskId> = vec![start];
            marks.insert(start, Mark::Active);

            while let Some(top) = stack.last_mut() {
                let (node, next) = *top;
                top.1 += 1;
                let children = adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]);
                if let Some(&child) = children.get(next) {
                    match marks.get(&child) {
                        Some(Mark::Active) => {
                            let from = path.iter().position(|&id| id == child).unwrap_or(0);
                            let mut cycle = path[from..].to_vec();
                            cycle.push(child);
                            return Some(cycle);
                        }
                        Some(Mark::Finished) => {}
                        None => {
                            marks.insert(child, Mark::Active);
                            stack.push((child, 0));
                            path.push(child);
                        }
                    }
                } else {
                    marks.insert(node, Mark::Finished);
                    stack.pop();
                    path.pop();
                }
            }
        }

        None
    }
}
