//! Detects backlog tasks of the current user that just became startable.
//!
//! Each run refetches the project's tasks and every candidate's dependency
//! edges, so the decision uses fresh statuses rather than the event payload.
//! A task is announced at most once per session: the memory of announced
//! tasks only grows.

use crate::api::TaskApi;
use crate::error::SyncResult;
use crate::graph::all_predecessors_done;
use crate::types::{ProjectId, Task, TaskId, TaskStatus, UserId};
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Unblock detector with its per-session memory.
#[derive(Debug, Default)]
pub struct UnblockDetector {
    notified: Mutex<HashSet<TaskId>>,
}

impl UnblockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `task_id` as announced. Returns `true` only for the first claim.
    ///
    /// Check and insert happen under one lock, so concurrent runs cannot both
    /// claim the same task.
    pub fn claim(&self, task_id: TaskId) -> bool {
        self.notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id)
    }

    pub fn was_notified(&self, task_id: TaskId) -> bool {
        self.notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&task_id)
    }

    pub fn notified_count(&self) -> usize {
        self.notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run one detection pass for `project_id`.
    ///
    /// `is_current` is consulted after the fetches resolve; if it returns
    /// `false` the results are discarded without touching the memory.
    /// Returns the tasks newly claimed by this run.
    pub async fn run<F>(
        &self,
        api: &dyn TaskApi,
        project_id: ProjectId,
        user_id: UserId,
        is_current: F,
    ) -> SyncResult<Vec<Task>>
    where
        F: Fn() -> bool,
    {
        let tasks = api.list_tasks(project_id).await?;
        let status_by_id: HashMap<TaskId, TaskStatus> =
            tasks.iter().map(|t| (t.id, t.status)).collect();

        let candidates: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.assignee_id == Some(user_id) && t.status == TaskStatus::Backlog)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let fetches = candidates
            .iter()
            .map(|task| api.get_task_dependencies(task.id));
        let results = join_all(fetches).await;

        if !is_current() {
            debug!(project_id, "Discarding stale unblock detection");
            return Ok(Vec::new());
        }

        let mut unblocked = Vec::new();
        for (task, deps) in candidates.into_iter().zip(results) {
            let deps = match deps {
                Ok(deps) => deps,
                Err(e) => {
                    // A failed candidate is skipped; the others still count
                    debug!(task_id = task.id, error = %e, "Dependency fetch failed");
                    continue;
                }
            };

            let ready = all_predecessors_done(deps.iter().map(|d| d.depends_on_task_id), |id| {
                status_by_id.get(&id).copied()
            });
            if ready && self.claim(task.id) {
                unblocked.push(task.clone());
            }
        }

        Ok(unblocked)
    }
}
