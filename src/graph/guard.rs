//! Transition guard: which status changes a task may undergo right now.
//!
//! The guard is a set of pure functions over a [`GraphSnapshot`]. Nothing is
//! cached by task id, since edges and predecessor statuses change between
//! snapshots.

use super::GraphSnapshot;
use crate::error::{SyncError, SyncResult};
use crate::types::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};

/// Transitions currently permitted for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedTransitions {
    /// Moving to `in_progress`.
    pub can_start: bool,
    /// Moving to `done`.
    pub can_complete: bool,
    /// Moving back to `backlog`. Always true.
    pub can_reset: bool,
}

/// True if every known predecessor is `done`.
///
/// `status_of` returns `None` for ids it does not know; such dangling
/// predecessors impose no constraint.
pub fn all_predecessors_done<F>(predecessors: impl IntoIterator<Item = TaskId>, status_of: F) -> bool
where
    F: Fn(TaskId) -> Option<TaskStatus>,
{
    predecessors
        .into_iter()
        .all(|id| status_of(id).is_none_or(|status| status == TaskStatus::Done))
}

/// True if the task has no predecessors or all of them are `done`.
pub fn predecessors_satisfied(snapshot: &GraphSnapshot, task_id: TaskId) -> bool {
    all_predecessors_done(snapshot.predecessors(task_id), |id| {
        snapshot.task(id).map(|t| t.status)
    })
}

/// Predecessors of `task_id` that are known and not yet `done`.
pub fn blockers(snapshot: &GraphSnapshot, task_id: TaskId) -> Vec<TaskId> {
    let mut ids: Vec<TaskId> = snapshot
        .predecessors(task_id)
        .filter(|id| {
            snapshot
                .task(*id)
                .is_some_and(|t| t.status != TaskStatus::Done)
        })
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Compute the allowed transitions for a task.
///
/// A task missing from the snapshot can never be completed, because its own
/// status is unknown.
pub fn allowed_transitions(snapshot: &GraphSnapshot, task_id: TaskId) -> AllowedTransitions {
    let satisfied = predecessors_satisfied(snapshot, task_id);
    let in_progress = snapshot
        .task(task_id)
        .is_some_and(|t| t.status == TaskStatus::InProgress);

    AllowedTransitions {
        can_start: satisfied,
        can_complete: satisfied && in_progress,
        can_reset: true,
    }
}

/// Validate a requested status change against the snapshot.
///
/// `review` is gated like `in_progress`: the task API refuses both while any
/// predecessor is unfinished.
pub fn check_transition(
    snapshot: &GraphSnapshot,
    task_id: TaskId,
    target: TaskStatus,
) -> SyncResult<()> {
    let allowed = allowed_transitions(snapshot, task_id);
    match target {
        TaskStatus::Backlog => Ok(()),
        TaskStatus::InProgress | TaskStatus::Review if allowed.can_start => Ok(()),
        TaskStatus::InProgress | TaskStatus::Review => Err(SyncError::not_allowed(
            task_id,
            target,
            blocked_reason(snapshot, task_id),
        )),
        TaskStatus::Done if allowed.can_complete => Ok(()),
        TaskStatus::Done if !allowed.can_start => Err(SyncError::not_allowed(
            task_id,
            target,
            blocked_reason(snapshot, task_id),
        )),
        TaskStatus::Done => Err(SyncError::not_allowed(
            task_id,
            target,
            "only an in_progress task can be completed",
        )),
    }
}

fn blocked_reason(snapshot: &GraphSnapshot, task_id: TaskId) -> String {
    let ids: Vec<String> = blockers(snapshot, task_id)
        .iter()
        .map(|id| format!("#{id}"))
        .collect();
    format!("blocked by {}", ids.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Dependency, Task};

    fn snapshot(tasks: &[(TaskId, TaskStatus)], edges: &[(TaskId, TaskId)]) -> GraphSnapshot {
        GraphSnapshot::new(
            1,
            tasks
                .iter()
                .map(|&(id, status)| Task::new(id, 1, format!("t{id}"), status)),
            edges.iter().map(|&(t, d)| Dependency::new(t, d)).collect(),
            None,
        )
    }

    #[test]
    fn no_predecessors_is_always_startable() {
        for status in [
            TaskStatus::Backlog,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Done,
        ] {
            let snap = snapshot(&[(1, status)], &[]);
            let allowed = allowed_transitions(&snap, 1);
            assert!(allowed.can_start);
            assert!(predecessors_satisfied(&snap, 1));
        }
    }

    #[test]
    fn unfinished_predecessor_blocks_start() {
        let snap = snapshot(
            &[(1, TaskStatus::Review), (2, TaskStatus::Backlog)],
            &[(2, 1)],
        );
        let allowed = allowed_transitions(&snap, 2);
        assert!(!allowed.can_start);
        assert!(!allowed.can_complete);
        assert!(allowed.can_reset);
        assert_eq!(blockers(&snap, 2), vec![1]);
    }

    #[test]
    fn completion_requires_in_progress() {
        let backlog = snapshot(&[(1, TaskStatus::Done), (2, TaskStatus::Backlog)], &[(2, 1)]);
        let allowed = allowed_transitions(&backlog, 2);
        assert!(allowed.can_start);
        assert!(!allowed.can_complete);

        let started = snapshot(
            &[(1, TaskStatus::Done), (2, TaskStatus::InProgress)],
            &[(2, 1)],
        );
        assert!(allowed_transitions(&started, 2).can_complete);
    }

    #[test]
    fn review_cannot_jump_to_done() {
        let snap = snapshot(&[(1, TaskStatus::Review)], &[]);
        assert!(!allowed_transitions(&snap, 1).can_complete);
        let err = check_transition(&snap, 1, TaskStatus::Done).unwrap_err();
        assert!(err.to_string().contains("in_progress"));
    }

    #[test]
    fn dangling_edge_is_no_constraint() {
        let snap = snapshot(&[(2, TaskStatus::InProgress)], &[(2, 404)]);
        let allowed = allowed_transitions(&snap, 2);
        assert!(allowed.can_start);
        assert!(allowed.can_complete);
    }

    #[test]
    fn all_predecessors_must_be_done() {
        let snap = snapshot(
            &[
                (1, TaskStatus::Done),
                (2, TaskStatus::InProgress),
                (3, TaskStatus::Backlog),
            ],
            &[(3, 1), (3, 2)],
        );
        assert!(!predecessors_satisfied(&snap, 3));
        assert_eq!(blockers(&snap, 3), vec![2]);
    }

    #[test]
    fn reset_is_always_permitted() {
        let snap = snapshot(
            &[(1, TaskStatus::Backlog), (2, TaskStatus::Done)],
            &[(2, 1)],
        );
        assert!(check_transition(&snap, 2, TaskStatus::Backlog).is_ok());
        assert!(check_transition(&snap, 2, TaskStatus::InProgress).is_err());
        assert!(check_transition(&snap, 2, TaskStatus::Review).is_err());
    }

    #[test]
    fn unknown_task_cannot_complete() {
        let snap = snapshot(&[], &[]);
        let allowed = allowed_transitions(&snap, 9);
        assert!(allowed.can_start);
        assert!(!allowed.can_complete);
    }
}
