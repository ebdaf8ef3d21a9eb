//! In-process [`TaskApi`] backed by plain collections.
//!
//! Applies the same status rules as the real task service and records call
//! counts, so tests can observe how often the core refetches. Individual
//! calls can be failed or held open to exercise the best-effort and
//! stale-result paths.

use super::TaskApi;
use crate::error::{SyncError, SyncResult};
use crate::types::{
    Dependency, GraphAnalysis, Project, ProjectId, ProjectMember, Role, Task, TaskId, TaskStatus,
    User,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct MemoryState {
    projects: Vec<Project>,
    tasks: HashMap<TaskId, Task>,
    dependencies: Vec<Dependency>,
    members: Vec<ProjectMember>,
    analysis: HashMap<ProjectId, GraphAnalysis>,
    user: Option<User>,
    failing_dependencies: HashSet<TaskId>,
    held_projects: HashMap<ProjectId, Arc<Notify>>,
}

/// Task service double.
#[derive(Debug, Default)]
pub struct InMemoryTaskApi {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
    list_projects_calls: AtomicUsize,
    list_tasks_calls: AtomicUsize,
    dependency_calls: AtomicUsize,
}

impl InMemoryTaskApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::transport("service unreachable"));
        }
        Ok(())
    }

    // Fixture setup

    pub fn add_project(&self, id: ProjectId, name: &str) {
        self.lock().projects.push(Project {
            id,
            name: name.to_string(),
            description: None,
        });
    }

    /// Insert or replace a task.
    pub fn put_task(&self, task: Task) {
        self.lock().tasks.insert(task.id, task);
    }

    /// Add an edge. Self-dependencies are refused like the real service does.
    pub fn add_dependency(&self, task_id: TaskId, depends_on: TaskId) -> SyncResult<Dependency> {
        if task_id == depends_on {
            return Err(SyncError::HttpStatus {
                endpoint: "/tasks/dependencies".to_string(),
                status: 400,
            });
        }
        let mut state = self.lock();
        let id = state.dependencies.len() as i64 + 1;
        let mut dep = Dependency::new(task_id, depends_on);
        dep.id = Some(id);
        state.dependencies.push(dep.clone());
        Ok(dep)
    }

    pub fn dependency_count(&self) -> usize {
        self.lock().dependencies.len()
    }

    pub fn remove_dependency(&self, task_id: TaskId, depends_on: TaskId) {
        self.lock()
            .dependencies
            .retain(|d| !(d.task_id == task_id && d.depends_on_task_id == depends_on));
    }

    /// Change a status without any rule checks, as another user's edit would.
    pub fn set_status(&self, task_id: TaskId, status: TaskStatus) {
        if let Some(task) = self.lock().tasks.get_mut(&task_id) {
            task.status = status;
        }
    }

    pub fn status_of(&self, task_id: TaskId) -> Option<TaskStatus> {
        self.lock().tasks.get(&task_id).map(|t| t.status)
    }

    pub fn set_user(&self, id: i64, role: Role) {
        self.lock().user = Some(User {
            id,
            email: None,
            full_name: None,
            role,
        });
    }

    pub fn add_member(&self, project_id: ProjectId, user: User) {
        let mut state = self.lock();
        let id = state.members.len() as i64 + 1;
        state.members.push(ProjectMember {
            id,
            project_id,
            user,
        });
    }

    pub fn set_analysis(&self, analysis: GraphAnalysis) {
        self.lock().analysis.insert(analysis.project_id, analysis);
    }

    // Failure injection

    /// Make every call fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make dependency fetches for one task fail.
    pub fn fail_dependencies_of(&self, task_id: TaskId) {
        self.lock().failing_dependencies.insert(task_id);
    }

    /// Hold `list_tasks` for a project until the returned gate is notified.
    ///
    /// Held calls return the tasks as they were when the call was made.
    pub fn hold_tasks(&self, project_id: ProjectId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().held_projects.insert(project_id, gate.clone());
        gate
    }

    /// Stop holding `list_tasks` for a project. Calls already waiting stay held.
    pub fn release_hold(&self, project_id: ProjectId) {
        self.lock().held_projects.remove(&project_id);
    }

    // Call counters

    pub fn list_projects_calls(&self) -> usize {
        self.list_projects_calls.load(Ordering::SeqCst)
    }

    pub fn list_tasks_calls(&self) -> usize {
        self.list_tasks_calls.load(Ordering::SeqCst)
    }

    pub fn dependency_calls(&self) -> usize {
        self.dependency_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskApi for InMemoryTaskApi {
    async fn list_projects(&self) -> SyncResult<Vec<Project>> {
        self.list_projects_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        Ok(self.lock().projects.clone())
    }

    async fn list_tasks(&self, project_id: ProjectId) -> SyncResult<Vec<Task>> {
        self.list_tasks_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        // A held call answers with the state at call time, like a response
        // that is already on the wire
        let (mut tasks, gate) = {
            let state = self.lock();
            let tasks: Vec<Task> = state
                .tasks
                .values()
                .filter(|t| t.project_id == project_id)
                .cloned()
                .collect();
            (tasks, state.held_projects.get(&project_id).cloned())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn get_task_dependencies(&self, task_id: TaskId) -> SyncResult<Vec<Dependency>> {
        self.dependency_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let state = self.lock();
        if state.failing_dependencies.contains(&task_id) {
            return Err(SyncError::HttpStatus {
                endpoint: format!("/tasks/{task_id}/dependencies"),
                status: 500,
            });
        }
        Ok(state
            .dependencies
            .iter()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn update_task_status(&self, task_id: TaskId, status: TaskStatus) -> SyncResult<Task> {
        self.check_online()?;

        let mut state = self.lock();
        let endpoint = format!("/tasks/{task_id}");
        let Some(current) = state.tasks.get(&task_id).map(|t| t.status) else {
            return Err(SyncError::HttpStatus {
                endpoint,
                status: 404,
            });
        };

        let needs_predecessors = matches!(
            status,
            TaskStatus::InProgress | TaskStatus::Review | TaskStatus::Done
        );
        let blocked = needs_predecessors
            && state
                .dependencies
                .iter()
                .filter(|d| d.task_id == task_id)
                .any(|d| {
                    state
                        .tasks
                        .get(&d.depends_on_task_id)
                        .is_some_and(|t| t.status != TaskStatus::Done)
                });
        let bad_completion = status == TaskStatus::Done && current != TaskStatus::InProgress;

        if blocked || bad_completion {
            return Err(SyncError::HttpStatus {
                endpoint,
                status: 400,
            });
        }

        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(SyncError::TaskNotFound(task_id))?;
        task.status = status;
        Ok(task.clone())
    }

    async fn create_dependency(
        &self,
        task_id: TaskId,
        depends_on: TaskId,
    ) -> SyncResult<Dependency> {
        self.check_online()?;
        let known = {
            let state = self.lock();
            state.tasks.contains_key(&task_id) && state.tasks.contains_key(&depends_on)
        };
        if !known {
            return Err(SyncError::HttpStatus {
                endpoint: "/tasks/dependencies".to_string(),
                status: 404,
            });
        }
        self.add_dependency(task_id, depends_on)
    }

    async fn list_project_members(&self, project_id: ProjectId) -> SyncResult<Vec<ProjectMember>> {
        self.check_online()?;
        Ok(self
            .lock()
            .members
            .iter()
            .filter(|m| m.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_graph_analysis(&self, project_id: ProjectId) -> SyncResult<GraphAnalysis> {
        self.check_online()?;
        self.lock()
            .analysis
            .get(&project_id)
            .cloned()
            .ok_or_else(|| SyncError::HttpStatus {
                endpoint: format!("/analysis/projects/{project_id}/graph"),
                status: 404,
            })
    }

    async fn current_user(&self) -> SyncResult<User> {
        self.check_online()?;
        self.lock().user.clone().ok_or_else(|| SyncError::HttpStatus {
            endpoint: "/auth/me".to_string(),
            status: 401,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> InMemoryTaskApi {
        let api = InMemoryTaskApi::new();
        api.add_project(1, "Apollo");
        api.put_task(Task::new(10, 1, "design", TaskStatus::InProgress));
        api.put_task(Task::new(11, 1, "build", TaskStatus::Backlog));
        api.add_dependency(11, 10).unwrap();
        api
    }

    #[tokio::test]
    async fn blocked_start_is_refused() {
        let api = api();
        let err = api
            .update_task_status(11, TaskStatus::InProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::HttpStatus { status: 400, .. }));
    }

    #[tokio::test]
    async fn completion_requires_in_progress() {
        let api = api();
        api.update_task_status(10, TaskStatus::Done).await.unwrap();
        assert!(
            api.update_task_status(11, TaskStatus::Done)
                .await
                .is_err()
        );
        api.update_task_status(11, TaskStatus::InProgress)
            .await
            .unwrap();
        api.update_task_status(11, TaskStatus::Done).await.unwrap();
        assert_eq!(api.status_of(11), Some(TaskStatus::Done));
    }

    #[tokio::test]
    async fn self_dependency_is_refused() {
        let api = api();
        assert!(api.add_dependency(10, 10).is_err());
    }

    #[tokio::test]
    async fn offline_fails_everything() {
        let api = api();
        api.set_offline(true);
        assert!(api.list_tasks(1).await.unwrap_err().is_transient());
        assert_eq!(api.list_tasks_calls(), 1);
    }

    #[tokio::test]
    async fn held_list_tasks_waits_for_gate() {
        let api = Arc::new(api());
        let gate = api.hold_tasks(1);

        let pending = tokio::spawn({
            let api = api.clone();
            async move { api.list_tasks(1).await }
        });
        while api.list_tasks_calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!pending.is_finished());

        api.set_status(10, TaskStatus::Done);
        gate.notify_one();
        let tasks = pending.await.unwrap().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::InProgress);
    }
}
