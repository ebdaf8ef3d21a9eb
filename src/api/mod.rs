//! Task/project API and scheduling-analysis client.
//!
//! The core never owns task state; it reads and mutates it through
//! [`TaskApi`]. [`http::HttpTaskApi`] talks to the real service,
//! [`memory::InMemoryTaskApi`] is an in-process double for tests and demos.

pub mod http;
pub mod memory;

use crate::error::SyncResult;
use crate::types::{
    Dependency, GraphAnalysis, Project, ProjectId, ProjectMember, Task, TaskId, TaskStatus, User,
};
use async_trait::async_trait;

pub use http::HttpTaskApi;
pub use memory::InMemoryTaskApi;

/// Operations the synchronization core consumes from the external services.
///
/// Every method fails with a transport-class [`crate::error::SyncError`] on a
/// non-success response; callers inside the core treat that as best effort.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Projects visible to the authenticated user.
    async fn list_projects(&self) -> SyncResult<Vec<Project>>;

    /// All tasks of one project.
    async fn list_tasks(&self, project_id: ProjectId) -> SyncResult<Vec<Task>>;

    /// Edges where `task_id` is the waiting side.
    async fn get_task_dependencies(&self, task_id: TaskId) -> SyncResult<Vec<Dependency>>;

    /// Set a task's status. The server enforces its own rules as well.
    async fn update_task_status(&self, task_id: TaskId, status: TaskStatus) -> SyncResult<Task>;

    /// Add a "blocks" edge: `task_id` waits for `depends_on`.
    async fn create_dependency(&self, task_id: TaskId, depends_on: TaskId)
    -> SyncResult<Dependency>;

    async fn list_project_members(&self, project_id: ProjectId) -> SyncResult<Vec<ProjectMember>>;

    /// Critical-path analysis for one project (opaque read model).
    async fn get_graph_analysis(&self, project_id: ProjectId) -> SyncResult<GraphAnalysis>;

    /// The authenticated user.
    async fn current_user(&self) -> SyncResult<User>;
}
