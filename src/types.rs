//! Core types shared by the synchronization core.
//!
//! These mirror the wire shapes of the external task/project API. Only the
//! fields the core reasons about are required; display fields are optional so
//! that payloads from older servers still decode.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Project identifier (also the subscription scope).
pub type ProjectId = i64;

/// Task identifier.
pub type TaskId = i64;

/// User identifier.
pub type UserId = i64;

/// Task status as reported by the task API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "backlog" => Some(TaskStatus::Backlog),
            "in_progress" => Some(TaskStatus::InProgress),
            "review" => Some(TaskStatus::Review),
            "done" => Some(TaskStatus::Done),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User role. Only `Admin` is privileged for scope selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Executor,
}

impl Role {
    /// Privileged roles subscribe to every visible project.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Executor => "executor",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "executor" => Some(Role::Executor),
            _ => None,
        }
    }
}

/// A task owned by a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    #[serde(default)]
    pub assignee_id: Option<UserId>,
    pub status: TaskStatus,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_plan: Option<i64>,
}

impl Task {
    /// Minimal task, used by in-process doubles and tests.
    pub fn new(id: TaskId, project_id: ProjectId, name: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id,
            project_id,
            assignee_id: None,
            status,
            name: name.into(),
            description: None,
            priority: None,
            duration_plan: None,
        }
    }

    pub fn with_assignee(mut self, assignee_id: UserId) -> Self {
        self.assignee_id = Some(assignee_id);
        self
    }
}

/// A directed dependency: `task_id` waits for `depends_on_task_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: TaskId,
    pub depends_on_task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Dependency type reported by the server ("blocks" is the only one today).
    #[serde(default = "default_dependency_type")]
    pub dependency_type: String,
}

fn default_dependency_type() -> String {
    "blocks".to_string()
}

impl Dependency {
    pub fn new(task_id: TaskId, depends_on_task_id: TaskId) -> Self {
        Self {
            task_id,
            depends_on_task_id,
            id: None,
            dependency_type: default_dependency_type(),
        }
    }
}

/// Project summary as listed by the project API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The authenticated user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: Role,
}

/// A project membership row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMember {
    pub id: i64,
    pub project_id: ProjectId,
    pub user: User,
}

/// One node of the scheduling analysis read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisNode {
    pub id: TaskId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub duration: i64,
    pub es: i64,
    pub ef: i64,
    pub ls: i64,
    pub lf: i64,
    pub slack: i64,
    pub is_critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

/// One edge of the scheduling analysis read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisEdge {
    pub source: TaskId,
    pub target: TaskId,
    #[serde(default = "default_dependency_type")]
    pub dependency_type: String,
    #[serde(default)]
    pub redundant: bool,
}

/// Critical-path analysis as produced by the scheduling service.
///
/// Opaque to the core: it is stored alongside the snapshot and rendered, never
/// recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphAnalysis {
    pub project_id: ProjectId,
    #[serde(default)]
    pub duration: i64,
    pub critical_path: Vec<TaskId>,
    pub nodes: Vec<AnalysisNode>,
    pub edges: Vec<AnalysisEdge>,
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
