//! Domain events and the classifier that produces them from raw push payloads.
//!
//! The push channel carries either structured JSON objects with a `kind`
//! field, or (from older servers) a bare string tag such as `task_updated`.
//! Classification never fails: anything unrecognizable becomes
//! [`EventKind::Unknown`].

use crate::types::{ProjectId, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Kinds of domain events the core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
    DependencyChanged,
    MessagePosted,
    Unknown,
}

impl EventKind {
    /// Map a wire tag to a kind. Accepts both the legacy bare tags and the
    /// structured `kind` names.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "task_created" | "TaskCreated" => Some(EventKind::TaskCreated),
            "task_updated" | "TaskUpdated" => Some(EventKind::TaskUpdated),
            "deps_updated" | "dependency_changed" | "DependencyChanged" => {
                Some(EventKind::DependencyChanged)
            }
            "message" | "message_posted" | "MessagePosted" => Some(EventKind::MessagePosted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task_created",
            EventKind::TaskUpdated => "task_updated",
            EventKind::DependencyChanged => "dependency_changed",
            EventKind::MessagePosted => "message_posted",
            EventKind::Unknown => "unknown",
        }
    }

    /// Events that may change which transitions are legal, and therefore
    /// require refetching the project's graph.
    pub fn affects_graph(&self) -> bool {
        matches!(self, EventKind::TaskUpdated | EventKind::DependencyChanged)
    }
}

/// A classified push event. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<TaskStatus>,
    /// Display name of the user who caused the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
}

impl DomainEvent {
    /// Event carrying only a kind and a project.
    pub fn bare(kind: EventKind, project_id: ProjectId) -> Self {
        Self {
            kind,
            project_id,
            task_id: None,
            old_status: None,
            new_status: None,
            actor: None,
            project_name: None,
            task_name: None,
        }
    }

    /// Display label for the project: its name if known, else `#id`.
    pub fn project_label(&self) -> String {
        match self.project_name {
            Some(ref name) => name.clone(),
            None => format!("#{}", self.project_id),
        }
    }
}

/// Structured wire payload. Every field except `kind` is optional.
#[derive(Debug, Deserialize)]
struct StructuredPayload {
    #[serde(alias = "type")]
    kind: String,
    #[serde(default)]
    project_id: Option<ProjectId>,
    #[serde(default)]
    task_id: Option<TaskId>,
    #[serde(default)]
    old_status: Option<String>,
    #[serde(default)]
    new_status: Option<String>,
    #[serde(default, alias = "actor")]
    user_name: Option<String>,
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    task_name: Option<String>,
}

/// Classify one raw message received on the stream for `scope`.
pub fn classify(scope: ProjectId, raw: &str) -> DomainEvent {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        match serde_json::from_str::<StructuredPayload>(trimmed) {
            Ok(payload) => {
                if let Some(kind) = EventKind::from_tag(&payload.kind) {
                    return from_structured(scope, kind, payload);
                }
                debug!(scope, kind = %payload.kind, "Unrecognized event kind");
            }
            Err(e) => {
                debug!(scope, error = %e, "Malformed structured event payload");
            }
        }
        return DomainEvent::bare(EventKind::Unknown, scope);
    }

    // A JSON string literal is still a bare tag
    let tag = if trimmed.starts_with('"') {
        serde_json::from_str::<String>(trimmed).unwrap_or_else(|_| trimmed.to_string())
    } else {
        trimmed.to_string()
    };

    match EventKind::from_tag(&tag) {
        Some(kind) => DomainEvent::bare(kind, scope),
        None => {
            debug!(scope, tag = %tag, "Unrecognized event tag");
            DomainEvent::bare(EventKind::Unknown, scope)
        }
    }
}

fn from_structured(scope: ProjectId, kind: EventKind, payload: StructuredPayload) -> DomainEvent {
    let project_id = payload.project_id.unwrap_or(scope);
    if project_id != scope {
        debug!(scope, project_id, "Event names a project other than its stream scope");
    }

    DomainEvent {
        kind,
        project_id,
        task_id: payload.task_id,
        old_status: payload.old_status.as_deref().and_then(TaskStatus::from_str),
        new_status: payload.new_status.as_deref().and_then(TaskStatus::from_str),
        actor: payload.user_name,
        project_name: payload.project_name,
        task_name: payload.task_name,
    }
}
