//! Capped, newest-first notification log with read/unread state.
//!
//! Entries are never edited except for their `read` flag. Appending past the
//! capacity silently drops the oldest entries. Listeners subscribe to a
//! broadcast channel and receive each notification as it is appended.

use crate::events::{DomainEvent, EventKind};
use crate::types::{Task, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Default maximum number of retained notifications.
pub const DEFAULT_CAPACITY: usize = 200;

const BROADCAST_CAPACITY: usize = 256;

/// Notification category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    Task,
    Deps,
    Info,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Message => "message",
            NotificationKind::Task => "task",
            NotificationKind::Deps => "deps",
            NotificationKind::Info => "info",
        }
    }
}

/// One user-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Assigned on append when empty.
    pub id: String,
    /// Milliseconds since the epoch. Assigned on append when zero.
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub text: String,
    pub link: String,
    pub read: bool,
    /// Source event or unblocked task reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl Notification {
    /// A notification with no id or timestamp yet.
    pub fn new(kind: NotificationKind, text: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            ts: 0,
            kind,
            text: text.into(),
            link: link.into(),
            read: false,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Build the notification for a classified event. Unknown events become
    /// a generic `info` entry.
    pub fn from_event(event: &DomainEvent) -> Self {
        let project = event.project_label();
        let meta = serde_json::to_value(event).ok();

        let (kind, text, link) = match event.kind {
            EventKind::MessagePosted => (
                NotificationKind::Message,
                match event.actor {
                    Some(ref actor) => format!("New message from {actor} in project {project}"),
                    None => format!("New message in project {project}"),
                },
                "/chats",
            ),
            EventKind::TaskCreated => (
                NotificationKind::Task,
                match event.task_name {
                    Some(ref name) => format!("Task created in project {project}: {name}"),
                    None => format!("Task created in project {project}"),
                },
                "/projects",
            ),
            EventKind::TaskUpdated => (
                NotificationKind::Task,
                task_updated_text(event, &project),
                "/projects",
            ),
            EventKind::DependencyChanged => (
                NotificationKind::Deps,
                format!("Task dependencies updated in project {project}"),
                "/projects",
            ),
            EventKind::Unknown => (
                NotificationKind::Info,
                format!("Update in project {project}"),
                "/projects",
            ),
        };

        let notification = Notification::new(kind, text, link);
        match meta {
            Some(meta) => notification.with_meta(meta),
            None => notification,
        }
    }

    /// Build the notification announcing that a task became startable.
    pub fn unblocked(task: &Task) -> Self {
        Notification::new(
            NotificationKind::Deps,
            format!(
                "Task #{} \"{}\" can be started: all its dependencies are done",
                task.id, task.name
            ),
            "/tasks",
        )
        .with_meta(serde_json::json!({
            "task_id": task.id,
            "project_id": task.project_id,
        }))
    }
}

fn task_updated_text(event: &DomainEvent, project: &str) -> String {
    let subject = match (event.task_name.as_ref(), event.task_id) {
        (Some(name), _) => format!("Task \"{name}\""),
        (None, Some(id)) => format!("Task #{id}"),
        (None, None) => "A task".to_string(),
    };
    let change = match (event.old_status, event.new_status) {
        (Some(old), Some(new)) => format!(" moved from {old} to {new}"),
        (None, Some(new)) => format!(" moved to {new}"),
        _ => " was updated".to_string(),
    };
    let by = match event.actor {
        Some(ref actor) => format!(" by {actor}"),
        None => String::new(),
    };
    format!("{subject}{change}{by} in project {project}")
}

/// The notification log.
#[derive(Debug)]
pub struct NotificationStore {
    capacity: usize,
    entries: Mutex<VecDeque<Notification>>,
    sender: broadcast::Sender<Notification>,
}

impl NotificationStore {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a notification, newest first, and announce it to listeners.
    ///
    /// Returns the stored entry with its id and timestamp filled in.
    pub fn append(&self, mut notification: Notification) -> Notification {
        if notification.id.is_empty() {
            notification.id = uuid::Uuid::new_v4().to_string();
        }
        if notification.ts == 0 {
            notification.ts = now_ms();
        }
        notification.read = false;

        {
            let mut entries = self.lock();
            entries.push_front(notification.clone());
            entries.truncate(self.capacity);
        }

        // No listeners is fine
        let _ = self.sender.send(notification.clone());
        notification
    }

    /// Mark every current entry read.
    pub fn mark_all_read(&self) {
        for entry in self.lock().iter_mut() {
            entry.read = true;
        }
    }

    pub fn unread_count(&self) -> usize {
        self.lock().iter().filter(|n| !n.read).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the log, newest first.
    pub fn list(&self) -> Vec<Notification> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Receive each notification as it is appended.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
