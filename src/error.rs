//! Structured error types for the synchronization core.

use crate::types::{TaskId, TaskStatus};
use serde::Serialize;
use thiserror::Error;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Transport errors
    Transport,
    HttpStatus,
    Decode,

    // Guard / graph errors
    TransitionNotAllowed,
    DependencyCycle,
    TaskNotFound,

    // Setup errors
    NotConfigured,
}

/// Errors raised by the synchronization core.
///
/// Transport and decode failures are recoverable by design: callers inside the
/// core log them and carry on, so they never tear down a session.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{endpoint} returned HTTP {status}")]
    HttpStatus { endpoint: String, status: u16 },

    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("task {task_id} cannot move to {target}: {reason}")]
    TransitionNotAllowed {
        task_id: TaskId,
        target: TaskStatus,
        reason: String,
    },

    #[error("adding dependency {task_id} -> {depends_on} would create a cycle")]
    DependencyCycle { task_id: TaskId, depends_on: TaskId },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Transport(_) => ErrorCode::Transport,
            SyncError::HttpStatus { .. } => ErrorCode::HttpStatus,
            SyncError::Decode { .. } => ErrorCode::Decode,
            SyncError::TransitionNotAllowed { .. } => ErrorCode::TransitionNotAllowed,
            SyncError::DependencyCycle { .. } => ErrorCode::DependencyCycle,
            SyncError::TaskNotFound(_) => ErrorCode::TaskNotFound,
            SyncError::NotConfigured(_) => ErrorCode::NotConfigured,
        }
    }

    /// True for failures that the next refresh or reconcile can recover from.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Transport | ErrorCode::HttpStatus | ErrorCode::Decode
        )
    }

    // Convenience constructors

    pub fn transport(err: impl std::fmt::Display) -> Self {
        SyncError::Transport(err.to_string())
    }

    pub fn decode(what: &str, err: impl std::fmt::Display) -> Self {
        SyncError::Decode {
            what: what.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn not_allowed(task_id: TaskId, target: TaskStatus, reason: impl Into<String>) -> Self {
        SyncError::TransitionNotAllowed {
            task_id,
            target,
            reason: reason.into(),
        }
    }
}

/// Result type for core operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
