//! Live, dependency-aware task-state synchronization.
//!
//! This module exports the core components for the binary and for tests.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod format;
pub mod graph;
pub mod logging;
pub mod notifications;
pub mod session;
pub mod source;
pub mod subscriptions;
pub mod types;
pub mod unblock;

pub use error::{ErrorCode, SyncError, SyncResult};
pub use session::{SessionContext, SessionOptions, SyncSession};
