//! Live event channel abstraction.
//!
//! An [`EventSource`] opens one push stream per scope. The stream yields raw
//! text payloads and transport errors; when it ends the connection is dead and
//! the next reconcile re-opens it. Closing never fails.

pub mod memory;
pub mod sse;

use crate::error::SyncResult;
use crate::types::ProjectId;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

pub use memory::ChannelEventSource;
pub use sse::SseEventSource;

/// One item delivered by a push stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A raw event payload.
    Message(String),
    /// A transport-level error. The stream may or may not continue.
    Error(String),
}

/// Closes a connection when dropped or explicitly closed.
pub struct ConnectionHandle {
    on_close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ConnectionHandle {
    pub fn new(on_close: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Close the underlying stream. Idempotent, never fails.
    pub fn close(mut self) {
        self.run_close();
    }

    fn run_close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.run_close();
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("open", &self.on_close.is_some())
            .finish()
    }
}

/// An open push stream for one scope.
#[derive(Debug)]
pub struct Connection {
    pub scope: ProjectId,
    /// Ends (yields `None`) when the stream is dead.
    pub events: mpsc::UnboundedReceiver<SourceEvent>,
    pub handle: ConnectionHandle,
}

/// Transport-independent push channel.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a stream for `scope`. Fails only if the stream cannot be
    /// established at all.
    async fn open(&self, scope: ProjectId) -> SyncResult<Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn close_runs_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = ConnectionHandle::new({
            let closes = closes.clone();
            move || {
                closes.fetch_add(1, Ordering::SeqCst);
            }
        });
        handle.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_closes() {
        let closes = Arc::new(AtomicUsize::new(0));
        {
            let closes = closes.clone();
            let _handle = ConnectionHandle::new(move || {
                closes.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
