//! In-process [`EventSource`]: a per-scope broadcast bus.
//!
//! Publishing to a scope delivers to every open connection for that scope.
//! Open and close counts are kept per scope so callers can verify that
//! reconciliation causes no churn.

use super::{Connection, ConnectionHandle, EventSource, SourceEvent};
use crate::error::{SyncError, SyncResult};
use crate::types::ProjectId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Bus {
    next_id: u64,
    senders: HashMap<ProjectId, Vec<(u64, mpsc::UnboundedSender<SourceEvent>)>>,
    opens: HashMap<ProjectId, usize>,
    closes: HashMap<ProjectId, usize>,
    refused: HashSet<ProjectId>,
}

fn lock(bus: &Mutex<Bus>) -> MutexGuard<'_, Bus> {
    bus.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event source double backed by channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelEventSource {
    bus: Arc<Mutex<Bus>>,
}

impl ChannelEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a raw payload to every open connection for `scope`.
    ///
    /// Returns the number of connections it reached.
    pub fn publish(&self, scope: ProjectId, raw: &str) -> usize {
        let bus = lock(&self.bus);
        bus.senders.get(&scope).map_or(0, |senders| {
            senders
                .iter()
                .filter(|(_, tx)| tx.send(SourceEvent::Message(raw.to_string())).is_ok())
                .count()
        })
    }

    /// Report an error on every connection for `scope` and end those streams.
    pub fn break_streams(&self, scope: ProjectId, reason: &str) {
        let mut bus = lock(&self.bus);
        if let Some(senders) = bus.senders.remove(&scope) {
            for (_, tx) in senders {
                let _ = tx.send(SourceEvent::Error(reason.to_string()));
            }
        }
    }

    /// Make future opens for `scope` fail (or succeed again).
    pub fn refuse_opens(&self, scope: ProjectId, refuse: bool) {
        let mut bus = lock(&self.bus);
        if refuse {
            bus.refused.insert(scope);
        } else {
            bus.refused.remove(&scope);
        }
    }

    pub fn open_count(&self, scope: ProjectId) -> usize {
        lock(&self.bus).opens.get(&scope).copied().unwrap_or(0)
    }

    pub fn close_count(&self, scope: ProjectId) -> usize {
        lock(&self.bus).closes.get(&scope).copied().unwrap_or(0)
    }

    /// Connections currently attached to `scope`.
    pub fn live_connections(&self, scope: ProjectId) -> usize {
        lock(&self.bus).senders.get(&scope).map_or(0, Vec::len)
    }

    /// Total opens across all scopes.
    pub fn total_opens(&self) -> usize {
        lock(&self.bus).opens.values().sum()
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn open(&self, scope: ProjectId) -> SyncResult<Connection> {
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut bus = lock(&self.bus);
            if bus.refused.contains(&scope) {
                return Err(SyncError::transport(format!(
                    "stream for project {scope} refused"
                )));
            }
            bus.next_id += 1;
            let id = bus.next_id;
            bus.senders.entry(scope).or_default().push((id, tx));
            *bus.opens.entry(scope).or_default() += 1;
            id
        };

        let bus = self.bus.clone();
        let handle = ConnectionHandle::new(move || {
            let mut bus = lock(&bus);
            if let Some(senders) = bus.senders.get_mut(&scope) {
                senders.retain(|(sid, _)| *sid != id);
                if senders.is_empty() {
                    bus.senders.remove(&scope);
                }
            }
            *bus.closes.entry(scope).or_default() += 1;
        });

        Ok(Connection {
            scope,
            events: rx,
            handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_only_its_scope() {
        let source = ChannelEventSource::new();
        let mut a = source.open(1).await.unwrap();
        let mut b = source.open(2).await.unwrap();

        assert_eq!(source.publish(1, "task_updated"), 1);
        assert_eq!(
            a.events.recv().await,
            Some(SourceEvent::Message("task_updated".into()))
        );
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn closing_detaches_and_counts() {
        let source = ChannelEventSource::new();
        let conn = source.open(4).await.unwrap();
        assert_eq!(source.live_connections(4), 1);

        conn.handle.close();
        assert_eq!(source.live_connections(4), 0);
        assert_eq!(source.close_count(4), 1);
        assert_eq!(source.publish(4, "message"), 0);
    }

    #[tokio::test]
    async fn broken_stream_ends_after_error() {
        let source = ChannelEventSource::new();
        let mut conn = source.open(3).await.unwrap();
        source.break_streams(3, "reset");

        assert!(matches!(conn.events.recv().await, Some(SourceEvent::Error(_))));
        assert_eq!(conn.events.recv().await, None);
    }

    #[tokio::test]
    async fn refused_open_fails() {
        let source = ChannelEventSource::new();
        source.refuse_opens(9, true);
        assert!(source.open(9).await.is_err());
        assert_eq!(source.open_count(9), 0);
    }
}
