//! Live event subscription manager.
//!
//! Keeps exactly one open push stream per desired scope (project id). The
//! desired set is declarative: [`SubscriptionManager::reconcile`] closes what
//! is no longer wanted and opens what is missing, and running it twice with
//! the same set changes nothing.
//!
//! Each open stream gets a pump task that forwards raw payloads, tagged with
//! their scope, into one inbound channel owned by the session. Stream errors
//! are swallowed (logged at debug). A stream that ends is marked dead and is
//! re-opened by the next reconcile if its scope is still desired.

use crate::source::{ConnectionHandle, EventSource, SourceEvent};
use crate::types::{ProjectId, Role};
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A set of scopes, ordered for stable logs and reconcile order.
pub type ScopeSet = BTreeSet<ProjectId>;

/// A raw payload received on a scope's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub scope: ProjectId,
    pub raw: String,
}

/// Compute the desired scope set for a role.
///
/// Privileged roles watch every visible project; everyone else watches the
/// selected project, or nothing.
pub fn desired_scopes(
    role: Option<Role>,
    selected: Option<ProjectId>,
    visible: &[ProjectId],
) -> ScopeSet {
    match role {
        Some(role) if role.is_privileged() => visible.iter().copied().collect(),
        _ => selected.into_iter().collect(),
    }
}

/// What a reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: Vec<ProjectId>,
    pub closed: Vec<ProjectId>,
    /// Dead streams closed so they could be re-opened.
    pub revived: Vec<ProjectId>,
    /// Scopes whose stream could not be opened this time.
    pub failed: Vec<ProjectId>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty() && self.failed.is_empty()
    }
}

struct Subscription {
    handle: ConnectionHandle,
    pump: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

impl Subscription {
    fn close(self) {
        self.pump.abort();
        self.handle.close();
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct OpenState {
    subscriptions: HashMap<ProjectId, Subscription>,
    /// Scopes with an open request in flight.
    opening: HashSet<ProjectId>,
    /// Desired set of the latest reconcile. Cleared by teardown.
    desired: ScopeSet,
}

/// Owns the open subscriptions of one session.
///
/// The state lock is never held across an open, so a scope whose stream is
/// slow to open delays neither other scopes nor teardown.
pub struct SubscriptionManager {
    source: Arc<dyn EventSource>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    state: Mutex<OpenState>,
}

impl SubscriptionManager {
    /// Create a manager forwarding every received payload into `inbound`.
    pub fn new(source: Arc<dyn EventSource>, inbound: mpsc::UnboundedSender<InboundEvent>) -> Self {
        Self {
            source,
            inbound,
            state: Mutex::new(OpenState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OpenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the open streams in line with `desired`.
    ///
    /// Never fails: a scope that cannot be opened is reported in
    /// [`ReconcileReport::failed`] and retried on the next call, without
    /// affecting other scopes. Missing scopes are opened concurrently and
    /// attached as soon as each one is ready. A stream that finishes opening
    /// after its scope left the desired set is closed right away.
    pub async fn reconcile(&self, desired: &ScopeSet) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let to_open: Vec<ProjectId> = {
            let mut state = self.lock();
            state.desired = desired.clone();

            let unwanted: Vec<ProjectId> = state
                .subscriptions
                .keys()
                .filter(|scope| !desired.contains(*scope))
                .copied()
                .collect();
            for scope in unwanted {
                if let Some(sub) = state.subscriptions.remove(&scope) {
                    sub.close();
                    info!(scope, "Closed event stream");
                    report.closed.push(scope);
                }
            }

            let dead: Vec<ProjectId> = state
                .subscriptions
                .iter()
                .filter(|(_, sub)| !sub.is_alive())
                .map(|(scope, _)| *scope)
                .collect();
            for scope in dead {
                if let Some(sub) = state.subscriptions.remove(&scope) {
                    sub.close();
                    debug!(scope, "Replacing dead event stream");
                    report.revived.push(scope);
                }
            }

            let missing: Vec<ProjectId> = desired
                .iter()
                .filter(|scope| {
                    !state.subscriptions.contains_key(*scope) && !state.opening.contains(*scope)
                })
                .copied()
                .collect();
            state.opening.extend(missing.iter().copied());
            missing
        };

        let mut pending: FuturesUnordered<_> = to_open
            .into_iter()
            .map(|scope| async move { (scope, self.source.open(scope).await) })
            .collect();

        while let Some((scope, result)) = pending.next().await {
            let mut state = self.lock();
            state.opening.remove(&scope);
            match result {
                Ok(connection)
                    if state.desired.contains(&scope)
                        && !state.subscriptions.contains_key(&scope) =>
                {
                    let sub = self.attach(scope, connection.events, connection.handle);
                    state.subscriptions.insert(scope, sub);
                    report.opened.push(scope);
                }
                Ok(connection) => {
                    connection.handle.close();
                    debug!(scope, "Closed stream opened for a scope no longer desired");
                }
                Err(e) => {
                    warn!(scope, error = %e, "Failed to open event stream");
                    report.failed.push(scope);
                }
            }
        }

        report.opened.sort_unstable();
        report.closed.sort_unstable();
        report.revived.sort_unstable();
        report.failed.sort_unstable();
        report
    }

    fn attach(
        &self,
        scope: ProjectId,
        mut events: mpsc::UnboundedReceiver<SourceEvent>,
        handle: ConnectionHandle,
    ) -> Subscription {
        let alive = Arc::new(AtomicBool::new(true));
        let inbound = self.inbound.clone();

        let pump = tokio::spawn({
            let alive = alive.clone();
            async move {
                while let Some(event) = events.recv().await {
                    match event {
                        SourceEvent::Message(raw) => {
                            if inbound.send(InboundEvent { scope, raw }).is_err() {
                                break;
                            }
                        }
                        SourceEvent::Error(reason) => {
                            debug!(scope, reason = %reason, "Event stream error");
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                debug!(scope, "Event stream is dead");
            }
        });

        Subscription {
            handle,
            pump,
            alive,
        }
    }

    /// Close every subscription unconditionally.
    ///
    /// Opens still in flight are closed when they complete.
    pub fn teardown(&self) -> Vec<ProjectId> {
        let mut state = self.lock();
        state.desired.clear();
        state.opening.clear();

        let mut closed: Vec<ProjectId> = state.subscriptions.keys().copied().collect();
        closed.sort_unstable();
        for (_, sub) in state.subscriptions.drain() {
            sub.close();
        }
        if !closed.is_empty() {
            info!(scopes = ?closed, "Closed all event streams");
        }
        closed
    }

    /// Scopes with an open subscription (alive or not).
    pub fn open_scopes(&self) -> ScopeSet {
        self.lock().subscriptions.keys().copied().collect()
    }

    /// Scopes whose stream has ended and awaits re-opening.
    pub fn dead_scopes(&self) -> ScopeSet {
        self.lock()
            .subscriptions
            .iter()
            .filter(|(_, sub)| !sub.is_alive())
            .map(|(scope, _)| *scope)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncResult;
    use crate::source::{ChannelEventSource, Connection};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Opens for `gated` wait for `gate`; other scopes open immediately.
    struct GatedSource {
        inner: ChannelEventSource,
        gated: ProjectId,
        gate: Arc<Notify>,
        waiting: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventSource for GatedSource {
        async fn open(&self, scope: ProjectId) -> SyncResult<Connection> {
            if scope == self.gated {
                self.waiting.fetch_add(1, Ordering::SeqCst);
                self.gate.notified().await;
            }
            self.inner.open(scope).await
        }
    }

    struct Gated {
        mgr: Arc<SubscriptionManager>,
        source: ChannelEventSource,
        gate: Arc<Notify>,
        waiting: Arc<AtomicUsize>,
    }

    impl Gated {
        async fn wait_for_pending_open(&self) {
            while self.waiting.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    fn gated_manager(gated: ProjectId) -> Gated {
        let inner = ChannelEventSource::new();
        let gate = Arc::new(Notify::new());
        let waiting = Arc::new(AtomicUsize::new(0));
        let source = GatedSource {
            inner: inner.clone(),
            gated,
            gate: gate.clone(),
            waiting: waiting.clone(),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        Gated {
            mgr: Arc::new(SubscriptionManager::new(Arc::new(source), tx)),
            source: inner,
            gate,
            waiting,
        }
    }

    async fn wait_until_open(mgr: &SubscriptionManager, scope: ProjectId) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !mgr.open_scopes().contains(&scope) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("scope should open");
    }

    fn manager() -> (
        SubscriptionManager,
        ChannelEventSource,
        mpsc::UnboundedReceiver<InboundEvent>,
    ) {
        let source = ChannelEventSource::new();
        let (tx, rx) = mpsc::unbounded_channel();
        (SubscriptionManager::new(Arc::new(source.clone()), tx), source, rx)
    }

    fn scopes(ids: &[ProjectId]) -> ScopeSet {
        ids.iter().copied().collect()
    }

    #[test]
    fn policy_by_role() {
        let visible = [1, 2, 3];
        assert_eq!(desired_scopes(Some(Role::Admin), Some(2), &visible), scopes(&[1, 2, 3]));
        assert_eq!(desired_scopes(Some(Role::Manager), Some(2), &visible), scopes(&[2]));
        assert_eq!(desired_scopes(Some(Role::Executor), None, &visible), scopes(&[]));
        assert_eq!(desired_scopes(None, Some(5), &visible), scopes(&[5]));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (mgr, source, _rx) = manager();
        let desired = scopes(&[1, 2]);

        let first = mgr.reconcile(&desired).await;
        assert_eq!(first.opened, vec![1, 2]);

        let second = mgr.reconcile(&desired).await;
        assert!(second.is_noop());
        assert_eq!(source.open_count(1), 1);
        assert_eq!(source.open_count(2), 1);
        assert_eq!(source.close_count(1), 0);
    }

    #[tokio::test]
    async fn dropped_scope_is_closed() {
        let (mgr, source, _rx) = manager();
        mgr.reconcile(&scopes(&[1, 2])).await;

        let report = mgr.reconcile(&scopes(&[2])).await;
        assert_eq!(report.closed, vec![1]);
        assert_eq!(source.close_count(1), 1);
        assert_eq!(source.live_connections(1), 0);
        assert_eq!(mgr.open_scopes(), scopes(&[2]));
    }

    #[tokio::test]
    async fn payloads_are_tagged_with_scope() {
        let (mgr, source, mut rx) = manager();
        mgr.reconcile(&scopes(&[4])).await;

        source.publish(4, "message");
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            InboundEvent {
                scope: 4,
                raw: "message".into()
            }
        );
    }

    #[tokio::test]
    async fn failed_open_does_not_affect_other_scopes() {
        let (mgr, source, _rx) = manager();
        source.refuse_opens(2, true);

        let report = mgr.reconcile(&scopes(&[1, 2, 3])).await;
        assert_eq!(report.opened, vec![1, 3]);
        assert_eq!(report.failed, vec![2]);

        source.refuse_opens(2, false);
        let retry = mgr.reconcile(&scopes(&[1, 2, 3])).await;
        assert_eq!(retry.opened, vec![2]);
    }

    #[tokio::test]
    async fn dead_stream_is_reopened() {
        let (mgr, source, _rx) = manager();
        mgr.reconcile(&scopes(&[1])).await;

        source.break_streams(1, "reset by peer");
        while mgr.dead_scopes().is_empty() {
            tokio::task::yield_now().await;
        }

        let report = mgr.reconcile(&scopes(&[1])).await;
        assert_eq!(report.revived, vec![1]);
        assert_eq!(report.opened, vec![1]);
        assert_eq!(source.open_count(1), 2);
        assert_eq!(source.live_connections(1), 1);
    }

    #[tokio::test]
    async fn teardown_closes_everything() {
        let (mgr, source, _rx) = manager();
        mgr.reconcile(&scopes(&[1, 2])).await;

        assert_eq!(mgr.teardown(), vec![1, 2]);
        assert_eq!(source.live_connections(1), 0);
        assert_eq!(source.live_connections(2), 0);
        assert!(mgr.open_scopes().is_empty());
    }

    #[tokio::test]
    async fn stalled_open_does_not_hold_up_other_scopes() {
        let Gated { mgr, source, .. } = gated_manager(1);

        let reconcile = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.reconcile(&scopes(&[1, 2])).await }
        });

        wait_until_open(&mgr, 2).await;
        assert_eq!(source.live_connections(2), 1);
        assert!(!mgr.open_scopes().contains(&1));

        assert_eq!(mgr.teardown(), vec![2]);
        assert_eq!(source.live_connections(2), 0);
        reconcile.abort();
    }

    #[tokio::test]
    async fn open_finishing_after_teardown_is_closed() {
        let gated = gated_manager(3);
        let Gated { ref mgr, ref source, ref gate, .. } = gated;

        let reconcile = tokio::spawn({
            let mgr = mgr.clone();
            async move { mgr.reconcile(&scopes(&[3])).await }
        });
        gated.wait_for_pending_open().await;

        mgr.teardown();
        gate.notify_one();

        let report = reconcile.await.unwrap();
        assert!(report.opened.is_empty());
        assert_eq!(source.open_count(3), 1);
        assert_eq!(source.close_count(3), 1);
        assert_eq!(source.live_connections(3), 0);
        assert!(mgr.open_scopes().is_empty());
    }

    #[tokio::test]
    async fn concurrent_reconciles_open_once() {
        let gated = gated_manager(4);
        let Gated { ref mgr, ref source, ref gate, .. } = gated;
        let desired = scopes(&[4]);

        let first = tokio::spawn({
            let mgr = mgr.clone();
            let desired = desired.clone();
            async move { mgr.reconcile(&desired).await }
        });
        gated.wait_for_pending_open().await;

        // The in-flight open is not duplicated
        let second = mgr.reconcile(&desired).await;
        assert!(second.opened.is_empty());

        gate.notify_one();
        assert_eq!(first.await.unwrap().opened, vec![4]);
        assert_eq!(source.open_count(4), 1);
        assert_eq!(source.live_connections(4), 1);
    }
}
