//! Synchronization session: the explicit lifecycle around the core.
//!
//! A [`SyncSession`] owns the subscription manager, the snapshot store, the
//! notification log and the unblock detector for one signed-in user. It is
//! started once, re-targeted whenever the role or selected project changes,
//! and torn down when the user leaves. Nothing it does is fatal: transport
//! failures are logged and the next event or reconcile tick retries.

use crate::api::TaskApi;
use crate::error::{SyncError, SyncResult};
use crate::events::{DomainEvent, classify};
use crate::graph::{
    AllowedTransitions, FetchTicket, GraphSnapshot, SnapshotStore, allowed_transitions,
    check_transition,
};
use crate::notifications::{DEFAULT_CAPACITY, Notification, NotificationStore};
use crate::source::EventSource;
use crate::subscriptions::{
    InboundEvent, ReconcileReport, ScopeSet, SubscriptionManager, desired_scopes,
};
use crate::types::{Dependency, ProjectId, ProjectMember, Role, Task, TaskId, TaskStatus, UserId};
use crate::unblock::UnblockDetector;
use arc_swap::ArcSwap;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Who is signed in and what they are looking at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: Option<UserId>,
    pub role: Option<Role>,
    pub selected_project: Option<ProjectId>,
    /// Projects visible to a privileged role, fetched once per role change.
    pub visible_projects: Vec<ProjectId>,
}

impl SessionContext {
    pub fn desired_scopes(&self) -> ScopeSet {
        desired_scopes(self.role, self.selected_project, &self.visible_projects)
    }
}

/// Tunables for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub notification_capacity: usize,
    /// Period of the health reconcile. `None` disables it.
    pub reconcile_interval: Option<Duration>,
    /// Also fetch the critical-path analysis on every refresh.
    pub fetch_analysis: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            notification_capacity: DEFAULT_CAPACITY,
            reconcile_interval: Some(Duration::from_secs(15)),
            fetch_analysis: true,
        }
    }
}

struct SessionInner {
    api: Arc<dyn TaskApi>,
    subscriptions: SubscriptionManager,
    snapshots: SnapshotStore,
    notifications: NotificationStore,
    detector: UnblockDetector,
    context: ArcSwap<SessionContext>,
    options: SessionOptions,
    /// Set by teardown. A torn-down session never subscribes again.
    closed: AtomicBool,
}

/// Live synchronization for one user.
pub struct SyncSession {
    inner: Arc<SessionInner>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncSession {
    pub fn new(
        api: Arc<dyn TaskApi>,
        source: Arc<dyn EventSource>,
        context: SessionContext,
        options: SessionOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = SessionInner {
            api,
            subscriptions: SubscriptionManager::new(source, tx),
            snapshots: SnapshotStore::new(),
            notifications: NotificationStore::new(options.notification_capacity),
            detector: UnblockDetector::new(),
            context: ArcSwap::from_pointee(context),
            options,
            closed: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
            inbound: Mutex::new(Some(rx)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Resolve identity, subscribe per policy and start the background
    /// dispatcher and health tick.
    ///
    /// Calling `start` on an already started session only reconciles. A
    /// session cannot be restarted after [`SyncSession::teardown`]; create a
    /// new one instead.
    pub async fn start(&self) -> ReconcileReport {
        if self.inner.is_closed() {
            warn!("Ignoring start on a session that was torn down");
            return ReconcileReport::default();
        }

        self.inner.bootstrap_identity().await;

        let role = self.inner.context.load().role;
        if role.is_some_and(|r| r.is_privileged()) {
            self.inner.load_visible_projects().await;
        }

        let receiver = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            self.spawn_workers(receiver);
        }

        self.inner.reconcile().await
    }

    fn spawn_workers(&self, mut receiver: mpsc::UnboundedReceiver<InboundEvent>) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let inner = self.inner.clone();
        workers.push(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let inner = inner.clone();
                tokio::spawn(async move {
                    inner.handle_inbound(event).await;
                });
            }
        }));

        if let Some(period) = self.inner.options.reconcile_interval {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let report = inner.reconcile().await;
                    if !report.revived.is_empty() {
                        info!(scopes = ?report.revived, "Re-opened dead event streams");
                    }
                }
            }));
        }
    }

    /// Stop background work and close every stream.
    ///
    /// The session stays usable for reads but no longer subscribes. The
    /// unblock memory is kept; it only resets with a new session.
    pub fn teardown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            worker.abort();
        }
        self.inner.subscriptions.teardown();
        self.inner.snapshots.clear();
        info!("Session torn down");
    }

    pub fn context(&self) -> Arc<SessionContext> {
        self.inner.context.load_full()
    }

    /// Switch role. Privileged roles refetch the visible projects once.
    pub async fn set_role(&self, role: Option<Role>) -> ReconcileReport {
        let mut next = (*self.inner.context.load_full()).clone();
        next.role = role;
        self.set_context(next).await
    }

    /// Change the selected project and re-target subscriptions.
    pub async fn set_selected_project(&self, project_id: Option<ProjectId>) -> ReconcileReport {
        let mut next = (*self.inner.context.load_full()).clone();
        next.selected_project = project_id;
        self.set_context(next).await
    }

    /// Replace the whole context (e.g. after a configuration reload).
    pub async fn set_context(&self, mut next: SessionContext) -> ReconcileReport {
        let previous = self.inner.context.load_full();
        let privileged = next.role.is_some_and(|r| r.is_privileged());

        if !privileged {
            next.visible_projects.clear();
        } else if previous.role == next.role {
            next.visible_projects = previous.visible_projects.clone();
        }
        self.inner.context.store(Arc::new(next));

        if privileged && previous.role != self.inner.context.load().role {
            self.inner.load_visible_projects().await;
        }
        self.inner.reconcile().await
    }

    /// Reconcile against the scopes implied by the current context.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.inner.reconcile().await
    }

    /// Reconcile against an explicit desired scope set.
    pub async fn reconcile_subscriptions(&self, desired: &ScopeSet) -> ReconcileReport {
        self.inner.reconcile_subscriptions(desired).await
    }

    pub fn open_scopes(&self) -> ScopeSet {
        self.inner.subscriptions.open_scopes()
    }

    /// Process one raw payload as if it arrived on `scope`'s stream.
    ///
    /// Returns the notifications it produced.
    pub async fn ingest(&self, scope: ProjectId, raw: &str) -> Vec<Notification> {
        self.inner
            .handle_inbound(InboundEvent {
                scope,
                raw: raw.to_string(),
            })
            .await
    }

    /// Fetch a fresh snapshot of a project.
    ///
    /// The result is stored only if the project is tracked, was not dropped
    /// or re-added while the fetch was in flight, and no later refresh has
    /// committed first. In that last case the newer stored snapshot is
    /// returned instead.
    pub async fn refresh_snapshot(&self, project_id: ProjectId) -> SyncResult<Arc<GraphSnapshot>> {
        let ticket = self.inner.snapshots.begin_fetch(project_id);
        let snapshot = self.inner.fetch_snapshot(project_id).await?;
        let Some(ticket) = ticket else {
            return Ok(Arc::new(snapshot));
        };
        self.inner.snapshots.commit(&ticket, snapshot.clone());
        match self.inner.snapshots.get(project_id) {
            Some(stored) if self.inner.snapshots.is_current(&ticket) => Ok(stored),
            _ => Ok(Arc::new(snapshot)),
        }
    }

    /// Latest stored snapshot, if any.
    pub fn snapshot(&self, project_id: ProjectId) -> Option<Arc<GraphSnapshot>> {
        self.inner.snapshots.get(project_id)
    }

    async fn snapshot_or_refresh(&self, project_id: ProjectId) -> SyncResult<Arc<GraphSnapshot>> {
        match self.inner.snapshots.get(project_id) {
            Some(snapshot) => Ok(snapshot),
            None => self.refresh_snapshot(project_id).await,
        }
    }

    /// Transitions currently permitted for a task.
    pub async fn allowed_transitions(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> SyncResult<AllowedTransitions> {
        let snapshot = self.snapshot_or_refresh(project_id).await?;
        if snapshot.task(task_id).is_none() {
            return Err(SyncError::TaskNotFound(task_id));
        }
        Ok(allowed_transitions(&snapshot, task_id))
    }

    /// Guarded status change: refused locally when the guard forbids it,
    /// otherwise sent to the task API, after which the snapshot is refreshed.
    pub async fn change_status(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        target: TaskStatus,
    ) -> SyncResult<Task> {
        let snapshot = self.snapshot_or_refresh(project_id).await?;
        if snapshot.task(task_id).is_none() {
            return Err(SyncError::TaskNotFound(task_id));
        }
        check_transition(&snapshot, task_id, target)?;

        let updated = self.inner.api.update_task_status(task_id, target).await?;
        info!(task_id, status = %target, "Task status changed");

        if let Err(e) = self.refresh_snapshot(project_id).await {
            debug!(project_id, error = %e, "Refresh after status change failed");
        }
        Ok(updated)
    }

    /// Make `task_id` wait for `depends_on`.
    ///
    /// Checked against a freshly fetched graph so that an edge closing a
    /// cycle is refused before it reaches the task API.
    pub async fn add_dependency(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        depends_on: TaskId,
    ) -> SyncResult<Dependency> {
        let snapshot = self.refresh_snapshot(project_id).await?;
        for id in [task_id, depends_on] {
            if snapshot.task(id).is_none() {
                return Err(SyncError::TaskNotFound(id));
            }
        }
        snapshot.check_new_dependency(task_id, depends_on)?;

        let created = self.inner.api.create_dependency(task_id, depends_on).await?;
        info!(task_id, depends_on, "Dependency added");

        if let Err(e) = self.refresh_snapshot(project_id).await {
            debug!(project_id, error = %e, "Refresh after adding dependency failed");
        }
        Ok(created)
    }

    pub async fn project_members(&self, project_id: ProjectId) -> SyncResult<Vec<ProjectMember>> {
        self.inner.api.list_project_members(project_id).await
    }

    pub fn notifications(&self) -> &NotificationStore {
        &self.inner.notifications
    }

    /// Receive notifications as they are appended.
    pub fn on_notification(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub fn unread_count(&self) -> usize {
        self.inner.notifications.unread_count()
    }

    pub fn mark_all_read(&self) {
        self.inner.notifications.mark_all_read();
    }

    pub fn detector(&self) -> &UnblockDetector {
        &self.inner.detector
    }
}

impl SessionInner {
    async fn bootstrap_identity(&self) {
        let context = self.context.load_full();
        if context.user_id.is_some() && context.role.is_some() {
            return;
        }

        match self.api.current_user().await {
            Ok(user) => {
                let mut next = (*context).clone();
                next.user_id = next.user_id.or(Some(user.id));
                next.role = next.role.or(Some(user.role));
                info!(user_id = user.id, role = user.role.as_str(), "Resolved current user");
                self.context.store(Arc::new(next));
            }
            Err(e) => warn!(error = %e, "Could not resolve current user"),
        }
    }

    async fn load_visible_projects(&self) {
        let visible = match self.api.list_projects().await {
            Ok(projects) => projects.into_iter().map(|p| p.id).collect(),
            Err(e) => {
                warn!(error = %e, "Could not list projects");
                Vec::new()
            }
        };

        let mut next = (*self.context.load_full()).clone();
        next.visible_projects = visible;
        self.context.store(Arc::new(next));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn reconcile(&self) -> ReconcileReport {
        let desired = self.context.load().desired_scopes();
        self.reconcile_subscriptions(&desired).await
    }

    async fn reconcile_subscriptions(&self, desired: &ScopeSet) -> ReconcileReport {
        if self.is_closed() {
            debug!("Session is torn down, not reconciling");
            return ReconcileReport::default();
        }
        for scope in self.snapshots.tracked() {
            if !desired.contains(&scope) {
                self.snapshots.untrack(scope);
            }
        }
        for &scope in desired {
            self.snapshots.track(scope);
        }

        let report = self.subscriptions.reconcile(desired).await;
        if !report.is_noop() {
            debug!(?report, "Reconciled subscriptions");
        }
        report
    }

    async fn handle_inbound(&self, inbound: InboundEvent) -> Vec<Notification> {
        let InboundEvent { scope, raw } = inbound;
        if !self.snapshots.is_tracked(scope) {
            debug!(scope, "Dropping event for a scope that is no longer desired");
            return Vec::new();
        }

        let event = classify(scope, &raw);
        let mut produced = vec![self.notifications.append(Notification::from_event(&event))];

        if event.kind.affects_graph() {
            produced.extend(self.refresh_and_detect(scope, &event).await);
        }
        produced
    }

    async fn refresh_and_detect(&self, scope: ProjectId, event: &DomainEvent) -> Vec<Notification> {
        let Some(ticket) = self.snapshots.begin_fetch(scope) else {
            return Vec::new();
        };

        match self.fetch_snapshot(scope).await {
            Ok(snapshot) => {
                if !self.snapshots.commit(&ticket, snapshot) {
                    return Vec::new();
                }
            }
            Err(e) => {
                // Detection still runs; it fetches on its own
                debug!(scope, kind = event.kind.as_str(), error = %e, "Snapshot refresh failed");
            }
        }

        let Some(user_id) = self.context.load().user_id else {
            return Vec::new();
        };
        self.detect_unblocked(&ticket, user_id).await
    }

    async fn detect_unblocked(&self, ticket: &FetchTicket, user_id: UserId) -> Vec<Notification> {
        let unblocked = match self
            .detector
            .run(self.api.as_ref(), ticket.project_id, user_id, || {
                self.snapshots.is_current(ticket)
            })
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                debug!(project_id = ticket.project_id, error = %e, "Unblock detection failed");
                return Vec::new();
            }
        };

        unblocked
            .iter()
            .map(|task| {
                info!(task_id = task.id, project_id = task.project_id, "Task unblocked");
                self.notifications.append(Notification::unblocked(task))
            })
            .collect()
    }

    async fn fetch_snapshot(&self, project_id: ProjectId) -> SyncResult<GraphSnapshot> {
        let tasks = self.api.list_tasks(project_id).await?;

        let fetches = tasks
            .iter()
            .map(|task| self.api.get_task_dependencies(task.id));
        let mut edges = Vec::new();
        for result in join_all(fetches).await {
            edges.extend(result?);
        }

        let analysis = if self.options.fetch_analysis {
            match self.api.get_graph_analysis(project_id).await {
                Ok(analysis) => Some(analysis),
                Err(e) => {
                    debug!(project_id, error = %e, "Graph analysis unavailable");
                    None
                }
            }
        } else {
            None
        };

        let snapshot = GraphSnapshot::new(project_id, tasks, edges, analysis);
        let dangling = snapshot.dangling_edges().len();
        if dangling > 0 {
            debug!(project_id, dangling, "Ignoring edges to unknown tasks");
        }
        if let Some(cycle) = snapshot.find_cycle() {
            warn!(project_id, ?cycle, "Dependency graph contains a cycle");
        }
        Ok(snapshot)
    }
}
