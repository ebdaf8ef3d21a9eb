//! Integration tests for a sync session driven by in-process doubles.
//!
//! The task service is an `InMemoryTaskApi` and the push channel is a
//! `ChannelEventSource`, so every scenario runs without a network.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tasksync::api::InMemoryTaskApi;
use tasksync::error::SyncError;
use tasksync::notifications::{DEFAULT_CAPACITY, Notification, NotificationKind};
use tasksync::source::ChannelEventSource;
use tasksync::types::{Role, Task, TaskStatus};
use tasksync::{SessionContext, SessionOptions, SyncSession};

const USER: i64 = 7;

fn options() -> SessionOptions {
    SessionOptions {
        reconcile_interval: None,
        fetch_analysis: false,
        ..SessionOptions::default()
    }
}

fn executor_on(project: i64) -> SessionContext {
    SessionContext {
        user_id: Some(USER),
        role: Some(Role::Executor),
        selected_project: Some(project),
        visible_projects: Vec::new(),
    }
}

/// Helper to build a session over fresh doubles.
fn setup(
    context: SessionContext,
) -> (Arc<SyncSession>, Arc<InMemoryTaskApi>, ChannelEventSource) {
    let api = Arc::new(InMemoryTaskApi::new());
    let source = ChannelEventSource::new();
    let session = SyncSession::new(api.clone(), Arc::new(source.clone()), context, options());
    (Arc::new(session), api, source)
}

fn unblocked(notifications: &[Notification]) -> Vec<i64> {
    notifications
        .iter()
        .filter(|n| n.kind == NotificationKind::Deps && n.link == "/tasks")
        .filter_map(|n| n.meta.as_ref()?.get("task_id")?.as_i64())
        .collect()
}

fn stored_status(session: &SyncSession, project: i64, task: i64) -> Option<TaskStatus> {
    session.snapshot(project)?.task(task).map(|t| t.status)
}

/// Poll until `cond` holds, failing the test after two seconds.
async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

const TASK_UPDATED: &str = r#"{"kind":"task_updated","task_id":1,"new_status":"done"}"#;

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn reconcile_twice_causes_no_churn() {
    let (session, _api, source) = setup(executor_on(1));

    let first = session.start().await;
    assert_eq!(first.opened, vec![1]);

    let second = session.reconcile().await;
    assert!(second.is_noop());
    assert_eq!(source.open_count(1), 1);
    assert_eq!(source.close_count(1), 0);
    assert_eq!(source.live_connections(1), 1);

    session.teardown();
}

#[tokio::test]
async fn switching_projects_isolates_scopes() {
    let (session, _api, source) = setup(executor_on(1));
    session.start().await;

    let report = session.set_selected_project(Some(2)).await;
    assert_eq!(report.closed, vec![1]);
    assert_eq!(report.opened, vec![2]);
    assert_eq!(source.close_count(1), 1);
    assert_eq!(source.publish(1, "task_created"), 0);

    // A late event for the old scope is dropped
    assert!(session.ingest(1, "task_created").await.is_empty());
    assert!(session.notifications().is_empty());

    session.teardown();
}

#[tokio::test]
async fn admin_follows_every_visible_project() {
    let (session, api, source) = setup(SessionContext {
        user_id: Some(1),
        ..SessionContext::default()
    });
    api.set_user(1, Role::Admin);
    api.add_project(1, "alpha");
    api.add_project(2, "beta");
    api.add_project(3, "gamma");

    session.start().await;
    assert_eq!(session.open_scopes(), BTreeSet::from([1, 2, 3]));
    assert_eq!(source.total_opens(), 3);

    session.set_role(Some(Role::Executor)).await;
    assert!(session.open_scopes().is_empty());

    session.teardown();
}

#[tokio::test]
async fn dead_stream_is_reopened() {
    let (session, _api, source) = setup(executor_on(4));
    session.start().await;

    source.break_streams(4, "connection reset");
    assert_eq!(source.live_connections(4), 0);

    // The pump notices the end of the stream asynchronously
    let mut revived = Vec::new();
    for _ in 0..200 {
        revived = session.reconcile().await.revived;
        if !revived.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(revived, vec![4]);
    assert_eq!(source.open_count(4), 2);
    assert_eq!(source.live_connections(4), 1);

    session.teardown();
}

#[tokio::test]
async fn refused_open_is_retried() {
    let (session, _api, source) = setup(executor_on(5));
    source.refuse_opens(5, true);

    let report = session.start().await;
    assert_eq!(report.failed, vec![5]);
    assert!(session.open_scopes().is_empty());

    source.refuse_opens(5, false);
    let report = session.reconcile().await;
    assert_eq!(report.opened, vec![5]);

    session.teardown();
}

// ============================================================================
// Transition guard
// ============================================================================

#[tokio::test]
async fn task_without_predecessors_can_start() {
    let (session, api, _source) = setup(executor_on(1));
    api.put_task(Task::new(10, 1, "solo", TaskStatus::Backlog));

    let allowed = session.allowed_transitions(1, 10).await.unwrap();
    assert!(allowed.can_start);
    assert!(!allowed.can_complete);
    assert!(allowed.can_reset);
}

#[tokio::test]
async fn unfinished_predecessor_blocks_start() {
    let (session, api, _source) = setup(executor_on(1));
    api.put_task(Task::new(1, 1, "design", TaskStatus::InProgress));
    api.put_task(Task::new(2, 1, "build", TaskStatus::Backlog));
    api.add_dependency(2, 1).unwrap();

    let allowed = session.allowed_transitions(1, 2).await.unwrap();
    assert!(!allowed.can_start);
    assert!(!allowed.can_complete);

    let err = session
        .change_status(1, 2, TaskStatus::InProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TransitionNotAllowed { task_id: 2, .. }));
    assert_eq!(api.status_of(2), Some(TaskStatus::Backlog));

    let err = session.change_status(1, 2, TaskStatus::Review).await.unwrap_err();
    assert!(matches!(err, SyncError::TransitionNotAllowed { .. }));
}

#[tokio::test]
async fn completion_requires_in_progress() {
    let (session, api, _source) = setup(executor_on(1));
    api.put_task(Task::new(3, 1, "write docs", TaskStatus::Backlog));

    let err = session.change_status(1, 3, TaskStatus::Done).await.unwrap_err();
    assert!(matches!(err, SyncError::TransitionNotAllowed { task_id: 3, .. }));

    let task = session
        .change_status(1, 3, TaskStatus::InProgress)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);

    let allowed = session.allowed_transitions(1, 3).await.unwrap();
    assert!(allowed.can_complete);
    session.change_status(1, 3, TaskStatus::Done).await.unwrap();
    assert_eq!(api.status_of(3), Some(TaskStatus::Done));
}

#[tokio::test]
async fn reset_is_always_allowed() {
    let (session, api, _source) = setup(executor_on(1));
    api.put_task(Task::new(1, 1, "design", TaskStatus::Backlog));
    api.put_task(Task::new(2, 1, "build", TaskStatus::Review));
    api.add_dependency(2, 1).unwrap();

    let allowed = session.allowed_transitions(1, 2).await.unwrap();
    assert!(allowed.can_reset);
    session.change_status(1, 2, TaskStatus::Backlog).await.unwrap();
    assert_eq!(api.status_of(2), Some(TaskStatus::Backlog));
}

#[tokio::test]
async fn unknown_task_is_reported() {
    let (session, _api, _source) = setup(executor_on(1));
    let err = session.allowed_transitions(1, 99).await.unwrap_err();
    assert!(matches!(err, SyncError::TaskNotFound(99)));
}

// ============================================================================
// Unblock detection
// ============================================================================

#[tokio::test]
async fn unblocked_task_notified_once() {
    let (session, api, _source) = setup(executor_on(1));
    session.start().await;
    api.put_task(Task::new(1, 1, "design", TaskStatus::InProgress));
    api.put_task(Task::new(2, 1, "build", TaskStatus::Backlog).with_assignee(USER));
    api.add_dependency(2, 1).unwrap();

    let produced = session.ingest(1, TASK_UPDATED).await;
    assert!(unblocked(&produced).is_empty());

    api.set_status(1, TaskStatus::Done);
    let produced = session.ingest(1, TASK_UPDATED).await;
    assert_eq!(unblocked(&produced), vec![2]);

    let produced = session.ingest(1, TASK_UPDATED).await;
    assert!(unblocked(&produced).is_empty());
    assert!(session.detector().was_notified(2));

    session.teardown();
}

#[tokio::test]
async fn reset_to_backlog_does_not_renotify() {
    let (session, api, _source) = setup(executor_on(1));
    session.start().await;
    api.put_task(Task::new(5, 1, "ship", TaskStatus::Backlog).with_assignee(USER));

    let produced = session.ingest(1, "deps_updated").await;
    assert_eq!(unblocked(&produced), vec![5]);

    api.set_status(5, TaskStatus::InProgress);
    session.ingest(1, TASK_UPDATED).await;
    api.set_status(5, TaskStatus::Backlog);
    let produced = session.ingest(1, TASK_UPDATED).await;
    assert!(unblocked(&produced).is_empty());
    assert_eq!(session.detector().notified_count(), 1);

    session.teardown();
}

#[tokio::test]
async fn only_own_backlog_tasks_are_candidates() {
    let (session, api, _source) = setup(executor_on(1));
    session.start().await;
    api.put_task(Task::new(1, 1, "someone else", TaskStatus::Backlog).with_assignee(USER + 1));
    api.put_task(Task::new(2, 1, "already started", TaskStatus::InProgress).with_assignee(USER));
    api.put_task(Task::new(3, 1, "unassigned", TaskStatus::Backlog));

    let produced = session.ingest(1, TASK_UPDATED).await;
    assert!(unblocked(&produced).is_empty());

    session.teardown();
}

#[tokio::test]
async fn failed_candidate_does_not_hide_others() {
    let (session, api, _source) = setup(executor_on(1));
    session.start().await;
    api.put_task(Task::new(1, 1, "flaky", TaskStatus::Backlog).with_assignee(USER));
    api.put_task(Task::new(2, 1, "steady", TaskStatus::Backlog).with_assignee(USER));
    api.fail_dependencies_of(1);

    let produced = session.ingest(1, TASK_UPDATED).await;
    assert_eq!(unblocked(&produced), vec![2]);
    assert!(!session.detector().was_notified(1));

    session.teardown();
}

#[tokio::test]
async fn non_graph_events_skip_detection() {
    let (session, api, _source) = setup(executor_on(1));
    session.start().await;
    api.put_task(Task::new(1, 1, "ready", TaskStatus::Backlog).with_assignee(USER));

    let produced = session
        .ingest(1, r#"{"kind":"message","user_name":"Ada"}"#)
        .await;
    assert_eq!(produced.len(), 1);
    assert_eq!(produced[0].kind, NotificationKind::Message);
    assert_eq!(produced[0].link, "/chats");
    assert_eq!(api.list_tasks_calls(), 0);

    session.teardown();
}

#[tokio::test]
async fn stale_refresh_is_discarded() {
    let (session, api, _source) = setup(executor_on(1));
    session.start().await;
    api.put_task(Task::new(1, 1, "ready", TaskStatus::Backlog).with_assignee(USER));
    let gate = api.hold_tasks(1);

    let worker = {
        let session = session.clone();
        tokio::spawn(async move { session.ingest(1, TASK_UPDATED).await })
    };
    wait_for(|| api.list_tasks_calls() == 1).await;

    // The project leaves the desired set while its refresh is in flight
    session.reconcile_subscriptions(&BTreeSet::new()).await;
    api.release_hold(1);
    gate.notify_one();

    let produced = worker.await.unwrap();
    assert!(unblocked(&produced).is_empty());
    assert!(session.snapshot(1).is_none());
    assert!(!session.detector().was_notified(1));

    session.teardown();
}

#[tokio::test]
async fn overlapping_refreshes_keep_newest_state() {
    let (session, api, _source) = setup(executor_on(1));
    session.start().await;
    api.put_task(Task::new(1, 1, "design", TaskStatus::InProgress));
    let gate = api.hold_tasks(1);

    // The first refresh reads the old state, then stalls
    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.ingest(1, TASK_UPDATED).await })
    };
    wait_for(|| api.list_tasks_calls() == 1).await;

    api.release_hold(1);
    api.set_status(1, TaskStatus::Done);
    session.ingest(1, TASK_UPDATED).await;
    assert_eq!(stored_status(&session, 1, 1), Some(TaskStatus::Done));

    // Its late answer must not roll the snapshot back
    gate.notify_one();
    first.await.unwrap();
    assert_eq!(stored_status(&session, 1, 1), Some(TaskStatus::Done));
    assert!(!session.allowed_transitions(1, 1).await.unwrap().can_complete);

    session.teardown();
}

#[tokio::test]
async fn concurrent_events_announce_once() {
    let (session, api, _source) = setup(executor_on(1));
    session.start().await;
    api.put_task(Task::new(5, 1, "ship", TaskStatus::Backlog).with_assignee(USER));
    let gate = api.hold_tasks(1);

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.ingest(1, TASK_UPDATED).await })
        })
        .collect();
    wait_for(|| api.list_tasks_calls() == 2).await;

    api.release_hold(1);
    gate.notify_one();
    gate.notify_one();

    let mut announced = Vec::new();
    for worker in workers {
        announced.extend(unblocked(&worker.await.unwrap()));
    }
    assert_eq!(announced, vec![5]);
    assert_eq!(session.detector().notified_count(), 1);
    assert_eq!(unblocked(&session.notifications().list()), vec![5]);

    session.teardown();
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test]
async fn pushed_events_become_notifications() {
    let (session, api, source) = setup(executor_on(3));
    let mut feed = session.on_notification();
    session.start().await;
    api.put_task(Task::new(8, 3, "review API", TaskStatus::Review));

    let reached = source.publish(
        3,
        r#"{"kind":"task_updated","task_id":8,"old_status":"in_progress","new_status":"review","user_name":"Ada"}"#,
    );
    assert_eq!(reached, 1);

    let notification = tokio::time::timeout(Duration::from_secs(2), feed.recv())
        .await
        .expect("notification delivered")
        .unwrap();
    assert_eq!(notification.kind, NotificationKind::Task);
    assert!(notification.text.contains("#8"));
    assert!(notification.text.contains("Ada"));
    assert!(!notification.read);

    wait_for(|| session.snapshot(3).is_some()).await;
    session.teardown();
}

#[tokio::test]
async fn unknown_event_does_not_break_the_stream() {
    let (session, _api, source) = setup(executor_on(2));
    session.start().await;

    source.publish(2, "{not json");
    source.publish(2, "something_new");
    source.publish(2, "task_created");

    wait_for(|| session.notifications().len() == 3).await;
    let kinds: Vec<NotificationKind> = session
        .notifications()
        .list()
        .iter()
        .map(|n| n.kind)
        .collect();
    assert_eq!(kinds.iter().filter(|k| **k == NotificationKind::Info).count(), 2);
    assert!(kinds.contains(&NotificationKind::Task));
    assert_eq!(session.open_scopes(), BTreeSet::from([2]));

    session.teardown();
}

#[tokio::test]
async fn log_keeps_newest_entries() {
    let (session, _api, _source) = setup(executor_on(1));
    session.start().await;

    for _ in 0..=DEFAULT_CAPACITY {
        session.ingest(1, "task_created").await;
    }
    assert_eq!(session.notifications().len(), DEFAULT_CAPACITY);
    assert_eq!(session.unread_count(), DEFAULT_CAPACITY);

    session.mark_all_read();
    assert_eq!(session.unread_count(), 0);

    session.teardown();
}

#[tokio::test]
async fn teardown_closes_every_stream() {
    let (session, _api, source) = setup(executor_on(6));
    session.start().await;
    assert_eq!(source.live_connections(6), 1);

    session.teardown();
    assert_eq!(source.live_connections(6), 0);
    assert_eq!(source.close_count(6), 1);
    assert!(session.open_scopes().is_empty());
}

#[tokio::test]
async fn torn_down_session_stays_closed() {
    let (session, _api, source) = setup(executor_on(6));
    session.start().await;
    session.teardown();

    let report = session.start().await;
    assert!(report.is_noop());
    let report = session.set_selected_project(Some(7)).await;
    assert!(report.is_noop());
    assert!(session.open_scopes().is_empty());
    assert_eq!(source.total_opens(), 1);
    assert_eq!(source.live_connections(6), 0);
}
