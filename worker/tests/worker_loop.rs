//! Integration tests for the worker loop against a fake manager: the
//! registration handshake, fetch gating by the state machine, task abort on
//! sleep, manager-revoked tasks and the shutdown sequence.

mod support;

use std::sync::Arc;
use std::time::Duration;

use farmhand_core::{ManagerClient, RetryPolicy};
use farmhand_worker::runner::CommandRegistry;
use farmhand_worker::state::{StateHandle, TransitionOrigin, WorkerState};
use farmhand_worker::worker::ActiveTask;
use farmhand_worker::{
    IdentityStore, MayIRun, UpdateDispatcher, UpdateQueue, Worker, WorkerConfig, WorkerError,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use support::FakeManager;

struct TestWorker {
    worker: Worker,
    client: ManagerClient,
    queue: Arc<UpdateQueue>,
    state: Arc<StateHandle>,
    active: Arc<ActiveTask>,
    credentials_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

/// A worker wired against `manager_url` with test-scale delays.
async fn test_worker(manager_url: &str, single_task: bool) -> TestWorker {
    let dir = tempfile::tempdir().unwrap();
    let credentials_path = dir.path().join("credentials.json");

    let config = WorkerConfig {
        task_types: vec!["test".to_string()],
        queue_db: dir.path().join("queue.db"),
        credentials_file: credentials_path.clone(),
        request_timeout: Duration::from_secs(2),
        fetch_retry: RetryPolicy::fixed(Duration::from_millis(50)),
        dispatch_retry: RetryPolicy::fixed(Duration::from_millis(50)),
        no_work_delay: Duration::from_millis(50),
        task_done_delay: Duration::from_millis(50),
        asleep_poll_interval: Duration::from_millis(100),
        may_i_run_interval: Duration::from_millis(100),
        queue_size_threshold: 100,
        drain_timeout: Duration::from_secs(5),
        single_task,
    };

    let client = ManagerClient::new(manager_url, config.request_timeout).unwrap();
    let queue = Arc::new(UpdateQueue::in_memory().await.unwrap());
    let state = Arc::new(StateHandle::new(WorkerState::Awake));
    let active = Arc::new(ActiveTask::default());

    let worker = Worker::new(
        client.clone(),
        queue.clone(),
        Arc::new(CommandRegistry::builtin()),
        state.clone(),
        IdentityStore::new(&credentials_path),
        active.clone(),
        config,
    );

    TestWorker {
        worker,
        client,
        queue,
        state,
        active,
        credentials_path,
        _dir: dir,
    }
}

fn spawn_dispatcher(
    tw: &TestWorker,
) -> (
    CancellationToken,
    tokio::task::JoinHandle<Result<(), WorkerError>>,
) {
    let cancel = CancellationToken::new();
    let dispatcher = UpdateDispatcher::new(
        tw.queue.clone(),
        tw.client.clone(),
        RetryPolicy::fixed(Duration::from_millis(50)),
    );
    let handle = tokio::spawn(dispatcher.run(cancel.clone()));
    (cancel, handle)
}

fn echo_task(id: &str) -> serde_json::Value {
    json!({
        "_id": id,
        "job": "job-1",
        "task_type": "test",
        "commands": [
            {"name": "echo", "settings": {"message": "hello farm"}}
        ]
    })
}

fn long_task(id: &str) -> serde_json::Value {
    json!({
        "_id": id,
        "job": "job-1",
        "task_type": "test",
        "commands": [
            {"name": "exec", "settings": {"cmd": "sleep 30"}},
            {"name": "echo", "settings": {"message": "after the sleep"}},
            {"name": "echo", "settings": {"message": "and one more"}}
        ]
    })
}

#[tokio::test]
async fn single_task_mode_runs_one_task_then_signs_off() {
    let manager = FakeManager::start().await;
    manager.push_task(echo_task("task-1"));

    let mut tw = test_worker(&manager.url(), true).await;
    tw.worker.startup(false).await.unwrap();
    assert!(tw.credentials_path.exists(), "identity was not persisted");

    let (cancel, dispatch) = spawn_dispatcher(&tw);
    tokio::time::timeout(Duration::from_secs(15), tw.worker.run())
        .await
        .expect("worker did not shut down in time")
        .unwrap();

    {
        let state = manager.state.lock().unwrap();
        assert_eq!(state.registrations.len(), 1);
        assert_eq!(state.sign_offs, 1, "worker did not sign off");
    }

    // All updates were delivered before sign-off, terminal status last.
    let updates = manager.updates();
    assert!(!updates.is_empty());
    assert_eq!(updates[0].task_status(), Some("active"));
    assert_eq!(updates.last().unwrap().task_status(), Some("completed"));
    assert_eq!(
        updates
            .iter()
            .filter(|u| u.task_status() == Some("completed"))
            .count(),
        1
    );
    assert!(updates
        .iter()
        .any(|u| u.activity() == Some("running echo")));

    cancel.cancel();
    dispatch.await.unwrap().unwrap();
}

#[tokio::test]
async fn worker_reuses_stored_identity_and_signs_on() {
    let manager = FakeManager::start().await;

    // First startup registers...
    let mut tw = test_worker(&manager.url(), false).await;
    tw.worker.startup(false).await.unwrap();

    // ...a second worker over the same credentials file signs on instead.
    let client = tw.client.clone();
    let mut second = Worker::new(
        client,
        tw.queue.clone(),
        Arc::new(CommandRegistry::builtin()),
        Arc::new(StateHandle::new(WorkerState::Awake)),
        IdentityStore::new(&tw.credentials_path),
        Arc::new(ActiveTask::default()),
        WorkerConfig {
            credentials_file: tw.credentials_path.clone(),
            ..WorkerConfig::default()
        },
    );
    second.startup(false).await.unwrap();

    let state = manager.state.lock().unwrap();
    assert_eq!(state.registrations.len(), 1, "re-registered unnecessarily");
    assert_eq!(state.sign_ons.len(), 1);
}

#[tokio::test]
async fn worker_never_fetches_while_asleep() {
    let manager = FakeManager::start().await;
    let mut tw = test_worker(&manager.url(), false).await;
    tw.worker.startup(false).await.unwrap();

    let state = tw.state.clone();
    let mut worker = tw.worker;
    let handle = tokio::spawn(async move { worker.run().await });

    manager
        .wait_until("the first task fetch", Duration::from_secs(5), |m| {
            m.task_fetches >= 1
        })
        .await;

    state
        .request(WorkerState::Asleep, TransitionOrigin::Manager)
        .unwrap();
    manager
        .wait_until("the asleep acknowledgement", Duration::from_secs(5), |m| {
            m.acks.iter().any(|a| a == "asleep")
        })
        .await;

    // Several no-work delays worth of time: not a single fetch may happen.
    let fetches_at_sleep = manager.task_fetches();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        manager.task_fetches(),
        fetches_at_sleep,
        "worker fetched a task while asleep"
    );

    // A wake request via the status-change poll resumes fetching.
    manager.state.lock().unwrap().status_change = Some(json!({"status_requested": "awake"}));
    manager
        .wait_until("fetching to resume after wake-up", Duration::from_secs(5), |m| {
            m.acks.iter().any(|a| a == "awake") && m.task_fetches > fetches_at_sleep
        })
        .await;

    state
        .request(WorkerState::ShuttingDown, TransitionOrigin::Local)
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn sleep_request_aborts_active_task_and_blocks_fetching() {
    let manager = FakeManager::start().await;
    manager.push_task(long_task("task-7"));

    let mut tw = test_worker(&manager.url(), false).await;
    tw.worker.startup(false).await.unwrap();

    let (cancel, dispatch) = spawn_dispatcher(&tw);
    let state = tw.state.clone();
    let mut worker = tw.worker;
    let handle = tokio::spawn(async move { worker.run().await });

    manager
        .wait_until("the task to become active", Duration::from_secs(10), |m| {
            m.updates.iter().any(|u| u.task_status() == Some("active"))
        })
        .await;

    state
        .request(WorkerState::Asleep, TransitionOrigin::Manager)
        .unwrap();

    // The 30s subprocess is killed, aborted is reported exactly once, and
    // only then is the sleep acknowledged.
    manager
        .wait_until("the aborted update", Duration::from_secs(10), |m| {
            m.updates.iter().any(|u| u.task_status() == Some("aborted"))
        })
        .await;
    manager
        .wait_until("the asleep acknowledgement", Duration::from_secs(5), |m| {
            m.acks.iter().any(|a| a == "asleep")
        })
        .await;

    let fetches_at_sleep = manager.task_fetches();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(manager.task_fetches(), fetches_at_sleep);

    let updates = manager.updates();
    assert_eq!(
        updates
            .iter()
            .filter(|u| u.task_status() == Some("aborted"))
            .count(),
        1
    );
    // The commands after the killed one never started.
    assert!(!updates
        .iter()
        .any(|u| u.activity() == Some("running echo")));

    state
        .request(WorkerState::ShuttingDown, TransitionOrigin::Local)
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    cancel.cancel();
    dispatch.await.unwrap().unwrap();
}

#[tokio::test]
async fn locked_fetch_reply_puts_worker_asleep() {
    let manager = FakeManager::start().await;
    manager.state.lock().unwrap().fetch_state_change =
        Some(json!({"status_requested": "asleep"}));

    let mut tw = test_worker(&manager.url(), false).await;
    tw.worker.startup(false).await.unwrap();

    let state = tw.state.clone();
    let mut worker = tw.worker;
    let handle = tokio::spawn(async move { worker.run().await });

    manager
        .wait_until("the asleep acknowledgement", Duration::from_secs(5), |m| {
            m.acks.iter().any(|a| a == "asleep")
        })
        .await;
    assert_eq!(state.current(), WorkerState::Asleep);

    state
        .request(WorkerState::ShuttingDown, TransitionOrigin::Local)
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn revoked_task_is_aborted_silently_and_returned() {
    let manager = FakeManager::start().await;
    manager.push_task(long_task("task-3"));

    let mut tw = test_worker(&manager.url(), false).await;
    tw.worker.startup(false).await.unwrap();

    let (cancel, dispatch) = spawn_dispatcher(&tw);
    let mir_cancel = CancellationToken::new();
    let mir = MayIRun::new(
        tw.client.clone(),
        tw.state.clone(),
        tw.active.clone(),
        Duration::from_millis(100),
    );
    let mir_handle = tokio::spawn(mir.run(mir_cancel.clone()));

    let state = tw.state.clone();
    let mut worker = tw.worker;
    let handle = tokio::spawn(async move { worker.run().await });

    manager
        .wait_until("the task to become active", Duration::from_secs(10), |m| {
            m.updates.iter().any(|u| u.task_status() == Some("active"))
        })
        .await;

    manager.state.lock().unwrap().may_i_run =
        Some(json!({"may_keep_running": false, "reason": "task was re-queued"}));

    manager
        .wait_until("the task to be returned", Duration::from_secs(10), |m| {
            m.returned_tasks.iter().any(|t| t == "task-3")
        })
        .await;

    // Silent abort: no terminal status is pushed for the revoked task.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!manager
        .updates()
        .iter()
        .any(|u| u.task_status() == Some("aborted") || u.task_status() == Some("failed")));

    // The worker stays healthy and keeps fetching.
    let fetches = manager.task_fetches();
    manager
        .wait_until("fetching to continue", Duration::from_secs(5), |m| {
            m.task_fetches > fetches
        })
        .await;

    state
        .request(WorkerState::ShuttingDown, TransitionOrigin::Local)
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    mir_cancel.cancel();
    let _ = mir_handle.await;
    cancel.cancel();
    dispatch.await.unwrap().unwrap();
}

#[tokio::test]
async fn fresh_worker_with_unreachable_manager_fails_startup() {
    // Reserve an address with nothing listening on it.
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let mut tw = test_worker(&format!("http://{addr}"), false).await;
    let err = tw.worker.startup(false).await.unwrap_err();
    assert!(
        matches!(err, WorkerError::Registration(_)),
        "unexpected error: {err:?}"
    );
    assert!(
        !tw.credentials_path.exists(),
        "no identity may be persisted on failed registration"
    );
}
