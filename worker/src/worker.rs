//! Top-level worker: registration handshake, fetch/execute loop, sleep loop
//! and the shutdown sequence.
//!
//! The loop fetches at most one task at a time and hands it to the task
//! runner synchronously; a state transition away from `Awake` while a task is
//! active aborts the runner before the new state takes effect. Fetching is
//! gated on the state machine (and on any unacknowledged state change), so a
//! fetch call is never issued while the worker is not awake.

use std::sync::Arc;
use std::time::Duration;

use farmhand_core::{
    ManagerClient, RegistrationRequest, RequestedStatus, SignOnRequest, StatusUpdate, Task,
    TaskFetch, TaskStatus, WorkerIdentity,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::identity::IdentityStore;
use crate::queue::UpdateQueue;
use crate::runner::{CommandRegistry, TaskControl, TaskRunner, TerminalStatus, UpdateSink};
use crate::state::{requested_to_state, StateHandle, TransitionOrigin, WorkerState};

/// The task currently being executed, shared with the may-i-run poller.
#[derive(Debug, Default)]
pub struct ActiveTask {
    inner: parking_lot::Mutex<Option<(String, Arc<TaskControl>)>>,
}

impl ActiveTask {
    /// Id of the executing task, if one is active right now.
    pub fn task_id(&self) -> Option<String> {
        self.inner.lock().as_ref().map(|(id, _)| id.clone())
    }

    fn set(&self, task_id: &str, control: Arc<TaskControl>) {
        *self.inner.lock() = Some((task_id.to_string(), control));
    }

    fn clear(&self) {
        *self.inner.lock() = None;
    }

    /// Abort without reporting a terminal status, but only if `task_id` is
    /// still the active task (guards against racing a task change).
    pub fn abort_silently(&self, task_id: &str) -> bool {
        match self.inner.lock().as_ref() {
            Some((id, control)) if id == task_id => {
                control.abort_silently();
                true
            }
            _ => false,
        }
    }
}

/// The worker runtime.
pub struct Worker {
    client: ManagerClient,
    queue: Arc<UpdateQueue>,
    runner: TaskRunner,
    state: Arc<StateHandle>,
    state_rx: watch::Receiver<WorkerState>,
    identity_store: IdentityStore,
    active: Arc<ActiveTask>,
    config: WorkerConfig,
    fetch_failures: u32,
    /// Task aborted by the shutdown transition; returned to the manager's
    /// queue during sign-off.
    released_task: Option<String>,
}

impl Worker {
    pub fn new(
        client: ManagerClient,
        queue: Arc<UpdateQueue>,
        registry: Arc<CommandRegistry>,
        state: Arc<StateHandle>,
        identity_store: IdentityStore,
        active: Arc<ActiveTask>,
        config: WorkerConfig,
    ) -> Self {
        let runner = TaskRunner::new(registry, queue.clone() as Arc<dyn UpdateSink>);
        let state_rx = state.subscribe();
        Self {
            client,
            queue,
            runner,
            state,
            state_rx,
            identity_store,
            active,
            config,
            fetch_failures: 0,
            released_task: None,
        }
    }

    /// Establish the worker identity: load stored credentials and sign on,
    /// or register as a new worker. Any failure here is fatal to startup.
    pub async fn startup(&mut self, force_reregister: bool) -> Result<()> {
        info!("starting up");

        let stored = if force_reregister {
            info!("forced re-registration, discarding stored credentials");
            self.identity_store.clear()?;
            None
        } else {
            self.identity_store.load()?
        };

        match stored {
            None => self.register().await,
            Some(identity) => {
                info!(worker_id = %identity.worker_id, "signing on with stored identity");
                self.client.set_credentials(identity);
                match self.sign_on().await {
                    Ok(()) => Ok(()),
                    Err(WorkerError::Registration(err)) if err.is_unauthorized() => {
                        warn!("manager no longer accepts our credentials, re-registering");
                        self.register().await?;
                        self.sign_on().await
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    async fn register(&self) -> Result<()> {
        info!(manager = %self.client.base_url(), "registering as a new worker");

        let secret = generate_secret();
        let request = RegistrationRequest {
            secret: secret.clone(),
            platform: std::env::consts::OS.to_string(),
            supported_task_types: self.config.task_types.clone(),
            nickname: nickname(),
        };

        let worker_id = self
            .client
            .register_worker(&request)
            .await
            .map_err(WorkerError::Registration)?;

        let identity = WorkerIdentity {
            worker_id,
            worker_secret: secret,
        };
        self.identity_store.save(&identity)?;
        self.client.set_credentials(identity);
        Ok(())
    }

    async fn sign_on(&self) -> Result<()> {
        let request = SignOnRequest {
            supported_task_types: self.config.task_types.clone(),
            nickname: nickname(),
        };
        self.client
            .sign_on(&request)
            .await
            .map_err(WorkerError::Registration)?;
        info!("manager accepted sign-on");
        Ok(())
    }

    /// Main loop. Returns after the shutdown sequence, or with a fatal
    /// storage error.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.state.current() {
                WorkerState::Awake => self.awake_iteration().await?,
                WorkerState::Asleep => self.asleep_iteration().await?,
                WorkerState::ShuttingDown => break,
            }
        }
        self.shutdown().await
    }

    /// Confirm a pending state change upstream. Called only once fetching
    /// has stopped and any abort has finished.
    async fn ack_if_pending(&self) {
        if let Some(state) = self.state.take_pending_ack() {
            match self.client.ack_status_change(state.as_str()).await {
                Ok(()) => debug!(%state, "state change acknowledged"),
                Err(err) => warn!(%err, %state, "could not acknowledge state change"),
            }
        }
    }

    async fn awake_iteration(&mut self) -> Result<()> {
        self.ack_if_pending().await;

        // Don't pile more work onto a queue that can't reach the manager.
        let queue_size = self.queue.size().await?;
        if queue_size > self.config.queue_size_threshold {
            info!(
                queue_size,
                threshold = self.config.queue_size_threshold,
                "update queue too large, delaying next fetch"
            );
            self.wait_or_state_change(self.config.fetch_retry.delay_for(0))
                .await;
            return Ok(());
        }

        match self.client.fetch_task().await {
            Ok(TaskFetch::Assigned(task)) => {
                self.fetch_failures = 0;
                let status = self.execute_task(task).await?;
                if self.config.single_task && status == TerminalStatus::Completed {
                    info!("single-task mode, shutting down");
                    let _ = self
                        .state
                        .request(WorkerState::ShuttingDown, TransitionOrigin::Local);
                } else if self.state.current() == WorkerState::Awake {
                    self.wait_or_state_change(self.config.task_done_delay).await;
                }
            }
            Ok(TaskFetch::NoWork) => {
                self.fetch_failures = 0;
                debug!("no work available");
                self.wait_or_state_change(self.config.no_work_delay).await;
            }
            Ok(TaskFetch::StateChange(request)) => {
                info!(requested = ?request.status_requested, "manager requested a state change");
                self.apply_requested_status(request.status_requested);
            }
            Err(err) => {
                let delay = self.config.fetch_retry.delay_for(self.fetch_failures);
                self.fetch_failures = self.fetch_failures.saturating_add(1);
                warn!(%err, ?delay, "task fetch failed, will retry");
                self.wait_or_state_change(delay).await;
            }
        }
        Ok(())
    }

    async fn asleep_iteration(&mut self) -> Result<()> {
        self.ack_if_pending().await;

        tokio::select! {
            _ = self.state_rx.changed() => {}
            _ = tokio::time::sleep(self.config.asleep_poll_interval) => {
                match self.client.check_status_change().await {
                    Ok(Some(request)) => {
                        info!(requested = ?request.status_requested, "state change requested while asleep");
                        self.apply_requested_status(request.status_requested);
                    }
                    Ok(None) => debug!("no state change requested, staying asleep"),
                    Err(err) => debug!(%err, "status-change poll failed, staying asleep"),
                }
            }
        }
        Ok(())
    }

    /// Run one task to its terminal status, aborting it if the worker state
    /// leaves `Awake` while it is active.
    async fn execute_task(&mut self, task: Task) -> Result<TerminalStatus> {
        info!(task_id = %task.id, task_type = %task.task_type, "task received");

        let control = Arc::new(TaskControl::new());
        self.active.set(&task.id, control.clone());

        self.queue
            .enqueue(&StatusUpdate::status(
                &task.id,
                TaskStatus::Active,
                "Task assigned",
            ))
            .await?;

        let run = self.runner.run(&task, control.clone());
        tokio::pin!(run);
        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = self.state_rx.changed() => {
                    let current = *self.state_rx.borrow();
                    if current != WorkerState::Awake && !control.is_cancelled() {
                        info!(task_id = %task.id, state = %current, "aborting active task for state change");
                        control.abort();
                    }
                }
            }
        };

        self.active.clear();
        let status = outcome?;

        match status {
            TerminalStatus::Completed => info!(task_id = %task.id, "task completed"),
            TerminalStatus::Failed => warn!(task_id = %task.id, "task failed"),
            TerminalStatus::Aborted => {
                info!(task_id = %task.id, "task aborted");
                if self.state.current() == WorkerState::ShuttingDown && !control.is_silent() {
                    // Hand it back to the pool during sign-off.
                    self.released_task = Some(task.id.clone());
                }
            }
        }
        Ok(status)
    }

    fn apply_requested_status(&self, requested: RequestedStatus) {
        let target = requested_to_state(requested);
        if let Err(err) = self.state.request(target, TransitionOrigin::Manager) {
            warn!(%err, "ignoring state change request");
        }
    }

    /// Wait, but wake early on any state transition.
    async fn wait_or_state_change(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.state_rx.changed() => {}
        }
    }

    /// Shutdown sequence: drain the queue, release a still-assigned task back
    /// to the pool, sign off. Transport failures here are logged, not fatal;
    /// undelivered updates stay queued for the next run.
    async fn shutdown(&mut self) -> Result<()> {
        info!("shutting down");

        if self.queue.drain(self.config.drain_timeout).await? {
            debug!("update queue drained");
        } else {
            warn!(
                timeout = ?self.config.drain_timeout,
                "update queue not drained in time, leaving the rest for the next run"
            );
        }

        if let Some(task_id) = self.released_task.take() {
            info!(%task_id, "returning aborted task to the manager's queue");
            if let Err(err) = self.client.return_task(&task_id).await {
                warn!(%err, "could not return the task, the manager will time it out");
            }
        }

        match self.client.sign_off().await {
            Ok(()) => info!("signed off at manager"),
            Err(err) => warn!(%err, "sign-off failed, shutting down anyway"),
        }
        Ok(())
    }
}

/// Hostname announced at registration and sign-on.
fn nickname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// A fresh 64-character alphanumeric worker secret.
fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}
