//! Periodic `may-i-run` poll for the active task.
//!
//! The manager may revoke a task mid-execution (re-assignment, job
//! cancellation). When that happens the task is aborted silently: the
//! manager already owns the task's fate, so pushing our own terminal status
//! would only fight it. The denial may also carry a requested worker state,
//! which is applied like any other manager-issued state change.

use std::sync::Arc;
use std::time::Duration;

use farmhand_core::ManagerClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::{requested_to_state, StateHandle, TransitionOrigin};
use crate::worker::ActiveTask;

pub struct MayIRun {
    client: ManagerClient,
    state: Arc<StateHandle>,
    active: Arc<ActiveTask>,
    interval: Duration,
}

impl MayIRun {
    pub fn new(
        client: ManagerClient,
        state: Arc<StateHandle>,
        active: Arc<ActiveTask>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            state,
            active,
            interval,
        }
    }

    /// Poll until cancelled. Transport errors are logged and ignored; the
    /// next tick simply asks again.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    debug!("may-i-run poller stopping");
                    return;
                }
            }
            self.one_iteration().await;
        }
    }

    async fn one_iteration(&self) {
        let Some(task_id) = self.active.task_id() else {
            return;
        };

        let reply = match self.client.may_i_run(&task_id).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, %task_id, "may-i-run query failed, keeping the task running");
                return;
            }
        };

        if reply.may_keep_running {
            debug!(%task_id, "task may keep running");
            return;
        }

        warn!(
            %task_id,
            reason = reply.reason.as_deref().unwrap_or("no reason given"),
            "manager revoked permission to run the task"
        );

        if self.active.abort_silently(&task_id) {
            // The abort is underway; hand the task back for re-scheduling.
            if let Err(err) = self.client.return_task(&task_id).await {
                warn!(%err, %task_id, "could not return the task, the manager will time it out");
            }
        }

        if let Some(requested) = reply.status_requested {
            if let Err(err) = self
                .state
                .request(requested_to_state(requested), TransitionOrigin::Manager)
            {
                warn!(%err, "ignoring state change piggybacked on may-i-run reply");
            }
        }
    }
}
