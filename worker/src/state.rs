//! Worker state machine.
//!
//! Exactly one [`WorkerState`] is current at any instant. The value lives in
//! a `watch` channel so the fetch loop, the signal listener and the may-i-run
//! poller all observe transitions without polling shared flags; transitions
//! themselves go through [`StateHandle::request`], which enforces the legal
//! edges (`Awake ↔ Asleep`, anything → `ShuttingDown`, nothing out of
//! `ShuttingDown`).
//!
//! A transition is not complete from the manager's point of view until the
//! worker has actually stopped fetching and aborted any active task. The
//! pending-acknowledgement slot records a state that still has to be
//! confirmed upstream; the worker loop takes it once it is safe to do so and
//! fetching stays gated until then.

use farmhand_core::RequestedStatus;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Result, WorkerError};

/// Map a manager-requested status onto a worker state.
pub fn requested_to_state(requested: RequestedStatus) -> WorkerState {
    match requested {
        RequestedStatus::Awake => WorkerState::Awake,
        RequestedStatus::Asleep => WorkerState::Asleep,
        RequestedStatus::Shutdown => WorkerState::ShuttingDown,
    }
}

/// Operational state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Fetching and executing tasks.
    Awake,
    /// Connected but not taking work; polls for a wake-up request.
    Asleep,
    /// Terminal: draining updates and signing off.
    ShuttingDown,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Awake => "awake",
            WorkerState::Asleep => "asleep",
            WorkerState::ShuttingDown => "shutting-down",
        }
    }

    /// Whether the state machine can move from `self` to `target`.
    ///
    /// Re-entering the current state is allowed and treated as a no-op by
    /// [`StateHandle::request`].
    pub fn can_transition_to(self, _target: WorkerState) -> bool {
        // Awake and Asleep may move anywhere; ShuttingDown is terminal.
        !matches!(self, WorkerState::ShuttingDown)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a transition request came from. Manager-issued requests stay pending
/// until acknowledged; locally-issued ones (signals, single-task mode) are
/// acknowledged too, but a failure to do so is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOrigin {
    Local,
    Manager,
}

/// Shared, synchronized handle to the worker state.
#[derive(Debug)]
pub struct StateHandle {
    tx: watch::Sender<WorkerState>,
    pending_ack: Mutex<Option<WorkerState>>,
}

impl StateHandle {
    pub fn new(initial: WorkerState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            pending_ack: Mutex::new(None),
        }
    }

    /// The current state.
    pub fn current(&self) -> WorkerState {
        *self.tx.borrow()
    }

    /// A receiver that observes every transition.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.tx.subscribe()
    }

    /// Request a transition.
    ///
    /// Returns `Ok(true)` if the state changed, `Ok(false)` if the worker was
    /// already in the target state, and an error for an illegal edge. On a
    /// real change into `Awake` or `Asleep` the target is recorded for
    /// acknowledgement; `ShuttingDown` is not acknowledged separately because
    /// the sign-off call already tells the manager we are going away.
    pub fn request(&self, target: WorkerState, origin: TransitionOrigin) -> Result<bool> {
        // Check-and-set must be one atomic step: two racing requests may not
        // interleave into a transition out of ShuttingDown.
        let mut from = target;
        let mut rejected = false;
        let changed = self.tx.send_if_modified(|state| {
            from = *state;
            if *state == target {
                return false;
            }
            if !state.can_transition_to(target) {
                rejected = true;
                return false;
            }
            *state = target;
            true
        });

        if rejected {
            warn!(current = %from, %target, "refusing state transition");
            return Err(WorkerError::InvalidTransition {
                from,
                to: target,
            });
        }
        if !changed {
            return Ok(false);
        }

        info!(%from, to = %target, ?origin, "worker state transition");

        if target == WorkerState::ShuttingDown {
            // A state change that will never be confirmed should not keep
            // the shutdown sequence gated.
            *self.pending_ack.lock() = None;
        } else {
            *self.pending_ack.lock() = Some(target);
        }
        Ok(true)
    }

    /// Whether a state change still awaits acknowledgement to the manager.
    pub fn ack_outstanding(&self) -> bool {
        self.pending_ack.lock().is_some()
    }

    /// Claim the pending acknowledgement, if any.
    ///
    /// The caller must only do this once fetching has stopped and any active
    /// task finished aborting; afterwards it confirms the state upstream.
    pub fn take_pending_ack(&self) -> Option<WorkerState> {
        self.pending_ack.lock().take()
    }
}
