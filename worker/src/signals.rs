//! POSIX signal handling.
//!
//! SIGTERM/SIGINT shut the worker down, SIGUSR1 puts it to sleep, SIGUSR2
//! wakes it up. On platforms without these signals the binary compiles
//! without this module; the [`StateHandle`] itself is the control channel
//! there.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::state::{StateHandle, TransitionOrigin, WorkerState};

/// Install the signal listeners and spawn the task that feeds them into the
/// state machine. Fails only if the handlers cannot be registered.
pub fn install(state: Arc<StateHandle>) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    tokio::spawn(async move {
        loop {
            let (target, name) = tokio::select! {
                _ = sigterm.recv() => (WorkerState::ShuttingDown, "SIGTERM"),
                _ = sigint.recv() => (WorkerState::ShuttingDown, "SIGINT"),
                _ = sigusr1.recv() => (WorkerState::Asleep, "SIGUSR1"),
                _ = sigusr2.recv() => (WorkerState::Awake, "SIGUSR2"),
            };

            info!(signal = name, state = %target, "signal received");
            if let Err(err) = state.request(target, TransitionOrigin::Local) {
                warn!(%err, signal = name, "signal-requested transition rejected");
            }

            if target == WorkerState::ShuttingDown {
                // Shutdown is terminal, nothing further to listen for.
                return;
            }
        }
    });

    Ok(())
}
