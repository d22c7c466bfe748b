//! Worker error taxonomy.
//!
//! The split matters more than usual here because each variant has a fixed
//! fate: `Storage`, `Discovery` and `Registration` end the process,
//! `Transport` is absorbed by retry loops, `CommandExecution` fails a single
//! task, and `AbortRequested` is a control signal rather than a failure.

use farmhand_core::CoreError;

use crate::state::WorkerState;

/// Error type for the worker runtime.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Durable storage (update queue or identity file) failed. Fatal: without
    /// it the no-update-lost guarantee is gone.
    #[error("storage error: {0}")]
    Storage(String),

    /// No manager could be found on the network.
    #[error("manager discovery failed: {0}")]
    Discovery(String),

    /// The manager rejected or never answered our registration. Fatal at
    /// startup: the worker cannot act without an identity.
    #[error("registration failed: {0}")]
    Registration(CoreError),

    /// A network call failed. Always recoverable; handled by retrying.
    #[error("transport error: {0}")]
    Transport(#[from] CoreError),

    /// An external command exited non-zero, had invalid settings, or its
    /// input never appeared. Scoped to the task being executed.
    #[error("command execution failed: {0}")]
    CommandExecution(String),

    /// The current task was asked to stop. Not a failure.
    #[error("task abort requested")]
    AbortRequested,

    /// A state transition that the state machine does not allow.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },
}

impl WorkerError {
    /// Wrap a storage-layer failure with its context.
    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        WorkerError::Storage(format!("{context}: {err}"))
    }

    /// Whether this error must terminate the worker process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Storage(_) | WorkerError::Discovery(_) | WorkerError::Registration(_)
        )
    }
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
