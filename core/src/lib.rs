//! Shared core for the farmhand render-farm worker.
//!
//! This crate holds everything the worker runtime and its tests need to talk
//! to a farmhand manager: the JSON documents exchanged over the wire, the
//! authenticated HTTP client, the retry policy consumed by the fetch loop and
//! the update dispatcher, and the shared error type.

pub mod backoff;
pub mod client;
pub mod documents;
pub mod error;

pub use backoff::RetryPolicy;
pub use client::{ManagerClient, TaskFetch};
pub use documents::{
    Command, MayKeepRunning, RegistrationReply, RegistrationRequest, RequestedStatus,
    SignOnRequest, StatusChangeRequest, StatusUpdate, Task, TaskStatus, WorkerIdentity,
};
pub use error::{CoreError, CoreResult};
