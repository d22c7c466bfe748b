//! Runtime configuration for the worker.

use std::path::PathBuf;
use std::time::Duration;

use farmhand_core::RetryPolicy;

/// Configuration for the worker runtime.
///
/// Durations deliberately default to farm-scale values; tests shrink them.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Task types this worker accepts; sent at registration and sign-on.
    pub task_types: Vec<String>,

    /// Path of the durable update-queue database.
    pub queue_db: PathBuf,

    /// Path of the stored credential pair.
    pub credentials_file: PathBuf,

    /// Per-call HTTP timeout. Individual calls fail fast; the retry policies
    /// around them never give up.
    pub request_timeout: Duration,

    /// Delay between retries when fetching a task fails.
    pub fetch_retry: RetryPolicy,

    /// Delay between retries when delivering an update fails.
    pub dispatch_retry: RetryPolicy,

    /// Wait after the manager reported no work available.
    pub no_work_delay: Duration,

    /// Wait after a task finished before fetching the next one.
    pub task_done_delay: Duration,

    /// How often to poll `/status-change` while asleep.
    pub asleep_poll_interval: Duration,

    /// How often to ask `/may-i-run/{task_id}` for the active task.
    pub may_i_run_interval: Duration,

    /// Stop fetching new tasks while more than this many updates are queued.
    pub queue_size_threshold: i64,

    /// Budget for draining the update queue during shutdown.
    pub drain_timeout: Duration,

    /// Exit after one successfully finished task instead of looping.
    pub single_task: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_types: vec![
                "sleep".to_string(),
                "exec".to_string(),
                "file-management".to_string(),
            ],
            queue_db: PathBuf::from("farmhand-worker.db"),
            credentials_file: PathBuf::from("farmhand-credentials.json"),
            request_timeout: Duration::from_secs(30),
            fetch_retry: RetryPolicy::fixed(Duration::from_secs(10)),
            dispatch_retry: RetryPolicy::fixed(Duration::from_secs(5)),
            no_work_delay: Duration::from_secs(5),
            task_done_delay: Duration::from_secs(3),
            asleep_poll_interval: Duration::from_secs(30),
            may_i_run_interval: Duration::from_secs(5),
            queue_size_threshold: 10,
            drain_timeout: Duration::from_secs(10),
            single_task: false,
        }
    }
}
