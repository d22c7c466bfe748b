//! Task runner: executes one task's commands in order.
//!
//! The runner owns the sequencing rules: one activity update per command
//! boundary, captured output flushed as log updates, a single terminal update
//! last, a failing command stops the task, and an externally requested abort
//! terminates the current command's process tree and skips the rest. Every
//! update goes through an [`UpdateSink`] (the durable queue in production, a
//! recording sink in tests) and is therefore delivered in exactly the order
//! produced here.

pub mod commands;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use farmhand_core::{StatusUpdate, Task, TaskStatus};
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, warn};

use crate::error::{Result, WorkerError};
use crate::queue::UpdateQueue;

/// Buffered log lines are flushed once this many accumulate.
const LOG_FLUSH_MAX_LINES: usize = 50;

/// How many trailing output lines a failed command keeps for its final
/// update.
const FAILURE_TAIL_LINES: usize = 25;

/// How a task run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
    Aborted,
}

impl TerminalStatus {
    pub fn as_task_status(self) -> TaskStatus {
        match self {
            TerminalStatus::Completed => TaskStatus::Completed,
            TerminalStatus::Failed => TaskStatus::Failed,
            TerminalStatus::Aborted => TaskStatus::Aborted,
        }
    }
}

/// Destination for status updates produced while running a task.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    /// Hand an update over for (eventual) delivery. Returning an error means
    /// the update could not be made durable, which is fatal to the worker.
    async fn push(&self, update: StatusUpdate) -> Result<()>;
}

#[async_trait]
impl UpdateSink for UpdateQueue {
    async fn push(&self, update: StatusUpdate) -> Result<()> {
        self.enqueue(&update).await.map(|_| ())
    }
}

/// Abort handle for one task execution.
///
/// `abort` yields a regular `aborted` terminal update; `abort_silently` is
/// for manager-initiated stops (may-i-run denial) where the manager already
/// re-queued the task and a terminal status from us would fight it.
#[derive(Debug, Default)]
pub struct TaskControl {
    cancel: CancellationToken,
    silent: AtomicBool,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn abort_silently(&self) {
        self.silent.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_silent(&self) -> bool {
        self.silent.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Per-command execution context handed to [`CommandExecutor`]s.
///
/// Collects output lines, flushing them in batches, and exposes the abort
/// token. Executors must observe the token at their own await points; in
/// particular a subprocess-running executor is responsible for killing its
/// process group when the token fires.
pub struct CommandContext {
    task_id: String,
    command_idx: usize,
    control: Arc<TaskControl>,
    sink: Arc<dyn UpdateSink>,
    buffer: Mutex<Vec<String>>,
    tail: Mutex<VecDeque<String>>,
}

impl CommandContext {
    fn new(
        task_id: &str,
        command_idx: usize,
        control: Arc<TaskControl>,
        sink: Arc<dyn UpdateSink>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            command_idx,
            control,
            sink,
            buffer: Mutex::new(Vec::new()),
            tail: Mutex::new(VecDeque::with_capacity(FAILURE_TAIL_LINES)),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn command_idx(&self) -> usize {
        self.command_idx
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.control.cancelled()
    }

    /// Record one output/log line, flushing the batch when it grows large.
    pub async fn log(&self, line: impl Into<String>) -> Result<()> {
        let line = line.into();
        {
            let mut tail = self.tail.lock().await;
            if tail.len() == FAILURE_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }

        let flush = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(line);
            buffer.len() >= LOG_FLUSH_MAX_LINES
        };
        if flush {
            self.flush_logs().await?;
        }
        Ok(())
    }

    /// Push all buffered log lines as one update.
    pub async fn flush_logs(&self) -> Result<()> {
        let lines = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        if lines.is_empty() {
            return Ok(());
        }
        self.sink
            .push(StatusUpdate::logs(&self.task_id, lines))
            .await
    }

    /// The last lines this command produced, for failure reporting.
    async fn output_tail(&self) -> Vec<String> {
        self.tail.lock().await.iter().cloned().collect()
    }
}

/// Capability interface for one command type.
///
/// Implementations must be cancel-aware: when `ctx.cancelled()` fires they
/// stop what they are doing (killing any spawned process group) and return
/// [`WorkerError::AbortRequested`].
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// The wire name this executor handles.
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        ctx: &CommandContext,
        settings: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;
}

/// Closed registry of command executors, extensible by registration.
pub struct CommandRegistry {
    executors: HashMap<&'static str, Arc<dyn CommandExecutor>>,
}

impl CommandRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry with all built-in executors.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(commands::EchoCommand));
        registry.register(Arc::new(commands::SleepCommand));
        registry.register(Arc::new(commands::ExecCommand));
        registry.register(Arc::new(commands::CopyFileCommand));
        registry.register(Arc::new(commands::MoveOutOfWayCommand));
        registry.register(Arc::new(commands::MoveToFinalCommand));
        registry.register(Arc::new(commands::RemoveFileCommand));
        registry.register(Arc::new(commands::RemoveTreeCommand));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn CommandExecutor>) {
        self.executors.insert(executor.name(), executor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandExecutor>> {
        self.executors.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.executors.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Runs one task at a time. The worker loop guarantees no overlap; the
/// runner guarantees ordering and exactly one terminal update per run.
pub struct TaskRunner {
    registry: Arc<CommandRegistry>,
    sink: Arc<dyn UpdateSink>,
}

impl TaskRunner {
    pub fn new(registry: Arc<CommandRegistry>, sink: Arc<dyn UpdateSink>) -> Self {
        Self { registry, sink }
    }

    /// Execute the task's commands in order.
    ///
    /// Only storage failures surface as errors; command failures and aborts
    /// are regular outcomes carried in the returned [`TerminalStatus`].
    pub async fn run(&self, task: &Task, control: Arc<TaskControl>) -> Result<TerminalStatus> {
        for (idx, command) in task.commands.iter().enumerate() {
            if control.is_cancelled() {
                return self.finish_aborted(task, &control).await;
            }

            let Some(executor) = self.registry.get(&command.name) else {
                warn!(task_id = %task.id, command = %command.name, "unknown command");
                return self
                    .finish_failed(
                        task,
                        idx,
                        format!("unknown command {:?}", command.name),
                        Vec::new(),
                    )
                    .await;
            };

            self.sink
                .push(
                    StatusUpdate::activity(&task.id, format!("running {}", command.name))
                        .with_command_idx(idx),
                )
                .await?;

            let ctx = CommandContext::new(&task.id, idx, control.clone(), self.sink.clone());
            let outcome = executor.execute(&ctx, &command.settings).await;
            ctx.flush_logs().await?;

            match outcome {
                Ok(()) => {}
                Err(WorkerError::AbortRequested) => {
                    return self.finish_aborted(task, &control).await;
                }
                Err(WorkerError::CommandExecution(reason)) => {
                    let tail = ctx.output_tail().await;
                    return self.finish_failed(task, idx, reason, tail).await;
                }
                Err(other) => return Err(other),
            }
        }

        info!(task_id = %task.id, "task completed");
        self.sink
            .push(StatusUpdate::status(
                &task.id,
                TaskStatus::Completed,
                "Task completed",
            ))
            .await?;
        Ok(TerminalStatus::Completed)
    }

    async fn finish_failed(
        &self,
        task: &Task,
        command_idx: usize,
        reason: String,
        tail: Vec<String>,
    ) -> Result<TerminalStatus> {
        warn!(task_id = %task.id, command_idx, %reason, "task failed");
        self.sink
            .push(
                StatusUpdate::status(&task.id, TaskStatus::Failed, reason)
                    .with_command_idx(command_idx)
                    .with_log_lines(tail),
            )
            .await?;
        Ok(TerminalStatus::Failed)
    }

    async fn finish_aborted(
        &self,
        task: &Task,
        control: &TaskControl,
    ) -> Result<TerminalStatus> {
        if control.is_silent() {
            info!(task_id = %task.id, "task aborted on manager's request, not reporting a status");
        } else {
            self.sink
                .push(StatusUpdate::status(
                    &task.id,
                    TaskStatus::Aborted,
                    "Task was aborted",
                ))
                .await?;
        }
        Ok(TerminalStatus::Aborted)
    }
}
