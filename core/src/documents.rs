//! JSON documents exchanged with the manager.
//!
//! These mirror the manager's HTTP surface: tasks handed out by `POST /task`,
//! status updates pushed to `POST /tasks/{id}/update`, and the small control
//! documents for state changes and the may-i-run check. Unknown fields are
//! ignored so the worker keeps working against newer managers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of work assigned by the manager.
///
/// Immutable once received; the worker executes its commands strictly in
/// order and never holds more than one active task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "_id")]
    pub id: String,

    /// Job this task belongs to, informational only.
    #[serde(default)]
    pub job: String,

    /// Capability tag the manager used to route this task to us.
    pub task_type: String,

    pub commands: Vec<Command>,
}

/// One executable step within a task: a registered command name plus its
/// settings mapping. Opaque to everything except the matching executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub name: String,

    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// Task status as reported to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// The worker has accepted the task and is executing it.
    Active,
    /// All commands finished with exit status zero.
    Completed,
    /// A command failed; remaining commands were skipped.
    Failed,
    /// Execution was cut short by a sleep/shutdown transition.
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress report for a task.
///
/// Produced by the task runner, persisted by the update queue, delivered by
/// the dispatcher. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub task_id: String,

    pub received_at: DateTime<Utc>,

    /// Human-readable description of what the task is doing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub activity: Option<String>,

    /// Index of the command the activity refers to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_command_idx: Option<usize>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub log_lines: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task_status: Option<TaskStatus>,
}

impl StatusUpdate {
    /// An activity-only update (command boundary or status description).
    pub fn activity(task_id: &str, activity: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            received_at: Utc::now(),
            activity: Some(activity.into()),
            current_command_idx: None,
            log_lines: Vec::new(),
            task_status: None,
        }
    }

    /// A log-lines-only update.
    pub fn logs(task_id: &str, log_lines: Vec<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            received_at: Utc::now(),
            activity: None,
            current_command_idx: None,
            log_lines,
            task_status: None,
        }
    }

    /// An update carrying a task status change.
    pub fn status(task_id: &str, status: TaskStatus, activity: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            received_at: Utc::now(),
            activity: Some(activity.into()),
            current_command_idx: None,
            log_lines: Vec::new(),
            task_status: Some(status),
        }
    }

    pub fn with_command_idx(mut self, idx: usize) -> Self {
        self.current_command_idx = Some(idx);
        self
    }

    pub fn with_log_lines(mut self, log_lines: Vec<String>) -> Self {
        self.log_lines = log_lines;
        self
    }

    /// Whether this update finishes the task.
    pub fn is_terminal(&self) -> bool {
        self.task_status.map(TaskStatus::is_terminal).unwrap_or(false)
    }
}

/// Credential pair established by registration.
///
/// Created once, read on every authenticated call, rewritten only by an
/// explicit re-registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub worker_secret: String,
}

/// Body for `POST /register-worker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Secret generated by the worker; the manager stores it and expects it
    /// as the password on every authenticated call.
    pub secret: String,
    pub platform: String,
    pub supported_task_types: Vec<String>,
    pub nickname: String,
}

/// Reply from `POST /register-worker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationReply {
    #[serde(rename = "_id")]
    pub id: String,
}

/// Body for `POST /sign-on`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignOnRequest {
    pub supported_task_types: Vec<String>,
    pub nickname: String,
}

/// Worker state the manager may request via a 423 fetch reply, a
/// `/status-change` poll, or a may-i-run denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestedStatus {
    Awake,
    Asleep,
    Shutdown,
}

/// Reply from `POST /task` when the manager wants a state change instead of
/// handing out work, and from `GET /status-change` while asleep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeRequest {
    pub status_requested: RequestedStatus,
}

/// Reply from `GET /may-i-run/{task_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MayKeepRunning {
    pub may_keep_running: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status_requested: Option<RequestedStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_deserialize_ignores_unknown_fields() {
        let task: Task = serde_json::from_str(
            r#"{
                "_id": "task-1",
                "job": "job-7",
                "task_type": "exec",
                "priority": 50,
                "commands": [
                    {"name": "echo", "settings": {"message": "hi"}},
                    {"name": "sleep"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(task.id, "task-1");
        assert_eq!(task.job, "job-7");
        assert_eq!(task.commands.len(), 2);
        assert_eq!(task.commands[0].name, "echo");
        assert_eq!(
            task.commands[0].settings.get("message"),
            Some(&serde_json::json!("hi"))
        );
        assert!(task.commands[1].settings.is_empty());
    }

    #[test]
    fn test_task_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::Aborted).unwrap(),
            "\"aborted\""
        );
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Active.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_status_update_skips_empty_fields() {
        let update = StatusUpdate::activity("task-1", "running echo").with_command_idx(0);
        let value = serde_json::to_value(&update).unwrap();

        assert_eq!(value["activity"], "running echo");
        assert_eq!(value["current_command_idx"], 0);
        assert!(value.get("log_lines").is_none());
        assert!(value.get("task_status").is_none());
    }

    #[test]
    fn test_status_update_terminal() {
        let terminal = StatusUpdate::status("task-1", TaskStatus::Failed, "Task failed");
        assert!(terminal.is_terminal());

        let active = StatusUpdate::status("task-1", TaskStatus::Active, "Task assigned");
        assert!(!active.is_terminal());

        let logs = StatusUpdate::logs("task-1", vec!["line".to_string()]);
        assert!(!logs.is_terminal());
    }

    #[test]
    fn test_status_change_request_roundtrip() {
        let req: StatusChangeRequest =
            serde_json::from_str(r#"{"status_requested": "asleep"}"#).unwrap();
        assert_eq!(req.status_requested, RequestedStatus::Asleep);

        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"status_requested":"asleep"}"#);
    }

    #[test]
    fn test_may_keep_running_defaults() {
        let reply: MayKeepRunning = serde_json::from_str(r#"{"may_keep_running": true}"#).unwrap();
        assert!(reply.may_keep_running);
        assert!(reply.reason.is_none());
        assert!(reply.status_requested.is_none());
    }
}
