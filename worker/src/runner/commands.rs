//! Built-in command executors.
//!
//! Each executor handles one wire command name. Settings are deserialized
//! into a typed struct before any side effect, so malformed settings fail the
//! command without touching the filesystem or spawning anything.
//!
//! Subprocess-running commands spawn the child in its own process group; an
//! abort signals the whole group (SIGTERM, a grace period, then SIGKILL) so
//! no orphaned grandchildren survive the task.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{CommandContext, CommandExecutor};
use crate::error::{Result, WorkerError};

type Settings = serde_json::Map<String, serde_json::Value>;

/// Grace period between SIGTERM and SIGKILL when aborting a subprocess.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Missing input files are re-checked this many times...
const MISSING_INPUT_ATTEMPTS: u32 = 3;
/// ...with this delay in between, to ride out shared-storage propagation lag.
const MISSING_INPUT_DELAY: Duration = Duration::from_secs(2);

fn parse_settings<T: serde::de::DeserializeOwned>(name: &str, settings: &Settings) -> Result<T> {
    T::deserialize(serde_json::Value::Object(settings.clone()))
        .map_err(|e| WorkerError::CommandExecution(format!("{name}: invalid settings: {e}")))
}

/// Wait for a required input file to appear.
///
/// Networked storage can lag behind the job that produced the file, so a
/// bounded number of re-checks happens before the miss becomes a command
/// failure.
async fn wait_for_input(ctx: &CommandContext, name: &str, path: &Path) -> Result<()> {
    for attempt in 1..=MISSING_INPUT_ATTEMPTS {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        if attempt < MISSING_INPUT_ATTEMPTS {
            ctx.log(format!(
                "{name}: input {} not there yet, re-checking in {}s",
                path.display(),
                MISSING_INPUT_DELAY.as_secs()
            ))
            .await?;
            tokio::select! {
                _ = tokio::time::sleep(MISSING_INPUT_DELAY) => {}
                _ = ctx.cancelled() => return Err(WorkerError::AbortRequested),
            }
        }
    }
    Err(WorkerError::CommandExecution(format!(
        "{name}: input {} did not appear after {MISSING_INPUT_ATTEMPTS} checks",
        path.display()
    )))
}

/// `echo`: write a message to the task log.
pub struct EchoCommand;

#[derive(Deserialize)]
struct EchoSettings {
    message: String,
}

#[async_trait]
impl CommandExecutor for EchoCommand {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn execute(&self, ctx: &CommandContext, settings: &Settings) -> Result<()> {
        let settings: EchoSettings = parse_settings(self.name(), settings)?;
        ctx.log(settings.message).await
    }
}

/// `sleep`: wait a number of seconds.
pub struct SleepCommand;

#[derive(Deserialize)]
struct SleepSettings {
    time_in_seconds: f64,
}

#[async_trait]
impl CommandExecutor for SleepCommand {
    fn name(&self) -> &'static str {
        "sleep"
    }

    async fn execute(&self, ctx: &CommandContext, settings: &Settings) -> Result<()> {
        let settings: SleepSettings = parse_settings(self.name(), settings)?;
        if !settings.time_in_seconds.is_finite() || settings.time_in_seconds < 0.0 {
            return Err(WorkerError::CommandExecution(format!(
                "sleep: invalid time_in_seconds {}",
                settings.time_in_seconds
            )));
        }

        ctx.log(format!("sleeping for {} seconds", settings.time_in_seconds))
            .await?;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(settings.time_in_seconds)) => Ok(()),
            _ = ctx.cancelled() => Err(WorkerError::AbortRequested),
        }
    }
}

/// `exec`: run an arbitrary command line, streaming its output.
pub struct ExecCommand;

#[derive(Deserialize)]
struct ExecSettings {
    cmd: String,
}

#[async_trait]
impl CommandExecutor for ExecCommand {
    fn name(&self) -> &'static str {
        "exec"
    }

    async fn execute(&self, ctx: &CommandContext, settings: &Settings) -> Result<()> {
        let settings: ExecSettings = parse_settings(self.name(), settings)?;
        let argv = shell_words::split(&settings.cmd)
            .map_err(|e| WorkerError::CommandExecution(format!("exec: unparseable cmd: {e}")))?;
        if argv.is_empty() {
            return Err(WorkerError::CommandExecution(
                "exec: cmd may not be empty".to_string(),
            ));
        }
        run_subprocess(ctx, &argv).await
    }
}

/// Spawn `argv` in its own process group and stream its output into the task
/// log until it exits. Non-zero exit is a command failure; an abort kills the
/// process group.
pub(crate) async fn run_subprocess(ctx: &CommandContext, argv: &[String]) -> Result<()> {
    let cmd_line = shell_words::join(argv);
    info!(cmd = %cmd_line, "executing subprocess");
    ctx.log(format!("executing {cmd_line}")).await?;

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| WorkerError::CommandExecution(format!("could not start {cmd_line}: {e}")))?;
    let pid = child.id().unwrap_or_default();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut stdout_lines = stdout.map(|s| BufReader::new(s).lines());
    let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());

    loop {
        tokio::select! {
            line = next_line(&mut stdout_lines) => {
                match line {
                    Some(line) => ctx.log(format!("pid={pid} > {line}")).await?,
                    None => stdout_lines = None,
                }
            }
            line = next_line(&mut stderr_lines) => {
                match line {
                    Some(line) => ctx.log(format!("pid={pid} > {line}")).await?,
                    None => stderr_lines = None,
                }
            }
            _ = ctx.cancelled() => {
                warn!(pid, "abort requested, terminating subprocess group");
                terminate_group(&mut child, pid).await;
                return Err(WorkerError::AbortRequested);
            }
        }
        if stdout_lines.is_none() && stderr_lines.is_none() {
            break;
        }
    }

    let status = tokio::select! {
        status = child.wait() => status
            .map_err(|e| WorkerError::CommandExecution(format!("waiting for {cmd_line}: {e}")))?,
        _ = ctx.cancelled() => {
            warn!(pid, "abort requested, terminating subprocess group");
            terminate_group(&mut child, pid).await;
            return Err(WorkerError::AbortRequested);
        }
    };

    debug!(pid, code = ?status.code(), "subprocess finished");
    if status.success() {
        Ok(())
    } else {
        Err(WorkerError::CommandExecution(match status.code() {
            Some(code) => format!("{cmd_line} (pid={pid}) exited with status {code}"),
            None => format!("{cmd_line} (pid={pid}) was killed by a signal"),
        }))
    }
}

/// Next line from an optional stream; a read error counts as end-of-stream.
/// An exhausted (`None`) stream never completes, so a `select!` over both
/// output streams only fires for the one still producing.
async fn next_line<R: tokio::io::AsyncBufRead + Unpin>(
    lines: &mut Option<tokio::io::Lines<R>>,
) -> Option<String> {
    match lines {
        Some(source) => source.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// Terminate the child's process group: SIGTERM, wait [`KILL_GRACE`], then
/// SIGKILL. No orphaned grandchildren may remain.
#[cfg(unix)]
async fn terminate_group(child: &mut Child, pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(pid as i32);
    if killpg(pgid, Signal::SIGTERM).is_err() {
        // Group already gone; reap the child if it is still around.
        let _ = child.wait().await;
        return;
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(pid, "process group survived SIGTERM, sending SIGKILL");
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_group(child: &mut Child, _pid: u32) {
    let _ = child.kill().await;
}

/// `copy_file`: copy a file, creating the destination directory.
pub struct CopyFileCommand;

#[derive(Deserialize)]
struct CopyFileSettings {
    src: PathBuf,
    dest: PathBuf,
}

#[async_trait]
impl CommandExecutor for CopyFileCommand {
    fn name(&self) -> &'static str {
        "copy_file"
    }

    async fn execute(&self, ctx: &CommandContext, settings: &Settings) -> Result<()> {
        let settings: CopyFileSettings = parse_settings(self.name(), settings)?;
        wait_for_input(ctx, self.name(), &settings.src).await?;

        if let Some(parent) = settings.dest.parent() {
            if !tokio::fs::try_exists(parent).await.unwrap_or(false) {
                ctx.log(format!(
                    "copy_file: creating directory {}",
                    parent.display()
                ))
                .await?;
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    WorkerError::CommandExecution(format!(
                        "copy_file: creating {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        ctx.log(format!(
            "copy_file: copying {} to {}",
            settings.src.display(),
            settings.dest.display()
        ))
        .await?;
        tokio::fs::copy(&settings.src, &settings.dest)
            .await
            .map_err(|e| {
                WorkerError::CommandExecution(format!(
                    "copy_file: copying {}: {e}",
                    settings.src.display()
                ))
            })?;
        Ok(())
    }
}

/// `move_out_of_way`: move a path aside, stamping it with its mtime.
pub struct MoveOutOfWayCommand;

#[derive(Deserialize)]
struct MoveOutOfWaySettings {
    src: PathBuf,
}

#[async_trait]
impl CommandExecutor for MoveOutOfWayCommand {
    fn name(&self) -> &'static str {
        "move_out_of_way"
    }

    async fn execute(&self, ctx: &CommandContext, settings: &Settings) -> Result<()> {
        let settings: MoveOutOfWaySettings = parse_settings(self.name(), settings)?;
        if !tokio::fs::try_exists(&settings.src).await.unwrap_or(false) {
            ctx.log(format!(
                "move_out_of_way: {} does not exist, nothing to move",
                settings.src.display()
            ))
            .await?;
            return Ok(());
        }

        let mut dest = timestamped_path(&settings.src).await?;
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            dest = unique_path(&dest).await?;
        }

        ctx.log(format!(
            "move_out_of_way: moving {} to {}",
            settings.src.display(),
            dest.display()
        ))
        .await?;
        rename(&settings.src, &dest).await
    }
}

/// `move_to_final`: move output into place, backing up an existing
/// destination first.
pub struct MoveToFinalCommand;

#[derive(Deserialize)]
struct MoveToFinalSettings {
    src: PathBuf,
    dest: PathBuf,
}

#[async_trait]
impl CommandExecutor for MoveToFinalCommand {
    fn name(&self) -> &'static str {
        "move_to_final"
    }

    async fn execute(&self, ctx: &CommandContext, settings: &Settings) -> Result<()> {
        let settings: MoveToFinalSettings = parse_settings(self.name(), settings)?;
        if !tokio::fs::try_exists(&settings.src).await.unwrap_or(false) {
            ctx.log(format!(
                "move_to_final: {} does not exist, not moving",
                settings.src.display()
            ))
            .await?;
            return Ok(());
        }

        if tokio::fs::try_exists(&settings.dest).await.unwrap_or(false) {
            let mut backup = timestamped_path(&settings.dest).await?;
            if tokio::fs::try_exists(&backup).await.unwrap_or(false) {
                backup = unique_path(&backup).await?;
            }
            ctx.log(format!(
                "move_to_final: moving {} to {}",
                settings.dest.display(),
                backup.display()
            ))
            .await?;
            rename(&settings.dest, &backup).await?;
        }

        ctx.log(format!(
            "move_to_final: moving {} to {}",
            settings.src.display(),
            settings.dest.display()
        ))
        .await?;
        rename(&settings.src, &settings.dest).await
    }
}

/// `remove_file`: delete a single file; a missing path is fine.
pub struct RemoveFileCommand;

#[derive(Deserialize)]
struct RemoveFileSettings {
    path: PathBuf,
}

#[async_trait]
impl CommandExecutor for RemoveFileCommand {
    fn name(&self) -> &'static str {
        "remove_file"
    }

    async fn execute(&self, ctx: &CommandContext, settings: &Settings) -> Result<()> {
        let settings: RemoveFileSettings = parse_settings(self.name(), settings)?;
        if !tokio::fs::try_exists(&settings.path).await.unwrap_or(false) {
            ctx.log(format!(
                "remove_file: {} does not exist, nothing to remove",
                settings.path.display()
            ))
            .await?;
            return Ok(());
        }

        let metadata = tokio::fs::metadata(&settings.path).await.map_err(|e| {
            WorkerError::CommandExecution(format!(
                "remove_file: inspecting {}: {e}",
                settings.path.display()
            ))
        })?;
        if metadata.is_dir() {
            return Err(WorkerError::CommandExecution(format!(
                "remove_file: {} is a directory, use remove_tree",
                settings.path.display()
            )));
        }

        ctx.log(format!("remove_file: removing {}", settings.path.display()))
            .await?;
        tokio::fs::remove_file(&settings.path).await.map_err(|e| {
            WorkerError::CommandExecution(format!(
                "remove_file: removing {}: {e}",
                settings.path.display()
            ))
        })
    }
}

/// `remove_tree`: delete a file or a whole directory tree.
pub struct RemoveTreeCommand;

#[derive(Deserialize)]
struct RemoveTreeSettings {
    path: PathBuf,
}

#[async_trait]
impl CommandExecutor for RemoveTreeCommand {
    fn name(&self) -> &'static str {
        "remove_tree"
    }

    async fn execute(&self, ctx: &CommandContext, settings: &Settings) -> Result<()> {
        let settings: RemoveTreeSettings = parse_settings(self.name(), settings)?;
        if !tokio::fs::try_exists(&settings.path).await.unwrap_or(false) {
            ctx.log(format!(
                "remove_tree: {} does not exist, nothing to remove",
                settings.path.display()
            ))
            .await?;
            return Ok(());
        }

        ctx.log(format!(
            "remove_tree: removing tree rooted at {}",
            settings.path.display()
        ))
        .await?;

        let metadata = tokio::fs::metadata(&settings.path).await.map_err(|e| {
            WorkerError::CommandExecution(format!(
                "remove_tree: inspecting {}: {e}",
                settings.path.display()
            ))
        })?;
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&settings.path).await
        } else {
            tokio::fs::remove_file(&settings.path).await
        };
        result.map_err(|e| {
            WorkerError::CommandExecution(format!(
                "remove_tree: removing {}: {e}",
                settings.path.display()
            ))
        })
    }
}

async fn rename(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::rename(from, to).await.map_err(|e| {
        WorkerError::CommandExecution(format!(
            "moving {} to {}: {e}",
            from.display(),
            to.display()
        ))
    })
}

/// `path` with its modification time appended to the name, second precision.
async fn timestamped_path(path: &Path) -> Result<PathBuf> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        WorkerError::CommandExecution(format!("inspecting {}: {e}", path.display()))
    })?;
    let mtime = metadata.modified().map_err(|e| {
        WorkerError::CommandExecution(format!("mtime of {}: {e}", path.display()))
    })?;

    let stamp = chrono::DateTime::<chrono::Local>::from(mtime)
        .format("%Y-%m-%d_%H%M%S")
        .to_string();

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(path.with_file_name(format!("{name}-{stamp}")))
}

/// `path`, or if taken, `path~N` with the smallest unused N.
async fn unique_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    let mut max_nr: u32 = 0;
    let mut entries = tokio::fs::read_dir(parent).await.map_err(|e| {
        WorkerError::CommandExecution(format!("scanning {}: {e}", parent.display()))
    })?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let entry_name = entry.file_name().to_string_lossy().into_owned();
        if let Some(suffix) = entry_name.strip_prefix(&format!("{name}~")) {
            if let Ok(nr) = suffix.parse::<u32>() {
                max_nr = max_nr.max(nr);
            }
        }
    }

    Ok(path.with_file_name(format!("{name}~{}", max_nr + 1)))
}
