use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use farmhand_core::ManagerClient;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use farmhand_worker::runner::CommandRegistry;
use farmhand_worker::state::{StateHandle, WorkerState};
use farmhand_worker::worker::ActiveTask;
use farmhand_worker::{
    discovery, IdentityStore, MayIRun, UpdateDispatcher, UpdateQueue, Worker, WorkerConfig,
};

/// Render-farm worker agent.
#[derive(Parser)]
#[command(name = "farmhand-worker", about = "farmhand render-farm worker", version)]
struct Cli {
    /// Manager base URL. Discovered via UDP multicast when omitted.
    #[arg(long)]
    manager: Option<String>,

    /// Path of the durable update-queue database.
    #[arg(long, default_value = "farmhand-worker.db")]
    queue_db: PathBuf,

    /// Path of the stored worker credentials.
    #[arg(long, default_value = "farmhand-credentials.json")]
    credentials: PathBuf,

    /// Task types this worker accepts.
    #[arg(long, value_delimiter = ',', default_value = "sleep,exec,file-management")]
    task_types: Vec<String>,

    /// Run a single task, then exit.
    #[arg(short = '1', long)]
    single: bool,

    /// Discard stored credentials and register as a new worker.
    #[arg(long)]
    reregister: bool,

    /// Enable debug logging for the worker's own log entries.
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "info,farmhand_worker=debug,farmhand_core=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting farmhand worker");

    let config = WorkerConfig {
        task_types: cli.task_types.clone(),
        queue_db: cli.queue_db.clone(),
        credentials_file: cli.credentials.clone(),
        single_task: cli.single,
        ..WorkerConfig::default()
    };

    let manager_url = match &cli.manager {
        Some(url) => url.clone(),
        None => discovery::discover_manager(Duration::from_secs(1)).await?,
    };
    info!(%manager_url, "using manager");

    let client = ManagerClient::new(&manager_url, config.request_timeout)?;
    let queue = Arc::new(UpdateQueue::open(&config.queue_db).await?);
    let state = Arc::new(StateHandle::new(WorkerState::Awake));
    let active = Arc::new(ActiveTask::default());

    #[cfg(unix)]
    farmhand_worker::signals::install(state.clone())?;

    let identity_store = IdentityStore::new(&config.credentials_file);
    let registry = Arc::new(CommandRegistry::builtin());
    info!(commands = ?registry.names(), task_types = ?config.task_types, "worker capabilities");
    let mut worker = Worker::new(
        client.clone(),
        queue.clone(),
        registry,
        state.clone(),
        identity_store,
        active.clone(),
        config.clone(),
    );

    // No identity, no worker: a failure here ends the process visibly.
    worker.startup(cli.reregister).await?;

    let dispatch_cancel = CancellationToken::new();
    let dispatcher = UpdateDispatcher::new(queue.clone(), client.clone(), config.dispatch_retry.clone());
    let mut dispatch_handle = tokio::spawn(dispatcher.run(dispatch_cancel.clone()));

    let mir_cancel = CancellationToken::new();
    let mir = MayIRun::new(
        client.clone(),
        state.clone(),
        active.clone(),
        config.may_i_run_interval,
    );
    let mir_handle = tokio::spawn(mir.run(mir_cancel.clone()));

    let result = tokio::select! {
        result = worker.run() => result,
        dispatch = &mut dispatch_handle => match dispatch {
            // The dispatcher only ends early when durable storage failed,
            // which voids the no-update-lost guarantee.
            Ok(Err(err)) => {
                error!(%err, "update dispatcher failed");
                Err(err)
            }
            Ok(Ok(())) => Ok(()),
            Err(join_err) => {
                error!(%join_err, "update dispatcher panicked");
                Err(farmhand_worker::WorkerError::Storage(format!(
                    "update dispatcher panicked: {join_err}"
                )))
            }
        },
    };

    mir_cancel.cancel();
    dispatch_cancel.cancel();
    let _ = mir_handle.await;
    if !dispatch_handle.is_finished() {
        if let Err(err) = dispatch_handle.await {
            warn!(%err, "update dispatcher did not stop cleanly");
        }
    }

    result?;
    info!("farmhand worker is shut down");
    Ok(())
}
