mod admin;
mod enqueue;
mod inspect;
mod process;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cadastro_core::{Settings, WorkQueue};
use cadastro_store::{DuckDbStore, RecordStore, StatusCounts, StoreConfig};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cli::{Cli, Command, WaitArgs};
use crate::error::CliError;

/// How a command that waited for processing left the queue.
#[derive(Debug, Serialize)]
pub struct WaitSummary {
    pub idle: bool,
    pub counts: StatusCounts,
}

pub async fn run(cli: &Cli) -> Result<Value, CliError> {
    let settings = Settings::from_env()?;
    let store = open_store(cli.db.as_deref())?;
    let queue = WorkQueue::from_settings(store, &settings, cli.offline)?;
    debug!(
        offline = cli.offline,
        providers = ?queue.dispatch().providers().collect::<Vec<_>>(),
        "queue ready"
    );

    let result = match &cli.command {
        Command::Enqueue(args) => enqueue::run(args, &queue).await,
        Command::Run(args) => process::run(args, &queue).await,
        Command::Status => inspect::status(&queue),
        Command::Batch(args) => inspect::batch(args, &queue),
        Command::Show(args) => inspect::show(args, &queue),
        Command::Providers => inspect::providers(&settings, &queue),
        Command::Restart(args) => admin::restart(args, &queue).await,
        Command::Reset(args) => admin::reset(args, &queue).await,
        Command::CleanupDuplicates => admin::cleanup_duplicates(&queue),
        Command::FixStatus(args) => admin::fix_status(args, &queue),
    };

    // Workers already running finish; keys still queued stay in the store for the next run.
    queue.shutdown().await;
    result
}

fn open_store(path: Option<&Path>) -> Result<Arc<dyn RecordStore>, CliError> {
    let config = match path {
        Some(path) => StoreConfig::at_path(path),
        None => StoreConfig::default(),
    };
    Ok(Arc::new(DuckDbStore::open(config)?))
}

/// Block until the queue is idle when `--wait` was given.
async fn settle(queue: &WorkQueue, wait: &WaitArgs) -> Result<Option<WaitSummary>, CliError> {
    if !wait.wait {
        return Ok(None);
    }
    Ok(Some(wait_until_idle(queue, Duration::from_secs(wait.wait_timeout)).await?))
}

async fn wait_until_idle(queue: &WorkQueue, limit: Duration) -> Result<WaitSummary, CliError> {
    let idle = queue.wait_idle(limit).await;
    if !idle {
        warn!(
            timeout_secs = limit.as_secs(),
            "queue still busy when the wait ran out; remaining work stays queued"
        );
    }
    Ok(WaitSummary {
        idle,
        counts: queue.get_queue_status()?.counts,
    })
}
