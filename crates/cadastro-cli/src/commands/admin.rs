use serde::Serialize;
use serde_json::Value;

use cadastro_core::WorkQueue;
use cadastro_store::{UnknownStatus, WorkStatus};

use crate::cli::{FixStatusArgs, ResetArgs, WaitArgs};
use crate::error::CliError;

use super::{settle, WaitSummary};

#[derive(Debug, Serialize)]
struct RestartResponseData {
    loaded: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait: Option<WaitSummary>,
}

#[derive(Debug, Serialize)]
struct ResetResponseData {
    status: WorkStatus,
    reset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait: Option<WaitSummary>,
}

#[derive(Debug, Serialize)]
struct CleanupResponseData {
    removed: u64,
}

pub async fn restart(args: &WaitArgs, queue: &WorkQueue) -> Result<Value, CliError> {
    let loaded = queue.restart_processing()?;
    let wait = settle(queue, args).await?;
    Ok(serde_json::to_value(RestartResponseData { loaded, wait })?)
}

pub async fn reset(args: &ResetArgs, queue: &WorkQueue) -> Result<Value, CliError> {
    let status: WorkStatus = args
        .status
        .parse()
        .map_err(|error: UnknownStatus| CliError::Usage(error.to_string()))?;
    let reset = queue.reset_items(status)?;
    let wait = settle(queue, &args.wait).await?;
    Ok(serde_json::to_value(ResetResponseData {
        status,
        reset,
        wait,
    })?)
}

pub fn cleanup_duplicates(queue: &WorkQueue) -> Result<Value, CliError> {
    let removed = queue.cleanup_duplicates()?;
    Ok(serde_json::to_value(CleanupResponseData { removed })?)
}

pub fn fix_status(args: &FixStatusArgs, queue: &WorkQueue) -> Result<Value, CliError> {
    Ok(serde_json::to_value(queue.fix_incomplete_status(args.dry_run)?)?)
}
