use serde::Serialize;
use serde_json::Value;
use tracing::info;

use cadastro_core::{EnqueueReport, WorkQueue};

use crate::cli::EnqueueArgs;
use crate::error::CliError;
use crate::keys;

use super::{settle, WaitSummary};

#[derive(Debug, Serialize)]
struct EnqueueResponseData {
    report: EnqueueReport,
    /// Non-empty cells of `--file` that were not registry keys.
    file_skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait: Option<WaitSummary>,
}

pub async fn run(args: &EnqueueArgs, queue: &WorkQueue) -> Result<Value, CliError> {
    let mut keys = args.keys.clone();
    let mut file_skipped = 0;
    if let Some(path) = &args.file {
        let file = keys::load(path)?;
        info!(
            path = %path.display(),
            keys = file.keys.len(),
            skipped = file.skipped,
            "key file read"
        );
        file_skipped = file.skipped;
        keys.extend(file.keys);
    }
    if keys.is_empty() {
        return Err(CliError::Usage(String::from(
            "no registry keys given; pass KEY arguments or --file",
        )));
    }

    let report = queue.enqueue(&keys);
    let wait = settle(queue, &args.wait).await?;
    Ok(serde_json::to_value(EnqueueResponseData {
        report,
        file_skipped,
        wait,
    })?)
}
