use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use cadastro_core::WorkQueue;

use crate::cli::RunArgs;
use crate::error::CliError;

use super::{wait_until_idle, WaitSummary};

/// Upper bound for `run --until-idle`.
const UNTIL_IDLE_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Serialize)]
struct RunResponseData {
    loaded: usize,
    #[serde(flatten)]
    summary: WaitSummary,
    interrupted: bool,
}

pub async fn run(args: &RunArgs, queue: &WorkQueue) -> Result<Value, CliError> {
    let loaded = queue.load_pending()?;
    info!(loaded, until_idle = args.until_idle, "processing pending work");

    let (summary, interrupted) = if args.until_idle {
        (wait_until_idle(queue, UNTIL_IDLE_LIMIT).await?, false)
    } else {
        serve(queue).await?;
        let counts = queue.get_queue_status()?.counts;
        (WaitSummary { idle: false, counts }, true)
    };

    Ok(serde_json::to_value(RunResponseData {
        loaded,
        summary,
        interrupted,
    })?)
}

/// Reload the store every cleanup interval so rate-limited keys are retried once their
/// cooldown has passed, until Ctrl-C.
async fn serve(queue: &WorkQueue) -> Result<(), CliError> {
    let period = queue.settings().cleanup_interval.max(Duration::from_secs(1));
    let mut reload = tokio::time::interval(period);
    reload.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("interrupt received, stopping");
                return Ok(());
            }
            _ = reload.tick() => match queue.load_pending() {
                Ok(0) => {}
                Ok(reloaded) => info!(reloaded, "pending work reloaded"),
                Err(error) => warn!(error = %error, "periodic reload failed"),
            },
        }
    }
}
