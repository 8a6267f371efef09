use serde::Serialize;
use serde_json::Value;

use cadastro_core::{BatchEntry, ProviderSnapshot, RegistryKey, Settings, WorkQueue};

use crate::cli::{BatchArgs, ShowArgs};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct ProviderEntry {
    id: &'static str,
    enabled: bool,
    requests_per_minute: u32,
    limiter: Option<ProviderSnapshot>,
}

#[derive(Debug, Serialize)]
struct ProvidersResponseData {
    total_requests_per_minute: u32,
    pacing_interval_ms: u64,
    providers: Vec<ProviderEntry>,
}

pub fn status(queue: &WorkQueue) -> Result<Value, CliError> {
    Ok(serde_json::to_value(queue.get_queue_status()?)?)
}

pub fn batch(args: &BatchArgs, queue: &WorkQueue) -> Result<Value, CliError> {
    Ok(serde_json::to_value(queue.batch_status(&args.keys)?)?)
}

pub fn show(args: &ShowArgs, queue: &WorkQueue) -> Result<Value, CliError> {
    let key = RegistryKey::parse(&args.key)?;
    let entry: Option<BatchEntry> = queue
        .batch_status([key.as_str()])?
        .entries
        .into_iter()
        .next();
    match entry {
        Some(entry) => Ok(serde_json::to_value(entry)?),
        None => Err(CliError::Usage(format!("no status available for {key}"))),
    }
}

pub fn providers(settings: &Settings, queue: &WorkQueue) -> Result<Value, CliError> {
    let dispatch = queue.dispatch();
    let snapshots = dispatch.limiter().status();
    let providers = settings
        .providers
        .iter()
        .map(|provider| ProviderEntry {
            id: provider.id.as_str(),
            enabled: provider.enabled,
            requests_per_minute: provider.requests_per_minute,
            limiter: snapshots
                .iter()
                .find(|snapshot| snapshot.name == provider.id.as_str())
                .cloned(),
        })
        .collect();

    Ok(serde_json::to_value(ProvidersResponseData {
        total_requests_per_minute: dispatch.total_requests_per_minute(),
        pacing_interval_ms: dispatch.pacing_interval().as_millis() as u64,
        providers,
    })?)
}
