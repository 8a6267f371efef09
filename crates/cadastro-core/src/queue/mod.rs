//! Persistent, concurrency-bounded work queue.
//!
//! [`WorkQueue`] is a cheap-to-clone handle on one engine. Keys are written to the
//! [`RecordStore`] first and only then pushed to an in-memory channel, so the store can
//! always rebuild pending work through [`WorkQueue::load_pending`]. A single loop task
//! drains the channel, spacing dispatches by the providers' aggregate pacing interval and
//! handing each key to a worker bounded by a semaphore of `max_concurrent` permits.
//!
//! ```text
//! enqueue ──► store (Queued) ──► channel ──► loop ──► worker ──► dispatch ──► store
//!                                   ▲                                  │
//!                      load_pending ┘◄──── drain with leftovers ◄──────┘
//! ```

mod runtime;
mod worker;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use cadastro_store::{
    EnqueueOutcome, RecordStore, ResultRecord, StatusCounts, StoreError, StuckReport, WorkItem,
    WorkStatus,
};

use crate::dispatch::{DispatchError, DispatchManager};
use crate::limiter::ProviderSnapshot;
use crate::settings::{QueueSettings, Settings};
use crate::{RegistryKey, ValidationError};

use runtime::{shutdown_requested, Runtime};

const RECENT_LIMIT: usize = 10;
const IDLE_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A key that was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedKey {
    pub input: String,
    pub reason: String,
}

/// Per-key result of [`WorkQueue::enqueue`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueReport {
    pub queued: Vec<String>,
    /// Already Queued or Processing.
    pub skipped_active: Vec<String>,
    /// Completed inside the retention window.
    pub skipped_recent: Vec<String>,
    pub rejected: Vec<RejectedKey>,
    /// Valid keys the store could not write.
    pub failed: Vec<RejectedKey>,
}

impl EnqueueReport {
    pub fn accepted(&self) -> usize {
        self.queued.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub counts: StatusCounts,
    pub total: u64,
    pub recent: Vec<WorkItem>,
    pub pending_in_memory: usize,
    pub in_flight: usize,
    pub running: bool,
    pub max_concurrent: usize,
    pub pacing_interval_ms: u64,
    pub providers: Vec<ProviderSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub key: String,
    #[serde(serialize_with = "status_or_unknown")]
    pub status: Option<WorkStatus>,
    pub error_message: Option<String>,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    pub result: Option<ResultRecord>,
}

/// `now - by`, clamped to the Unix epoch.
fn shift_back(now: OffsetDateTime, by: Duration) -> OffsetDateTime {
    time::Duration::try_from(by)
        .ok()
        .and_then(|by| now.checked_sub(by))
        .map_or(OffsetDateTime::UNIX_EPOCH, |at| at.max(OffsetDateTime::UNIX_EPOCH))
}

/// `now + by`, clamped to the last representable instant.
fn shift_forward(now: OffsetDateTime, by: Duration) -> OffsetDateTime {
    time::Duration::try_from(by)
        .ok()
        .and_then(|by| now.checked_add(by))
        .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc())
}

fn status_or_unknown<S: Serializer>(status: &Option<WorkStatus>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(status.map_or("unknown", WorkStatus::as_str))
}

/// Latest status of a set of keys.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub entries: Vec<BatchEntry>,
    pub counts: StatusCounts,
    pub unknown: u64,
    pub invalid: Vec<RejectedKey>,
    /// No key is Queued or Processing.
    pub finished: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixReport {
    pub dry_run: bool,
    pub fixed: usize,
    pub keys: Vec<String>,
}

pub(crate) struct QueueInner {
    store: Arc<dyn RecordStore>,
    dispatch: Arc<DispatchManager>,
    settings: QueueSettings,
    runtime: Runtime,
}

/// Handle on the work queue engine.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    pub fn new(
        store: Arc<dyn RecordStore>,
        dispatch: Arc<DispatchManager>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                runtime: Runtime::new(settings.max_concurrent),
                store,
                dispatch,
                settings,
            }),
        }
    }

    /// Engine over the providers enabled in `settings`.
    pub fn from_settings(
        store: Arc<dyn RecordStore>,
        settings: &Settings,
        offline: bool,
    ) -> Result<Self, DispatchError> {
        let dispatch = DispatchManager::from_settings(settings, offline)?;
        Ok(Self::new(store, Arc::new(dispatch), settings.queue))
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    pub fn dispatch(&self) -> &Arc<DispatchManager> {
        &self.inner.dispatch
    }

    pub fn is_running(&self) -> bool {
        self.inner.runtime.is_running()
    }

    /// Persist a Queued row for each valid key and start the loop.
    ///
    /// Keys that are active, or completed within the retention window, are skipped.
    /// Malformed keys are reported, never raised.
    pub fn enqueue<I, S>(&self, keys: I) -> EnqueueReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let inner = &self.inner;
        let completed_after = shift_back(OffsetDateTime::now_utc(), inner.settings.retention);
        let mut report = EnqueueReport::default();
        let mut seen = HashSet::new();

        for raw in keys {
            let raw = raw.as_ref();
            let key = match RegistryKey::parse(raw) {
                Ok(key) => key,
                Err(error) => {
                    debug!(input = raw, error = %error, "key rejected");
                    report.rejected.push(RejectedKey {
                        input: raw.to_owned(),
                        reason: error.to_string(),
                    });
                    continue;
                }
            };
            if !seen.insert(key.clone()) {
                continue;
            }

            match inner.store.enqueue(key.as_str(), completed_after) {
                Ok(EnqueueOutcome::Queued(item)) => {
                    inner.runtime.push(&item.external_key);
                    report.queued.push(item.external_key);
                }
                Ok(EnqueueOutcome::AlreadyActive(item)) => {
                    if item.status == WorkStatus::Queued {
                        inner.runtime.push(&item.external_key);
                    }
                    report.skipped_active.push(item.external_key);
                }
                Ok(EnqueueOutcome::RecentlyCompleted(item)) => {
                    report.skipped_recent.push(item.external_key);
                }
                Err(error) => {
                    error!(key = %key, error = %error, "could not enqueue key");
                    report.failed.push(RejectedKey {
                        input: key.to_string(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        info!(
            queued = report.queued.len(),
            active = report.skipped_active.len(),
            recent = report.skipped_recent.len(),
            rejected = report.rejected.len(),
            failed = report.failed.len(),
            "enqueue finished"
        );
        if inner.runtime.queued_len() > 0 {
            inner.ensure_running();
        }
        report
    }

    /// Rebuild the in-memory queue from the store and start the loop.
    ///
    /// Runs [`Self::cleanup_stuck`] first. Processing rows not owned by a live worker and
    /// RateLimited rows whose retry time has passed are put back to Queued. Returns the
    /// number of keys pushed.
    pub fn load_pending(&self) -> Result<usize, QueueError> {
        self.inner.load_pending()
    }

    /// Reclassify Processing rows older than the stuck threshold. Runs at most once per
    /// cleanup interval; returns `None` when skipped.
    pub fn cleanup_stuck(&self) -> Result<Option<StuckReport>, QueueError> {
        self.inner.cleanup_stuck()
    }

    /// Process one key right away, outside the loop and its concurrency bound.
    pub async fn process_one(&self, key: &str) -> Result<Option<WorkStatus>, QueueError> {
        let key = RegistryKey::parse(key)?;
        self.inner.process_one(key.as_str()).await
    }

    pub fn get_queue_status(&self) -> Result<QueueStatus, QueueError> {
        let inner = &self.inner;
        let counts = inner.store.status_counts()?;
        Ok(QueueStatus {
            total: counts.total(),
            counts,
            recent: inner.store.recent_items(RECENT_LIMIT)?,
            pending_in_memory: inner.runtime.queued_len(),
            in_flight: inner.runtime.in_flight_len(),
            running: inner.runtime.is_running(),
            max_concurrent: inner.settings.max_concurrent,
            pacing_interval_ms: inner.dispatch.pacing_interval().as_millis() as u64,
            providers: inner.dispatch.limiter().status(),
        })
    }

    pub fn restart_processing(&self) -> Result<usize, QueueError> {
        info!("processing restart requested");
        self.load_pending()
    }

    /// Put every row with `status` back to Queued and reload. Only Processing, Error and
    /// RateLimited rows can be reset.
    pub fn reset_items(&self, status: WorkStatus) -> Result<u64, QueueError> {
        if !matches!(
            status,
            WorkStatus::Processing | WorkStatus::Error | WorkStatus::RateLimited
        ) {
            return Err(ValidationError::InvalidResetStatus {
                value: status.to_string(),
            }
            .into());
        }

        let reset = self.inner.store.reset_status(status)?;
        info!(status = %status, reset, "work items reset");
        if reset > 0 {
            self.load_pending()?;
        }
        Ok(reset)
    }

    /// Keep only the most recently updated row per key.
    pub fn cleanup_duplicates(&self) -> Result<u64, QueueError> {
        let removed = self.inner.store.remove_duplicates()?;
        info!(removed, "duplicate work items removed");
        Ok(removed)
    }

    pub fn batch_status<I, S>(&self, keys: I) -> Result<BatchStatus, QueueError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let store = &self.inner.store;
        let mut entries = Vec::new();
        let mut invalid = Vec::new();
        let mut counts = StatusCounts::default();
        let mut unknown = 0_u64;
        let mut seen = HashSet::new();

        for raw in keys {
            let raw = raw.as_ref();
            let key = match RegistryKey::parse(raw) {
                Ok(key) => key,
                Err(error) => {
                    invalid.push(RejectedKey {
                        input: raw.to_owned(),
                        reason: error.to_string(),
                    });
                    continue;
                }
            };
            if !seen.insert(key.clone()) {
                continue;
            }

            let entry = match store.latest_item(key.as_str())? {
                Some(item) => {
                    counts.add(item.status, 1);
                    let result = if item.status == WorkStatus::Completed {
                        store.find_result(key.as_str())?
                    } else {
                        None
                    };
                    BatchEntry {
                        key: item.external_key,
                        status: Some(item.status),
                        error_message: item.error_message,
                        attempts: item.attempts,
                        updated_at: Some(item.updated_at),
                        result,
                    }
                }
                None => {
                    unknown += 1;
                    BatchEntry {
                        key: key.to_string(),
                        status: None,
                        error_message: None,
                        attempts: 0,
                        updated_at: None,
                        result: None,
                    }
                }
            };
            entries.push(entry);
        }

        Ok(BatchStatus {
            finished: counts.queued == 0 && counts.processing == 0,
            entries,
            counts,
            unknown,
            invalid,
        })
    }

    pub fn result(&self, key: &str) -> Result<Option<ResultRecord>, QueueError> {
        let key = RegistryKey::parse(key)?;
        Ok(self.inner.store.find_result(key.as_str())?)
    }

    /// Mark Error and RateLimited rows Completed when their key already has a result.
    pub fn fix_incomplete_status(&self, dry_run: bool) -> Result<FixReport, QueueError> {
        let items = self.inner.store.complete_resolved(dry_run)?;
        let keys: Vec<String> = items.into_iter().map(|item| item.external_key).collect();
        info!(dry_run, fixed = keys.len(), "incomplete statuses checked");
        Ok(FixReport {
            dry_run,
            fixed: keys.len(),
            keys,
        })
    }

    /// Stop the loop and wait for every running worker. Unprocessed keys stay Queued in the
    /// store. The engine does not restart afterwards.
    pub async fn shutdown(&self) {
        let runtime = &self.inner.runtime;
        runtime.signal_shutdown();
        if let Some(handle) = runtime.take_loop_handle() {
            if let Err(join_error) = handle.await {
                error!(error = %join_error, "queue loop panicked");
            }
        }
        runtime.join_workers().await;
        runtime.stop();
        info!("queue shut down");
    }

    /// Wait until nothing is queued, in flight, or about to be reloaded.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.runtime.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(IDLE_POLL.min(deadline - now)).await;
        }
    }
}

impl QueueInner {
    fn ensure_running(self: &Arc<Self>) {
        if !self.runtime.try_start() {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                let task = handle.spawn(async move { inner.process_loop().await });
                self.runtime.set_loop_handle(task);
            }
            Err(_) => {
                self.runtime.stop();
                warn!("no async runtime available; pending work stays queued in the store");
            }
        }
    }

    fn load_pending(self: &Arc<Self>) -> Result<usize, QueueError> {
        if let Some(report) = self.cleanup_stuck()? {
            debug!(errored = report.errored, rate_limited = report.rate_limited, "stuck sweep done");
        }

        let items = self.store.pending_items(OffsetDateTime::now_utc())?;
        let found = items.len();
        let mut seen = HashSet::new();
        let mut requeue = Vec::new();
        let mut keys = Vec::new();
        for item in items {
            if self.runtime.is_in_flight(&item.external_key) {
                continue;
            }
            if item.status != WorkStatus::Queued {
                requeue.push(item.id);
            }
            if seen.insert(item.external_key.clone()) {
                keys.push(item.external_key);
            }
        }

        let requeued = self.store.requeue(&requeue)?;
        let pushed = keys.iter().filter(|key| self.runtime.push(key)).count();
        info!(found, requeued, pushed, "pending work loaded");

        if self.runtime.queued_len() > 0 {
            self.ensure_running();
        }
        Ok(pushed)
    }

    fn cleanup_stuck(&self) -> Result<Option<StuckReport>, QueueError> {
        if !self.runtime.cleanup_due(self.settings.cleanup_interval) {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        let report = self.store.reclassify_stuck(
            shift_back(now, self.settings.stuck_after),
            shift_forward(now, self.settings.rate_limit_retry_delay),
        )?;
        if report.total() > 0 {
            warn!(
                errored = report.errored,
                rate_limited = report.rate_limited,
                "stuck work items reclassified"
            );
        }
        Ok(Some(report))
    }

    async fn process_loop(self: Arc<Self>) {
        info!(
            max_concurrent = self.settings.max_concurrent,
            pacing_ms = self.dispatch.pacing_interval().as_millis() as u64,
            "queue loop started"
        );
        let mut shutdown = self.runtime.shutdown_signal();
        let mut receiver = self.runtime.receiver().lock().await;

        loop {
            if self.runtime.is_shut_down() {
                break;
            }

            let throttled = match self.store.count_by_status(WorkStatus::Processing) {
                Ok(processing) if processing >= self.settings.max_concurrent as u64 => {
                    debug!(processing, "processing limit reached, throttling");
                    if let Err(error) = self.cleanup_stuck() {
                        warn!(error = %error, "stuck sweep failed");
                    }
                    true
                }
                Ok(_) => false,
                Err(error) => {
                    warn!(error = %error, "could not count processing rows");
                    true
                }
            };
            if throttled {
                if self.pause(self.settings.throttle_poll, &mut shutdown).await {
                    break;
                }
                continue;
            }

            let wait = self.runtime.dispatch_wait(self.dispatch.pacing_interval());
            if !wait.is_zero() && self.pause(wait, &mut shutdown).await {
                break;
            }

            let received = tokio::select! {
                received = tokio::time::timeout(self.settings.dequeue_timeout, receiver.recv()) => received,
                () = shutdown_requested(&mut shutdown) => break,
            };
            let key = match received {
                Ok(Some(key)) => key,
                Ok(None) => break,
                Err(_) => {
                    if self.runtime.queued_len() > 0 {
                        continue;
                    }
                    self.schedule_relaunch();
                    if self.runtime.stop_or_resume() {
                        continue;
                    }
                    info!("queue drained");
                    return;
                }
            };

            if !self.runtime.take(&key) {
                debug!(key = %key, "key already owned by a worker");
                continue;
            }

            let permit = tokio::select! {
                permit = self.runtime.semaphore().acquire_owned() => permit,
                () = shutdown_requested(&mut shutdown) => {
                    self.runtime.release(&key);
                    break;
                }
            };
            let Ok(permit) = permit else {
                self.runtime.release(&key);
                break;
            };

            self.runtime.record_dispatch();
            let inner = Arc::clone(&self);
            self.runtime.spawn_worker(permit, async move {
                match inner.process_one(&key).await {
                    Ok(Some(status)) => debug!(key = %key, status = %status, "worker finished"),
                    Ok(None) => {}
                    Err(error) => error!(key = %key, error = %error, "worker failed"),
                }
                inner.runtime.release(&key);
            });
        }

        self.runtime.stop();
        info!("queue loop stopped");
    }

    /// When the store still has pending rows nobody is working on, reload them after the
    /// relaunch delay.
    fn schedule_relaunch(self: &Arc<Self>) {
        let leftovers = match self.store.pending_items(OffsetDateTime::now_utc()) {
            Ok(items) => items
                .iter()
                .filter(|item| !self.runtime.is_in_flight(&item.external_key))
                .count(),
            Err(error) => {
                warn!(error = %error, "could not check for leftover work");
                0
            }
        };
        if leftovers == 0 || !self.runtime.mark_relaunch(true) {
            return;
        }

        info!(
            leftovers,
            delay_ms = self.settings.relaunch_delay.as_millis() as u64,
            "pending rows remain after drain, reloading"
        );
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = inner.runtime.shutdown_signal();
            if !inner.pause(inner.settings.relaunch_delay, &mut shutdown).await {
                if let Err(error) = inner.load_pending() {
                    warn!(error = %error, "reload after drain failed");
                }
            }
            inner.runtime.mark_relaunch(false);
        });
    }

    /// Sleep for `duration`; true if shutdown was requested meanwhile.
    async fn pause(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            () = sleep(duration) => false,
            () = shutdown_requested(shutdown) => true,
        }
    }
}
