//! In-memory side of the queue: the pending channel, key tracking, the worker pool, and
//! the loop's lifecycle flags. The store remains the source of truth; everything here can
//! be rebuilt from it with `load_pending`.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{error, warn};

#[derive(Debug, Default)]
struct Tracked {
    /// Keys sitting in the channel.
    queued: HashSet<String>,
    /// Keys a worker currently owns.
    in_flight: HashSet<String>,
}

pub(crate) struct Runtime {
    sender: mpsc::UnboundedSender<String>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    tracked: Mutex<Tracked>,
    semaphore: Arc<Semaphore>,
    workers: Mutex<JoinSet<()>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    relaunch_scheduled: AtomicBool,
    shutdown: watch::Sender<bool>,
    last_dispatch: Mutex<Option<Instant>>,
    last_cleanup: Mutex<Option<Instant>>,
}

impl Runtime {
    pub(crate) fn new(max_concurrent: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            tracked: Mutex::new(Tracked::default()),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            workers: Mutex::new(JoinSet::new()),
            loop_handle: Mutex::new(None),
            running: AtomicBool::new(false),
            relaunch_scheduled: AtomicBool::new(false),
            shutdown,
            last_dispatch: Mutex::new(None),
            last_cleanup: Mutex::new(None),
        }
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().expect("queue tracking lock is not poisoned")
    }

    /// Send `key` to the loop unless it is already queued or owned by a worker.
    pub(crate) fn push(&self, key: &str) -> bool {
        let mut tracked = self.tracked();
        if tracked.queued.contains(key) || tracked.in_flight.contains(key) {
            return false;
        }
        if self.sender.send(key.to_owned()).is_err() {
            error!(key, "pending channel closed");
            return false;
        }
        tracked.queued.insert(key.to_owned());
        true
    }

    /// Move a received key from queued to in flight. False if a worker already owns it.
    pub(crate) fn take(&self, key: &str) -> bool {
        let mut tracked = self.tracked();
        tracked.queued.remove(key);
        tracked.in_flight.insert(key.to_owned())
    }

    pub(crate) fn release(&self, key: &str) {
        self.tracked().in_flight.remove(key);
    }

    pub(crate) fn is_in_flight(&self, key: &str) -> bool {
        self.tracked().in_flight.contains(key)
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.tracked().queued.len()
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.tracked().in_flight.len()
    }

    pub(crate) fn receiver(&self) -> &tokio::sync::Mutex<mpsc::UnboundedReceiver<String>> {
        &self.receiver
    }

    pub(crate) fn semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.semaphore)
    }

    pub(crate) fn spawn_worker<F>(&self, permit: OwnedSemaphorePermit, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut workers = self.workers.lock().expect("worker set lock is not poisoned");
        while let Some(finished) = workers.try_join_next() {
            if let Err(join_error) = finished {
                error!(error = %join_error, "queue worker panicked");
            }
        }
        workers.spawn(async move {
            work.await;
            drop(permit);
        });
    }

    /// Wait for every spawned worker to finish.
    pub(crate) async fn join_workers(&self) {
        let mut workers = {
            let mut guard = self.workers.lock().expect("worker set lock is not poisoned");
            std::mem::take(&mut *guard)
        };
        while let Some(finished) = workers.join_next().await {
            if let Err(join_error) = finished {
                error!(error = %join_error, "queue worker panicked");
            }
        }
    }

    /// Claim the right to run the loop. Returns false if it is already running or the
    /// queue was shut down.
    pub(crate) fn try_start(&self) -> bool {
        if self.is_shut_down() {
            return false;
        }
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_loop_handle(&self, handle: JoinHandle<()>) {
        let mut slot = self.loop_handle.lock().expect("loop handle lock is not poisoned");
        if let Some(previous) = slot.replace(handle) {
            if !previous.is_finished() {
                warn!("replaced a loop handle that was still running");
            }
        }
    }

    pub(crate) fn take_loop_handle(&self) -> Option<JoinHandle<()>> {
        self.loop_handle
            .lock()
            .expect("loop handle lock is not poisoned")
            .take()
    }

    /// Mark the loop stopped. Returns true if work arrived meanwhile and the caller won
    /// the right to keep looping.
    pub(crate) fn stop_or_resume(&self) -> bool {
        self.stop();
        self.queued_len() > 0 && self.try_start()
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn mark_relaunch(&self, scheduled: bool) -> bool {
        if scheduled {
            self.relaunch_scheduled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        } else {
            self.relaunch_scheduled.store(false, Ordering::Release);
            true
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        let tracked = self.tracked();
        tracked.queued.is_empty()
            && tracked.in_flight.is_empty()
            && !self.is_running()
            && !self.relaunch_scheduled.load(Ordering::Acquire)
    }

    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Time left before the next dispatch is allowed under `interval` spacing.
    pub(crate) fn dispatch_wait(&self, interval: Duration) -> Duration {
        let last = *self.last_dispatch.lock().expect("dispatch clock lock is not poisoned");
        last.map_or(Duration::ZERO, |at| {
            (at + interval).saturating_duration_since(Instant::now())
        })
    }

    pub(crate) fn record_dispatch(&self) {
        *self.last_dispatch.lock().expect("dispatch clock lock is not poisoned") =
            Some(Instant::now());
    }

    /// True at most once per `interval`.
    pub(crate) fn cleanup_due(&self, interval: Duration) -> bool {
        let now = Instant::now();
        let mut last = self.last_cleanup.lock().expect("cleanup clock lock is not poisoned");
        match *last {
            Some(at) if now.saturating_duration_since(at) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Resolve when the shutdown flag flips to true.
pub(crate) async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}
