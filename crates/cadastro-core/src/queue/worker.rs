//! Processing of a single work item: claim, retry with backoff, persist, classify.

use std::sync::atomic::{AtomicBool, Ordering};

use time::OffsetDateTime;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use cadastro_store::{Outcome, StoreError, WorkItem, WorkStatus};

use super::{QueueError, QueueInner};
use crate::dispatch::DispatchError;
use crate::provider::NormalizedRecord;

impl QueueInner {
    /// Claim the latest Queued row for `key` and drive it to a terminal status.
    ///
    /// Returns `None` when there was nothing to claim.
    pub(crate) async fn process_one(&self, key: &str) -> Result<Option<WorkStatus>, QueueError> {
        let Some(item) = self.store.claim(key)? else {
            debug!(key, "no claimable work item");
            return Ok(None);
        };
        debug!(key, id = item.id, claims = item.attempts, "work item claimed");

        let quota_hit = AtomicBool::new(false);
        let outcome = match timeout(self.settings.item_timeout, self.attempt(&item, &quota_hit)).await
        {
            Ok(outcome) => outcome,
            Err(_) => self.timed_out(quota_hit.load(Ordering::Acquire)),
        };

        let status = outcome.status();
        if !self.store.finish(item.id, &outcome)? {
            warn!(key, id = item.id, "work item left processing before it finished; outcome dropped");
            return Ok(Some(status));
        }

        match &outcome {
            Outcome::Completed => info!(key, id = item.id, "work item completed"),
            Outcome::Error { message } => warn!(key, id = item.id, error = %message, "work item failed"),
            Outcome::RateLimited { message, .. } => {
                warn!(key, id = item.id, error = %message, "work item rate limited");
            }
        }
        Ok(Some(status))
    }

    async fn attempt(&self, item: &WorkItem, quota_hit: &AtomicBool) -> Outcome {
        let attempts = self.settings.max_retry_attempts.max(1);
        let mut last_error: Option<DispatchError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(self.settings.backoff.delay(attempt - 1)).await;
            }

            match self.dispatch.resolve(&item.external_key).await {
                Ok((record, provider)) => return self.store_result(record, &provider),
                Err(error @ DispatchError::InvalidKey(_)) => {
                    return Outcome::Error {
                        message: error.to_string(),
                    };
                }
                Err(error) => {
                    let rate_limited = error.is_rate_limited();
                    quota_hit.fetch_or(rate_limited, Ordering::AcqRel);
                    if let Err(store_error) =
                        self.store
                            .record_attempt_error(item.id, &error.to_string(), rate_limited)
                    {
                        warn!(key = %item.external_key, error = %store_error, "could not record attempt error");
                    }
                    debug!(
                        key = %item.external_key,
                        attempt = attempt + 1,
                        rate_limited,
                        error = %error,
                        "attempt failed"
                    );
                    let retryable = error.is_retryable();
                    last_error = Some(error);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(error) if error.is_rate_limited() => self.rate_limited(&error.to_string()),
            Some(error) => Outcome::Error {
                message: error.to_string(),
            },
            None => Outcome::Error {
                message: String::from("no attempt was made"),
            },
        }
    }

    /// Insert or update the result row. A concurrent insert for the same key counts as
    /// success.
    fn store_result(&self, record: NormalizedRecord, provider: &str) -> Outcome {
        let result = record.into_new_result();
        let written = match self.store.find_result(&result.external_key) {
            Ok(Some(_)) => self.store.update_result(&result).map(|_| ()),
            Ok(None) => match self.store.insert_result(&result) {
                Ok(_) => Ok(()),
                Err(StoreError::Conflict { key }) => {
                    debug!(key = %key, "result already stored by another worker");
                    Ok(())
                }
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        };

        match written {
            Ok(()) => {
                debug!(key = %result.external_key, provider, "result stored");
                Outcome::Completed
            }
            Err(error) => Outcome::Error {
                message: format!("resolved by {provider} but the result could not be stored: {error}"),
            },
        }
    }

    fn rate_limited(&self, cause: &str) -> Outcome {
        let delay = self.settings.rate_limit_retry_delay;
        Outcome::RateLimited {
            message: format!(
                "rate limited by every provider, retry in about {}s: {cause}",
                delay.as_secs()
            ),
            retry_after: super::shift_forward(OffsetDateTime::now_utc(), delay),
        }
    }

    fn timed_out(&self, quota_hit: bool) -> Outcome {
        let limit = self.settings.item_timeout.as_millis();
        if quota_hit || self.dispatch.all_cooling_down() {
            return self.rate_limited(&format!(
                "processing exceeded {limit}ms waiting for provider capacity"
            ));
        }
        Outcome::Error {
            message: format!("processing exceeded the {limit}ms limit and was aborted"),
        }
    }
}
