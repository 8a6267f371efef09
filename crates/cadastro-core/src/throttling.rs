//! Hard per-adapter request ceiling.
//!
//! The adaptive limiter decides which provider to call; this ceiling is the adapter's own
//! guarantee that it never exceeds its nominal quota, whoever drives it.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct RequestCeiling {
    limiter: DirectRateLimiter,
    clock: DefaultClock,
    requests_per_minute: u32,
}

impl RequestCeiling {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let quota = quota_per_minute(requests_per_minute);
        let clock = DefaultClock::default();
        Self {
            limiter: RateLimiter::direct_with_clock(quota, &clock),
            clock,
            requests_per_minute: requests_per_minute.max(1),
        }
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    /// Take a slot, waiting up to `max_wait` for one to free up.
    /// On failure returns how long until the next slot.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), Duration> {
        match self.limiter.check() {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                if wait > max_wait {
                    return Err(wait);
                }
                tokio::time::sleep(wait).await;
                self.limiter.check().map_err(|not_until| not_until.wait_time_from(self.clock.now()))
            }
        }
    }
}

impl std::fmt::Debug for RequestCeiling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCeiling")
            .field("requests_per_minute", &self.requests_per_minute)
            .finish()
    }
}

fn quota_per_minute(requests_per_minute: u32) -> Quota {
    let burst = NonZeroU32::new(requests_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
    Quota::per_minute(burst)
}
