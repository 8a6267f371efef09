//! Continuous-refill token bucket.
//!
//! Tokens accrue proportionally to elapsed time (not in ticks) and never exceed the
//! effective capacity, `capacity * safety_factor`. The bucket never blocks; callers that
//! want to wait use [`RateBucket::wait_time`].

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum BucketError {
    #[error("safety factor must be within 0.0..=1.0, got {value}")]
    InvalidSafetyFactor { value: f64 },
    #[error("bucket capacity and refill rate must be positive")]
    InvalidRate,
}

/// Counters kept alongside the token level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BucketStats {
    pub allowed: u64,
    pub rejected: u64,
    pub tokens_consumed: f64,
    pub errors: u64,
}

#[derive(Debug, Clone)]
pub struct RateBucket {
    capacity: f64,
    safety_factor: f64,
    effective_capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_update: Instant,
    stats: BucketStats,
}

impl RateBucket {
    /// New bucket that starts full at its effective capacity.
    pub fn new(
        capacity: f64,
        refill_per_second: f64,
        safety_factor: f64,
    ) -> Result<Self, BucketError> {
        if !(capacity > 0.0 && refill_per_second > 0.0) {
            return Err(BucketError::InvalidRate);
        }
        validate_factor(safety_factor)?;

        let effective_capacity = capacity * safety_factor;
        Ok(Self {
            capacity,
            safety_factor,
            effective_capacity,
            tokens: effective_capacity,
            refill_per_second,
            last_update: Instant::now(),
            stats: BucketStats::default(),
        })
    }

    /// Bucket sized for a requests-per-minute quota: capacity `rpm`, refill `rpm / 60` per second.
    pub fn per_minute(requests_per_minute: u32, safety_factor: f64) -> Result<Self, BucketError> {
        let rpm = f64::from(requests_per_minute);
        Self::new(rpm, rpm / 60.0, safety_factor)
    }

    fn update(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.effective_capacity);
    }

    /// Take `n` tokens if all of them are available.
    pub fn try_consume(&mut self, n: f64) -> bool {
        self.update();
        if self.tokens >= n {
            self.tokens -= n;
            self.stats.allowed += 1;
            self.stats.tokens_consumed += n;
            true
        } else {
            self.stats.rejected += 1;
            false
        }
    }

    /// Time until `n` tokens are available; zero if they already are.
    pub fn wait_time(&mut self, n: f64) -> Duration {
        self.update();
        if self.tokens >= n {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((n - self.tokens) / self.refill_per_second)
    }

    pub fn mark_error(&mut self) {
        self.stats.errors += 1;
    }

    /// Change the safety factor, keeping the bucket's fullness ratio.
    pub fn adjust_safety_factor(&mut self, factor: f64) -> Result<(), BucketError> {
        validate_factor(factor)?;
        self.update();

        let previous = self.safety_factor;
        self.safety_factor = factor;
        self.effective_capacity = self.capacity * factor;
        self.tokens = if previous > 0.0 {
            (self.tokens * (factor / previous)).min(self.effective_capacity)
        } else {
            self.effective_capacity
        };
        Ok(())
    }

    /// Current token level after refill.
    pub fn tokens(&mut self) -> f64 {
        self.update();
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn effective_capacity(&self) -> f64 {
        self.effective_capacity
    }

    pub fn safety_factor(&self) -> f64 {
        self.safety_factor
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    pub fn stats(&self) -> BucketStats {
        self.stats
    }
}

fn validate_factor(value: f64) -> Result<(), BucketError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(BucketError::InvalidSafetyFactor { value })
    }
}
