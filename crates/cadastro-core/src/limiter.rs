//! Adaptive multi-provider rate limiter.
//!
//! One [`RateBucket`] per provider, plus the state that decides which provider to use
//! next: cooldowns after quota rejections, dynamic safety factors, and a global pacing
//! interval of `60 / sum(rpm)` seconds between selections.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bucket::{BucketError, BucketStats, RateBucket};

const MIN_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_secs(1);

/// How a provider's rate-limit error count evolves after successful calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorDecay {
    /// Errors accumulate for the lifetime of the process.
    #[default]
    None,
    ResetOnSuccess,
    HalveOnSuccess,
}

impl ErrorDecay {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ResetOnSuccess => "reset-on-success",
            Self::HalveOnSuccess => "halve-on-success",
        }
    }

    fn apply(self, errors: u32) -> u32 {
        match self {
            Self::None => errors,
            Self::ResetOnSuccess => 0,
            Self::HalveOnSuccess => errors / 2,
        }
    }
}

impl Display for ErrorDecay {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorDecay {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "none" => Ok(Self::None),
            "reset-on-success" | "reset" => Ok(Self::ResetOnSuccess),
            "halve-on-success" | "halve" => Ok(Self::HalveOnSuccess),
            other => Err(format!(
                "unknown error decay '{other}', expected none, reset-on-success or halve-on-success"
            )),
        }
    }
}

/// Hard upper bound on any single cooldown, whatever the policy says.
const COOLDOWN_CEILING: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Tunables for cooldowns and safety factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimiterPolicy {
    pub cooldown_base: Duration,
    pub cooldown_max: Duration,
    /// Default factor for providers at or below `low_rpm_threshold`; also the floor.
    pub safety_factor_low: f64,
    /// Default factor for faster providers; also the ceiling.
    pub safety_factor_high: f64,
    pub low_rpm_threshold: u32,
    pub error_decay: ErrorDecay,
    /// Successes between safety-factor reevaluations.
    pub raise_every: u64,
    pub raise_multiplier: f64,
    pub lower_multiplier: f64,
}

impl Default for LimiterPolicy {
    fn default() -> Self {
        Self {
            cooldown_base: Duration::from_secs(60),
            cooldown_max: Duration::from_secs(600),
            safety_factor_low: 0.8,
            safety_factor_high: 0.9,
            low_rpm_threshold: 10,
            error_decay: ErrorDecay::None,
            raise_every: 10,
            raise_multiplier: 1.05,
            lower_multiplier: 0.8,
        }
    }
}

impl LimiterPolicy {
    /// Cooldown applied after the `errors`-th consecutive quota rejection.
    pub fn cooldown_for(&self, errors: u32) -> Duration {
        let exponent = errors.saturating_sub(1).min(31);
        let scaled = self
            .cooldown_base
            .checked_mul(1_u32 << exponent)
            .unwrap_or(self.cooldown_max);
        scaled.min(self.cooldown_max).min(COOLDOWN_CEILING)
    }

    fn default_factor(&self, requests_per_minute: u32) -> f64 {
        if requests_per_minute <= self.low_rpm_threshold {
            self.safety_factor_low
        } else {
            self.safety_factor_high
        }
    }
}

#[derive(Debug)]
struct ProviderSlot {
    bucket: RateBucket,
    requests_per_minute: u32,
    error_count: u32,
    success_count: u64,
    last_used: Option<Instant>,
    cooldown_until: Option<Instant>,
    last_cooldown: Option<Duration>,
}

impl ProviderSlot {
    fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    providers: BTreeMap<String, ProviderSlot>,
    total_rpm: u32,
    last_selection: Option<Instant>,
}

impl LimiterState {
    fn pacing_interval(&self) -> Duration {
        if self.total_rpm == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(60.0 / f64::from(self.total_rpm))
        }
    }

    fn pacing_remaining(&self, now: Instant) -> Duration {
        match self.last_selection {
            Some(last) => self
                .pacing_interval()
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

/// Point-in-time view of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub requests_per_minute: u32,
    pub tokens: f64,
    pub effective_capacity: f64,
    pub safety_factor: f64,
    pub error_count: u32,
    pub success_count: u64,
    pub in_cooldown: bool,
    pub cooldown_remaining_secs: f64,
    pub last_cooldown_secs: Option<f64>,
    pub seconds_since_last_use: Option<f64>,
    pub bucket: BucketStats,
}

#[derive(Debug, Default)]
pub struct AdaptiveLimiter {
    policy: LimiterPolicy,
    state: Mutex<LimiterState>,
}

impl AdaptiveLimiter {
    pub fn new(policy: LimiterPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().expect("limiter lock is not poisoned")
    }

    /// Register (or replace) a provider. Without an explicit factor the low/high default
    /// is chosen from the provider's rpm.
    pub fn register(
        &self,
        name: &str,
        requests_per_minute: u32,
        safety_factor: Option<f64>,
    ) -> Result<(), BucketError> {
        let factor = safety_factor.unwrap_or_else(|| self.policy.default_factor(requests_per_minute));
        let bucket = RateBucket::per_minute(requests_per_minute, factor)?;

        let mut state = self.lock();
        state.providers.insert(
            name.to_owned(),
            ProviderSlot {
                bucket,
                requests_per_minute,
                error_count: 0,
                success_count: 0,
                last_used: None,
                cooldown_until: None,
                last_cooldown: None,
            },
        );
        state.total_rpm = state
            .providers
            .values()
            .map(|slot| slot.requests_per_minute)
            .sum();

        info!(
            provider = name,
            requests_per_minute,
            safety_factor = factor,
            total_rpm = state.total_rpm,
            "provider registered"
        );
        Ok(())
    }

    pub fn providers(&self) -> Vec<String> {
        self.lock().providers.keys().cloned().collect()
    }

    pub fn total_requests_per_minute(&self) -> u32 {
        self.lock().total_rpm
    }

    /// Minimum spacing between selections, `60 / sum(rpm)`.
    pub fn pacing_interval(&self) -> Duration {
        self.lock().pacing_interval()
    }

    /// Consume one token for `name` unless it is cooling down or empty.
    pub fn can_use(&self, name: &str) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        let Some(slot) = state.providers.get_mut(name) else {
            return false;
        };
        if slot.in_cooldown(now) {
            debug!(
                provider = name,
                remaining_ms = slot.cooldown_remaining(now).as_millis() as u64,
                "provider cooling down"
            );
            return false;
        }
        slot.bucket.try_consume(1.0)
    }

    pub fn is_in_cooldown(&self, name: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .providers
            .get(name)
            .is_some_and(|slot| slot.in_cooldown(now))
    }

    /// Record a call outcome. Every `raise_every`-th success on an error-free provider
    /// raises its safety factor toward the high bound.
    pub fn mark_used(&self, name: &str, success: bool) {
        let now = Instant::now();
        let policy = self.policy;
        let mut state = self.lock();
        let Some(slot) = state.providers.get_mut(name) else {
            return;
        };
        slot.last_used = Some(now);

        if !success {
            slot.bucket.mark_error();
            return;
        }

        slot.success_count += 1;
        slot.error_count = policy.error_decay.apply(slot.error_count);

        if policy.raise_every > 0
            && slot.success_count % policy.raise_every == 0
            && slot.error_count == 0
        {
            let current = slot.bucket.safety_factor();
            let raised = (current * policy.raise_multiplier).min(policy.safety_factor_high);
            if raised > current && slot.bucket.adjust_safety_factor(raised).is_ok() {
                debug!(provider = name, from = current, to = raised, "safety factor raised");
            }
        }
    }

    /// Put the provider into exponential cooldown and tighten its safety factor.
    /// Returns the cooldown applied.
    pub fn mark_rate_limited(&self, name: &str) -> Option<Duration> {
        let now = Instant::now();
        let policy = self.policy;
        let mut state = self.lock();
        let slot = state.providers.get_mut(name)?;

        slot.error_count = slot.error_count.saturating_add(1);
        slot.bucket.mark_error();
        let cooldown = policy.cooldown_for(slot.error_count);
        slot.cooldown_until = Some(now + cooldown);
        slot.last_cooldown = Some(cooldown);

        let current = slot.bucket.safety_factor();
        let lowered = (current * policy.lower_multiplier).max(policy.safety_factor_low);
        if lowered < current {
            let _ = slot.bucket.adjust_safety_factor(lowered);
        }

        warn!(
            provider = name,
            errors = slot.error_count,
            cooldown_secs = cooldown.as_secs_f64(),
            safety_factor = slot.bucket.safety_factor(),
            "provider rate limited"
        );
        Some(cooldown)
    }

    /// Pick the best provider right now, consuming one of its tokens.
    ///
    /// Returns `None` when called within the pacing interval of the previous selection, or
    /// when every provider is cooling down or out of tokens.
    pub fn select_best(&self) -> Option<String> {
        let now = Instant::now();
        let mut state = self.lock();
        if state.providers.is_empty() || state.pacing_remaining(now) > Duration::ZERO {
            return None;
        }

        let mut best: Option<(f64, String)> = None;
        for (name, slot) in state.providers.iter_mut() {
            if slot.in_cooldown(now) {
                continue;
            }
            let tokens = slot.bucket.tokens();
            if tokens < 1.0 {
                continue;
            }

            let capacity = slot.bucket.effective_capacity();
            let token_score = if capacity > 0.0 { tokens / capacity } else { 0.0 };
            let time_score = slot
                .last_used
                .map(|used| (now.saturating_duration_since(used).as_secs_f64() / 60.0).min(1.0))
                .unwrap_or(1.0);
            let error_score = 1.0 / (1.0 + f64::from(slot.error_count));
            let score = 0.4 * token_score
                + 0.4 * time_score
                + 0.15 * error_score
                + 0.05 * fastrand::f64();

            if best.as_ref().map_or(true, |(top, _)| score > *top) {
                best = Some((score, name.clone()));
            }
        }

        let (score, name) = best?;
        let slot = state.providers.get_mut(&name)?;
        if !slot.bucket.try_consume(1.0) {
            return None;
        }
        state.last_selection = Some(now);
        debug!(provider = %name, score, "provider selected");
        Some(name)
    }

    /// Poll [`Self::select_best`] until a provider is available or `timeout` elapses.
    pub async fn await_available(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(name) = self.select_best() {
                return Some(name);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(timeout_ms = timeout.as_millis() as u64, "no provider became available");
                return None;
            }

            let delay = self.next_poll_delay(now).min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    fn next_poll_delay(&self, now: Instant) -> Duration {
        let mut state = self.lock();
        let interval = state.pacing_interval();
        let pacing_remaining = state.pacing_remaining(now);

        let smallest_wait = state
            .providers
            .values_mut()
            .filter(|slot| !slot.in_cooldown(now))
            .map(|slot| slot.bucket.wait_time(1.0))
            .min();

        let wait = smallest_wait.unwrap_or(interval).min(interval).min(MAX_POLL);
        wait.max(pacing_remaining).max(MIN_POLL).min(MAX_POLL)
    }

    pub fn status(&self) -> Vec<ProviderSnapshot> {
        let now = Instant::now();
        let mut state = self.lock();
        state
            .providers
            .iter_mut()
            .map(|(name, slot)| ProviderSnapshot {
                name: name.clone(),
                requests_per_minute: slot.requests_per_minute,
                tokens: slot.bucket.tokens(),
                effective_capacity: slot.bucket.effective_capacity(),
                safety_factor: slot.bucket.safety_factor(),
                error_count: slot.error_count,
                success_count: slot.success_count,
                in_cooldown: slot.in_cooldown(now),
                cooldown_remaining_secs: slot.cooldown_remaining(now).as_secs_f64(),
                last_cooldown_secs: slot.last_cooldown.map(|cooldown| cooldown.as_secs_f64()),
                seconds_since_last_use: slot
                    .last_used
                    .map(|used| now.saturating_duration_since(used).as_secs_f64()),
                bucket: slot.bucket.stats(),
            })
            .collect()
    }

    pub fn snapshot(&self, name: &str) -> Option<ProviderSnapshot> {
        self.status().into_iter().find(|snapshot| snapshot.name == name)
    }
}
