//! Runtime configuration, read from `CADASTRO_*` environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limiter::{ErrorDecay, LimiterPolicy};
use crate::provider::ProviderId;
use crate::retry::Backoff;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
/// Upper bound for any `*_SECS` variable (one year).
const MAX_DURATION_SECS: u64 = 365 * SECONDS_PER_DAY;
const MAX_RETENTION_DAYS: u64 = 36_500;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid value '{value}' for {variable}: {reason}")]
pub struct SettingsError {
    pub variable: String,
    pub value: String,
    pub reason: String,
}

/// Enablement and quota for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub id: ProviderId,
    pub enabled: bool,
    pub requests_per_minute: u32,
}

impl ProviderSettings {
    pub const fn defaults_for(id: ProviderId) -> Self {
        Self {
            id,
            enabled: true,
            requests_per_minute: id.default_requests_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Attempts per `resolve` call before giving up.
    pub attempts: u32,
    pub availability_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            availability_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub max_retry_attempts: u32,
    pub max_concurrent: usize,
    /// How long a RateLimited item waits before it is eligible for pickup again.
    pub rate_limit_retry_delay: Duration,
    /// Wall-clock ceiling for one item.
    pub item_timeout: Duration,
    /// Processing rows untouched for this long are considered abandoned.
    pub stuck_after: Duration,
    pub cleanup_interval: Duration,
    /// Completed items younger than this are not enqueued again.
    pub retention: Duration,
    pub dequeue_timeout: Duration,
    pub throttle_poll: Duration,
    /// Delay before reloading from the store when the loop drains with rows still pending.
    pub relaunch_delay: Duration,
    pub backoff: Backoff,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            max_concurrent: 6,
            rate_limit_retry_delay: Duration::from_secs(60),
            item_timeout: Duration::from_secs(45),
            stuck_after: Duration::from_secs(180),
            cleanup_interval: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            dequeue_timeout: Duration::from_secs(1),
            throttle_poll: Duration::from_millis(500),
            relaunch_delay: Duration::from_secs(2),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub providers: Vec<ProviderSettings>,
    pub limiter: LimiterPolicy,
    pub dispatch: DispatchSettings,
    pub queue: QueueSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            providers: ProviderId::ALL
                .into_iter()
                .map(ProviderSettings::defaults_for)
                .collect(),
            limiter: LimiterPolicy::default(),
            dispatch: DispatchSettings::default(),
            queue: QueueSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source, starting from the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let vars = Vars { lookup: &lookup };
        let mut settings = Self::default();

        for provider in &mut settings.providers {
            let prefix = format!("CADASTRO_{}", provider.id.as_str().to_ascii_uppercase());
            if let Some(enabled) = vars.flag(&format!("{prefix}_ENABLED"))? {
                provider.enabled = enabled;
            }
            if let Some(rpm) = vars.parse::<u32>(&format!("{prefix}_RPM"))? {
                if rpm == 0 {
                    return Err(vars.invalid(&format!("{prefix}_RPM"), "0", "must be positive"));
                }
                provider.requests_per_minute = rpm;
            }
        }

        let limiter = &mut settings.limiter;
        if let Some(base) = vars.seconds("CADASTRO_COOLDOWN_BASE_SECS")? {
            limiter.cooldown_base = base;
        }
        if let Some(max) = vars.seconds("CADASTRO_COOLDOWN_MAX_SECS")? {
            limiter.cooldown_max = max;
        }
        if let Some(low) = vars.factor("CADASTRO_SAFETY_FACTOR_LOW")? {
            limiter.safety_factor_low = low;
        }
        if let Some(high) = vars.factor("CADASTRO_SAFETY_FACTOR_HIGH")? {
            limiter.safety_factor_high = high;
        }
        if let Some(threshold) = vars.parse::<u32>("CADASTRO_LOW_RPM_THRESHOLD")? {
            limiter.low_rpm_threshold = threshold;
        }
        if let Some(decay) = vars.parse::<ErrorDecay>("CADASTRO_ERROR_DECAY")? {
            limiter.error_decay = decay;
        }

        if let Some(attempts) = vars.positive("CADASTRO_DISPATCH_ATTEMPTS")? {
            settings.dispatch.attempts = attempts;
        }
        if let Some(timeout) = vars.seconds("CADASTRO_AVAILABILITY_TIMEOUT_SECS")? {
            settings.dispatch.availability_timeout = timeout;
        }

        let queue = &mut settings.queue;
        if let Some(attempts) = vars.positive("CADASTRO_MAX_RETRY_ATTEMPTS")? {
            queue.max_retry_attempts = attempts;
        }
        if let Some(limit) = vars.positive("CADASTRO_MAX_CONCURRENT_PROCESSING")? {
            queue.max_concurrent = limit as usize;
        }
        if let Some(delay) = vars.seconds("CADASTRO_RATE_LIMIT_RETRY_DELAY_SECS")? {
            queue.rate_limit_retry_delay = delay;
        }
        if let Some(timeout) = vars.seconds("CADASTRO_ITEM_TIMEOUT_SECS")? {
            queue.item_timeout = timeout;
        }
        if let Some(threshold) = vars.seconds("CADASTRO_STUCK_AFTER_SECS")? {
            queue.stuck_after = threshold;
        }
        if let Some(interval) = vars.seconds("CADASTRO_CLEANUP_INTERVAL_SECS")? {
            queue.cleanup_interval = interval;
        }
        if let Some(days) = vars.parse::<u64>("CADASTRO_RETENTION_DAYS")? {
            if days > MAX_RETENTION_DAYS {
                return Err(vars.invalid(
                    "CADASTRO_RETENTION_DAYS",
                    &days.to_string(),
                    format!("must be at most {MAX_RETENTION_DAYS}"),
                ));
            }
            queue.retention = Duration::from_secs(days * SECONDS_PER_DAY);
        }

        if settings.limiter.safety_factor_low > settings.limiter.safety_factor_high {
            return Err(SettingsError {
                variable: String::from("CADASTRO_SAFETY_FACTOR_LOW"),
                value: settings.limiter.safety_factor_low.to_string(),
                reason: String::from("must not exceed CADASTRO_SAFETY_FACTOR_HIGH"),
            });
        }

        Ok(settings)
    }

    pub fn provider(&self, id: ProviderId) -> Option<&ProviderSettings> {
        self.providers.iter().find(|provider| provider.id == id)
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderSettings> {
        self.providers.iter().filter(|provider| provider.enabled)
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn invalid(&self, name: &str, value: &str, reason: impl Into<String>) -> SettingsError {
        SettingsError {
            variable: name.to_owned(),
            value: value.to_owned(),
            reason: reason.into(),
        }
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, SettingsError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.raw(name) else {
            return Ok(None);
        };
        value
            .parse::<T>()
            .map(Some)
            .map_err(|error| self.invalid(name, &value, error.to_string()))
    }

    fn positive(&self, name: &str) -> Result<Option<u32>, SettingsError> {
        match self.parse::<u32>(name)? {
            Some(0) => Err(self.invalid(name, "0", "must be positive")),
            other => Ok(other),
        }
    }

    fn seconds(&self, name: &str) -> Result<Option<Duration>, SettingsError> {
        match self.parse::<u64>(name)? {
            Some(secs) if secs > MAX_DURATION_SECS => Err(self.invalid(
                name,
                &secs.to_string(),
                format!("must be at most {MAX_DURATION_SECS} seconds"),
            )),
            other => Ok(other.map(Duration::from_secs)),
        }
    }

    fn factor(&self, name: &str) -> Result<Option<f64>, SettingsError> {
        match self.parse::<f64>(name)? {
            Some(factor) if !(factor > 0.0 && factor <= 1.0) => {
                Err(self.invalid(name, &factor.to_string(), "must be in (0, 1]"))
            }
            other => Ok(other),
        }
    }

    fn flag(&self, name: &str) -> Result<Option<bool>, SettingsError> {
        let Some(value) = self.raw(name) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(self.invalid(name, &value, "expected true or false")),
        }
    }
}
