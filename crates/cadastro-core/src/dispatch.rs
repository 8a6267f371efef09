//! Resolve one key by failing over across rate-limited providers.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapters::{CnpjWsAdapter, CnpjaOpenAdapter, ReceitaWsAdapter};
use crate::bucket::BucketError;
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::limiter::AdaptiveLimiter;
use crate::provider::{NormalizedRecord, ProviderAdapter, ProviderError, ProviderId, ResolveOptions};
use crate::settings::{DispatchSettings, Settings};
use crate::{RegistryKey, ValidationError};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    InvalidKey(#[from] ValidationError),

    #[error("no provider is configured")]
    NoProviders,

    #[error("cannot register provider '{provider}': {source}")]
    Registration {
        provider: String,
        #[source]
        source: BucketError,
    },

    #[error("all providers failed after {attempts} attempts: {}", describe_last(.last.as_ref()))]
    Exhausted {
        attempts: u32,
        last: Option<ProviderError>,
        /// True when at least one attempt failed on a quota rejection.
        rate_limited: bool,
    },
}

fn describe_last(last: Option<&ProviderError>) -> String {
    last.map_or_else(
        || String::from("no provider became available"),
        ToString::to_string,
    )
}

impl DispatchError {
    /// Whether the failure should be retried later rather than recorded as an error: the
    /// last cause was a quota rejection, or no provider ever had capacity.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Exhausted { last: None, .. } => true,
            Self::Exhausted {
                last: Some(error), ..
            } => error.is_rate_limited(),
            _ => false,
        }
    }

    /// Whether another round could succeed. An invalid key and a last answer that was
    /// definitive (no record, a rejected request) are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Exhausted { last: None, .. } => true,
            Self::Exhausted {
                last: Some(error), ..
            } => error.retryable(),
            _ => false,
        }
    }

    pub fn last_cause(&self) -> Option<&ProviderError> {
        match self {
            Self::Exhausted { last, .. } => last.as_ref(),
            _ => None,
        }
    }
}

/// Owns the provider adapters and asks the limiter which one to call next.
pub struct DispatchManager {
    limiter: Arc<AdaptiveLimiter>,
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
    settings: DispatchSettings,
}

impl DispatchManager {
    /// Register every adapter with `limiter` at its nominal quota.
    pub fn new(
        limiter: Arc<AdaptiveLimiter>,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        settings: DispatchSettings,
    ) -> Result<Self, DispatchError> {
        if adapters.is_empty() {
            return Err(DispatchError::NoProviders);
        }

        let mut registered = BTreeMap::new();
        for adapter in adapters {
            let name = adapter.name().to_owned();
            limiter
                .register(&name, adapter.requests_per_minute(), None)
                .map_err(|source| DispatchError::Registration {
                    provider: name.clone(),
                    source,
                })?;
            registered.insert(name, adapter);
        }

        info!(
            providers = registered.len(),
            total_rpm = limiter.total_requests_per_minute(),
            "dispatch manager ready"
        );
        Ok(Self {
            limiter,
            adapters: registered,
            settings,
        })
    }

    /// Build the enabled adapters from `settings` and a fresh limiter.
    pub fn from_settings(settings: &Settings, offline: bool) -> Result<Self, DispatchError> {
        let mut builder = ProviderRegistryBuilder::new(settings);
        if offline {
            builder = builder.with_offline_mode();
        }
        Self::new(
            Arc::new(AdaptiveLimiter::new(settings.limiter)),
            builder.build(),
            settings.dispatch,
        )
    }

    pub fn limiter(&self) -> &Arc<AdaptiveLimiter> {
        &self.limiter
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn pacing_interval(&self) -> Duration {
        self.limiter.pacing_interval()
    }

    pub fn total_requests_per_minute(&self) -> u32 {
        self.limiter.total_requests_per_minute()
    }

    /// True when every provider is cooling down after a quota rejection.
    pub fn all_cooling_down(&self) -> bool {
        self.adapters
            .keys()
            .all(|name| self.limiter.is_in_cooldown(name))
    }

    /// Resolve `key`, returning the record and the provider that produced it.
    pub async fn resolve(&self, key: &str) -> Result<(NormalizedRecord, String), DispatchError> {
        let key = RegistryKey::parse(key)?;
        self.resolve_key(&key).await
    }

    pub async fn resolve_key(
        &self,
        key: &RegistryKey,
    ) -> Result<(NormalizedRecord, String), DispatchError> {
        let attempts = self.settings.attempts.max(1);
        let mut last: Option<ProviderError> = None;
        let mut rate_limited = false;
        // Providers that answered with a non-retryable error are not asked again.
        let mut settled: HashSet<String> = HashSet::new();

        for attempt in 1..=attempts {
            if settled.len() == self.adapters.len() {
                break;
            }

            let Some(name) = self
                .limiter
                .await_available(self.settings.availability_timeout)
                .await
            else {
                warn!(key = %key, attempt, "no provider available");
                continue;
            };
            let Some(adapter) = self.adapters.get(&name) else {
                continue;
            };
            if settled.contains(&name) {
                debug!(key = %key, provider = %name, attempt, "provider already answered");
                continue;
            }

            debug!(key = %key, provider = %name, attempt, "querying provider");
            match adapter.resolve(key, ResolveOptions::default()).await {
                Ok(record) => {
                    self.limiter.mark_used(&name, true);
                    info!(key = %key, provider = %name, attempt, "key resolved");
                    return Ok((record, name));
                }
                Err(error) => {
                    if error.is_rate_limited() {
                        rate_limited = true;
                        self.limiter.mark_rate_limited(&name);
                    } else {
                        self.limiter.mark_used(&name, false);
                    }
                    warn!(
                        key = %key,
                        provider = %name,
                        attempt,
                        code = error.code(),
                        error = error.message(),
                        "provider call failed"
                    );
                    if !error.retryable() {
                        settled.insert(name);
                    }
                    last = Some(error);
                }
            }
        }

        Err(DispatchError::Exhausted {
            attempts,
            last,
            rate_limited,
        })
    }
}

/// Assembles the enabled provider adapters.
pub struct ProviderRegistryBuilder<'a> {
    settings: &'a Settings,
    offline: bool,
    http: Option<Arc<dyn HttpClient>>,
}

impl<'a> ProviderRegistryBuilder<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            offline: false,
            http: None,
        }
    }

    /// Serve deterministic fixtures instead of calling the providers.
    pub fn with_offline_mode(mut self) -> Self {
        self.offline = true;
        self
    }

    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Vec<Arc<dyn ProviderAdapter>> {
        let http = self
            .http
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new()));

        self.settings
            .enabled_providers()
            .map(|provider| {
                let rpm = provider.requests_per_minute;
                let adapter: Arc<dyn ProviderAdapter> = match (provider.id, self.offline) {
                    (ProviderId::ReceitaWs, true) => Arc::new(ReceitaWsAdapter::offline(rpm)),
                    (ProviderId::ReceitaWs, false) => {
                        Arc::new(ReceitaWsAdapter::with_http_client(Arc::clone(&http), rpm))
                    }
                    (ProviderId::CnpjWs, true) => Arc::new(CnpjWsAdapter::offline(rpm)),
                    (ProviderId::CnpjWs, false) => {
                        Arc::new(CnpjWsAdapter::with_http_client(Arc::clone(&http), rpm))
                    }
                    (ProviderId::CnpjaOpen, true) => Arc::new(CnpjaOpenAdapter::offline(rpm)),
                    (ProviderId::CnpjaOpen, false) => {
                        Arc::new(CnpjaOpenAdapter::with_http_client(Arc::clone(&http), rpm))
                    }
                };
                adapter
            })
            .collect()
    }
}
