//! Concrete registry providers.
//!
//! Each adapter runs in one of two modes. Online adapters issue real requests through an
//! [`HttpClient`], behind a request ceiling and a transport circuit breaker. Offline
//! adapters (the `Default`) build a deterministic provider-shaped payload from the key and
//! run it through the same parser, without touching the network.

mod cnpja_open;
mod cnpjws;
mod receitaws;

pub use cnpja_open::CnpjaOpenAdapter;
pub use cnpjws::CnpjWsAdapter;
pub use receitaws::ReceitaWsAdapter;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::http_client::{HttpClient, HttpRequest, HttpResponse, NoopHttpClient};
use crate::provider::{ProviderError, ResolveOptions};
use crate::throttling::RequestCeiling;

/// Shared HTTP plumbing for the adapters.
pub(crate) struct Transport {
    provider: &'static str,
    http: Arc<dyn HttpClient>,
    offline: bool,
    timeout: Duration,
    breaker: CircuitBreaker,
    ceiling: RequestCeiling,
}

impl Transport {
    pub(crate) fn offline(provider: &'static str, requests_per_minute: u32, timeout: Duration) -> Self {
        Self {
            provider,
            http: Arc::new(NoopHttpClient),
            offline: true,
            timeout,
            breaker: CircuitBreaker::default(),
            ceiling: RequestCeiling::per_minute(requests_per_minute),
        }
    }

    pub(crate) fn online(
        provider: &'static str,
        http: Arc<dyn HttpClient>,
        requests_per_minute: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            http,
            offline: false,
            timeout,
            breaker: CircuitBreaker::default(),
            ceiling: RequestCeiling::per_minute(requests_per_minute),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub(crate) const fn is_offline(&self) -> bool {
        self.offline
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issue a GET and hand back the response for any HTTP status. Transport failures and
    /// an open circuit come back as transient errors.
    pub(crate) async fn get(
        &self,
        request: HttpRequest,
        options: ResolveOptions,
    ) -> Result<HttpResponse, ProviderError> {
        let timeout = options.effective_timeout(self.timeout);

        if let Err(wait) = self.ceiling.acquire(timeout).await {
            return Err(ProviderError::rate_limited(format!(
                "{} local request ceiling reached, next slot in {}s",
                self.provider,
                wait.as_secs()
            )));
        }

        if !self.breaker.allow_request() {
            return Err(ProviderError::transient(format!(
                "{} circuit is open after repeated transport failures",
                self.provider
            )));
        }

        debug!(provider = self.provider, url = %request.url, "provider request");
        match self.http.execute(request.with_timeout(timeout)).await {
            Ok(response) => {
                if is_transient_status(response.status) {
                    self.breaker.record_failure();
                } else {
                    self.breaker.record_success();
                }
                Ok(response)
            }
            Err(error) => {
                self.breaker.record_failure();
                warn!(provider = self.provider, error = %error, "provider transport failure");
                let message = if error.timed_out() {
                    format!("{} timed out: {error}", self.provider)
                } else {
                    format!("{} unreachable: {error}", self.provider)
                };
                Err(ProviderError::transient(message))
            }
        }
    }
}

const fn is_transient_status(status: u16) -> bool {
    status == 408 || (status >= 500 && status <= 599)
}

/// Map a non-200 status to the provider error taxonomy.
pub(crate) fn classify_status(provider: &str, response: &HttpResponse) -> ProviderError {
    let detail = error_detail(&response.body);
    match response.status {
        429 => ProviderError::rate_limited(format!("{provider} quota exceeded (HTTP 429)")),
        404 => ProviderError::not_found(format!("{provider} has no record for this key")),
        status if is_transient_status(status) => {
            ProviderError::transient(format!("{provider} returned HTTP {status}: {detail}"))
        }
        status => ProviderError::fatal(format!("{provider} returned HTTP {status}: {detail}")),
    }
}

pub(crate) fn parse_body(provider: &str, response: &HttpResponse) -> Result<Value, ProviderError> {
    serde_json::from_str(&response.body)
        .map_err(|error| ProviderError::fatal(format!("{provider} sent an unreadable body: {error}")))
}

fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| text(&value, "/message"))
        .unwrap_or_else(|| String::from("unknown error"))
}

/// Non-empty trimmed string at a JSON pointer.
pub(crate) fn text(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_owned())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub(crate) fn digits(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.chars().filter(char::is_ascii_digit).collect::<String>())
        .filter(|digits| !digits.is_empty())
}

/// `street, number, details, district` with missing parts dropped.
pub(crate) fn join_address(parts: &[Option<String>]) -> Option<String> {
    let joined = parts
        .iter()
        .flatten()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    (!joined.is_empty()).then_some(joined)
}

const FIXTURE_NAMES: [&str; 6] = [
    "ACME COMERCIO",
    "ALFA SERVICOS",
    "BETA INDUSTRIA",
    "GAMA TECNOLOGIA",
    "DELTA LOGISTICA",
    "OMEGA ALIMENTOS",
];
const FIXTURE_CITIES: [(&str, &str); 4] = [
    ("SAO PAULO", "SP"),
    ("RIO DE JANEIRO", "RJ"),
    ("BELO HORIZONTE", "MG"),
    ("CURITIBA", "PR"),
];

/// Deterministic company attributes for offline payloads.
pub(crate) struct Fixture {
    pub name: String,
    pub trade_name: String,
    pub city: &'static str,
    pub state: &'static str,
    pub zip: String,
    pub number: String,
    pub simples: bool,
}

impl Fixture {
    pub(crate) fn for_seed(seed: u64) -> Self {
        let name = FIXTURE_NAMES[(seed % FIXTURE_NAMES.len() as u64) as usize];
        let (city, state) = FIXTURE_CITIES[((seed / 7) % FIXTURE_CITIES.len() as u64) as usize];
        Self {
            name: format!("{name} LTDA"),
            trade_name: name.to_owned(),
            city,
            state,
            zip: format!("{:08}", seed % 100_000_000),
            number: (seed % 2_000 + 1).to_string(),
            simples: seed % 2 == 0,
        }
    }
}
