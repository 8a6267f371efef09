//! Uniform contract for registry data providers.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cadastro_store::{ExtractedFields, NewResult};

use crate::{RegistryKey, ValidationError};

/// Built-in provider identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    ReceitaWs,
    CnpjWs,
    CnpjaOpen,
}

impl ProviderId {
    pub const ALL: [Self; 3] = [Self::ReceitaWs, Self::CnpjWs, Self::CnpjaOpen];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReceitaWs => "receitaws",
            Self::CnpjWs => "cnpjws",
            Self::CnpjaOpen => "cnpja_open",
        }
    }

    /// Nominal free-tier quota.
    pub const fn default_requests_per_minute(self) -> u32 {
        match self {
            Self::ReceitaWs | Self::CnpjWs => 3,
            Self::CnpjaOpen => 5,
        }
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "receitaws" => Ok(Self::ReceitaWs),
            "cnpjws" | "cnpj.ws" => Ok(Self::CnpjWs),
            "cnpja_open" | "cnpja-open" | "cnpja" => Ok(Self::CnpjaOpen),
            other => Err(ValidationError::InvalidProvider {
                value: other.to_owned(),
            }),
        }
    }
}

/// Provider-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Quota exhausted upstream; feeds the limiter's cooldown.
    RateLimitExceeded,
    NotFound,
    /// Timeouts, connection failures, 5xx.
    Transient,
    Fatal,
}

/// Structured provider error consumed by the dispatch manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: String,
    retryable: bool,
}

impl ProviderError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimitExceeded,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::NotFound,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Fatal,
            message: message.into(),
            retryable: false,
        }
    }

    pub const fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn is_rate_limited(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::RateLimitExceeded)
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            ProviderErrorKind::RateLimitExceeded => "provider.rate_limited",
            ProviderErrorKind::NotFound => "provider.not_found",
            ProviderErrorKind::Transient => "provider.transient",
            ProviderErrorKind::Fatal => "provider.fatal",
        }
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for ProviderError {}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Upper bound for this call; adapters use the smaller of this and their own timeout.
    pub timeout: Option<Duration>,
}

impl ResolveOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn effective_timeout(&self, adapter_default: Duration) -> Duration {
        self.timeout
            .map_or(adapter_default, |timeout| timeout.min(adapter_default))
    }
}

/// Provider-independent view of a resolved company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub key: RegistryKey,
    pub provider: String,
    pub fields: ExtractedFields,
    pub raw_payload: Value,
}

impl NormalizedRecord {
    pub fn into_new_result(self) -> NewResult {
        NewResult {
            external_key: self.key.into(),
            provider: self.provider,
            raw_payload: self.raw_payload,
            fields: self.fields,
        }
    }
}

pub type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<NormalizedRecord, ProviderError>> + Send + 'a>>;

/// Query contract every provider implements.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Nominal quota used when registering with the limiter.
    fn requests_per_minute(&self) -> u32;

    fn resolve<'a>(&'a self, key: &'a RegistryKey, options: ResolveOptions) -> ResolveFuture<'a>;
}
