//! # Cadastro Core
//!
//! Resolution of company registry keys against rate-limited public providers.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | ReceitaWS, CNPJ.ws and CNPJa open adapters |
//! | [`bucket`] | Continuous-refill token bucket |
//! | [`circuit_breaker`] | Transport circuit breaker used by the adapters |
//! | [`dispatch`] | Provider selection and failover for one key |
//! | [`error`] | Validation errors |
//! | [`http_client`] | HTTP client abstraction |
//! | [`key`] | Registry key parsing |
//! | [`limiter`] | Adaptive multi-provider limiter |
//! | [`provider`] | Provider contract and error taxonomy |
//! | [`queue`] | Persistent work queue |
//! | [`retry`] | Backoff between item attempts |
//! | [`settings`] | Environment-driven configuration |
//! | [`throttling`] | Local request ceiling per adapter |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  CLI / caller   │
//! └────────┬────────┘
//!          │ enqueue / admin
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │   WorkQueue     │────▶│  RecordStore     │
//! └────────┬────────┘     │  (DuckDB)        │
//!          │ workers      └──────────────────┘
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ DispatchManager │────▶│ AdaptiveLimiter  │
//! └────────┬────────┘     │ (RateBucket x N) │
//!          │              └──────────────────┘
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ ProviderAdapter │────▶│ HTTP Client      │
//! └─────────────────┘     │ (reqwest/none)   │
//!                         └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cadastro_core::{Settings, WorkQueue};
//! use cadastro_store::DuckDbStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(DuckDbStore::open_in_memory()?);
//!     let queue = WorkQueue::from_settings(store, &Settings::default(), true)?;
//!
//!     queue.enqueue(["11.222.333/0001-81"]);
//!     queue.wait_idle(Duration::from_secs(60)).await;
//!     println!("{:?}", queue.result("11222333000181")?);
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod bucket;
pub mod circuit_breaker;
pub mod dispatch;
pub mod error;
pub mod http_client;
pub mod key;
pub mod limiter;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod settings;
pub mod throttling;

pub use adapters::{CnpjWsAdapter, CnpjaOpenAdapter, ReceitaWsAdapter};
pub use bucket::{BucketError, BucketStats, RateBucket};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use dispatch::{DispatchError, DispatchManager, ProviderRegistryBuilder};
pub use error::ValidationError;
pub use http_client::{
    HttpClient, HttpError, HttpFuture, HttpRequest, HttpResponse, NoopHttpClient,
    ReqwestHttpClient,
};
pub use key::{RegistryKey, KEY_DIGITS};
pub use limiter::{AdaptiveLimiter, ErrorDecay, LimiterPolicy, ProviderSnapshot};
pub use provider::{
    NormalizedRecord, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderId,
    ResolveFuture, ResolveOptions,
};
pub use queue::{
    BatchEntry, BatchStatus, EnqueueReport, FixReport, QueueError, QueueStatus, RejectedKey,
    WorkQueue,
};
pub use retry::Backoff;
pub use settings::{DispatchSettings, ProviderSettings, QueueSettings, Settings, SettingsError};
pub use throttling::RequestCeiling;
