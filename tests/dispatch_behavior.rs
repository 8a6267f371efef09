//! Behavior-driven tests for provider dispatch
//!
//! These tests verify HOW a key is resolved across several rate-limited providers:
//! pacing under the aggregate quota, failover, and how failures are classified.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadastro_core::{
    AdaptiveLimiter, DispatchError, DispatchManager, DispatchSettings, NormalizedRecord,
    ProviderAdapter, ProviderError, ProviderErrorKind, RegistryKey, ResolveFuture, ResolveOptions,
    Settings,
};
use cadastro_store::ExtractedFields;
use serde_json::json;
use tokio::time::{advance, Instant};

/// Adapter that answers from a script of outcomes, repeating the last one.
struct ScriptedProvider {
    name: &'static str,
    rpm: u32,
    script: Vec<Option<ProviderError>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    fn new(name: &'static str, script: Vec<Option<ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            rpm: 60,
            script,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn requests_per_minute(&self) -> u32 {
        self.rpm
    }

    fn resolve<'a>(&'a self, key: &'a RegistryKey, _: ResolveOptions) -> ResolveFuture<'a> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let step = self
            .script
            .get(call)
            .or_else(|| self.script.last())
            .cloned()
            .flatten();
        let outcome = match step {
            Some(error) => Err(error),
            None => Ok(NormalizedRecord {
                key: key.clone(),
                provider: self.name.to_owned(),
                fields: ExtractedFields {
                    company_name: Some(format!("EMPRESA {}", key.as_str())),
                    ..ExtractedFields::default()
                },
                raw_payload: json!({"cnpj": key.as_str()}),
            }),
        };
        Box::pin(async move { outcome })
    }
}

fn dispatch(adapters: Vec<Arc<dyn ProviderAdapter>>, attempts: u32) -> DispatchManager {
    DispatchManager::new(
        Arc::new(AdaptiveLimiter::default()),
        adapters,
        DispatchSettings {
            attempts,
            availability_timeout: Duration::from_secs(5),
        },
    )
    .expect("dispatch manager")
}

// =============================================================================
// Dispatch: Pacing Under the Aggregate Quota
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_call_rate_stays_within_quota_system_never_waits_for_capacity() {
    // Given: The three public providers in offline mode at 3, 3 and 5 rpm
    let manager = DispatchManager::from_settings(&Settings::default(), true).expect("manager");
    let pacing = manager.pacing_interval();
    assert_eq!(manager.total_requests_per_minute(), 11);

    // When: Keys are resolved at 11 per minute for five minutes
    let mut used: HashMap<String, u32> = HashMap::new();
    for call in 0..55 {
        if call > 0 {
            advance(pacing).await;
        }
        let started = Instant::now();
        let (record, provider) = manager
            .resolve("11222333000181")
            .await
            .expect("capacity is always available");

        // Then: No call had to wait and every record carries a company name
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(record.fields.company_name.is_some());
        *used.entry(provider).or_default() += 1;
    }

    // And: The load was spread over every provider
    assert_eq!(used.len(), 3);
    assert_eq!(used.values().sum::<u32>(), 55);
}

// =============================================================================
// Dispatch: Failover and Classification
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_every_provider_hits_its_quota_system_reports_rate_limited() {
    // Given: Two providers that always answer 429
    let first = ScriptedProvider::new("receitaws", vec![Some(ProviderError::rate_limited("429"))]);
    let second = ScriptedProvider::new("cnpjws", vec![Some(ProviderError::rate_limited("429"))]);
    let manager = dispatch(
        vec![
            first.clone() as Arc<dyn ProviderAdapter>,
            second.clone() as Arc<dyn ProviderAdapter>,
        ],
        3,
    );

    // When: A key is resolved
    let error = manager.resolve("11222333000181").await.expect_err("exhausted");

    // Then: Each provider was tried once, both cool down, and the failure is a quota one
    assert!(error.is_rate_limited());
    assert!(matches!(error, DispatchError::Exhausted { rate_limited: true, .. }));
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 1);
    assert!(manager.all_cooling_down());
}

#[tokio::test(start_paused = true)]
async fn when_transient_failure_clears_system_resolves_on_retry() {
    // Given: A provider that times out once and then answers
    let flaky = ScriptedProvider::new(
        "cnpja_open",
        vec![Some(ProviderError::transient("request timed out")), None],
    );
    let manager = dispatch(vec![flaky.clone() as Arc<dyn ProviderAdapter>], 3);

    // When: A key is resolved
    let (record, provider) = manager.resolve("11222333000181").await.expect("resolved");

    // Then: The second attempt succeeded and the limiter saw both outcomes
    assert_eq!(provider, "cnpja_open");
    assert_eq!(record.key.as_str(), "11222333000181");
    assert_eq!(flaky.calls(), 2);
    let snapshot = manager.limiter().snapshot("cnpja_open").expect("snapshot");
    assert_eq!(snapshot.success_count, 1);
    assert_eq!(snapshot.bucket.errors, 1);
    assert!(!snapshot.in_cooldown);
}

#[tokio::test(start_paused = true)]
async fn when_provider_has_no_record_system_reports_not_found_without_cooldown() {
    // Given: A provider that never knows the company
    let missing = ScriptedProvider::new(
        "receitaws",
        vec![Some(ProviderError::not_found("company not found"))],
    );
    let manager = dispatch(vec![missing.clone() as Arc<dyn ProviderAdapter>], 2);

    // When: A key is resolved
    let error = manager.resolve("11222333000181").await.expect_err("exhausted");

    // Then: The failure is final, not a quota problem, and is not retried
    assert!(!error.is_rate_limited());
    assert!(!error.is_retryable());
    assert_eq!(
        error.last_cause().map(ProviderError::kind),
        Some(ProviderErrorKind::NotFound)
    );
    assert_eq!(missing.calls(), 1);
    assert!(!manager.limiter().is_in_cooldown("receitaws"));
}

#[tokio::test(start_paused = true)]
async fn when_key_is_malformed_system_rejects_it_before_any_call() {
    // Given: A healthy provider
    let healthy = ScriptedProvider::new("cnpjws", vec![None]);
    let manager = dispatch(vec![healthy.clone() as Arc<dyn ProviderAdapter>], 3);

    // When: A key with letters is resolved
    let error = manager.resolve("11.222.ABC/0001-81").await.expect_err("invalid");

    // Then: Validation fails and no provider is called
    assert!(matches!(error, DispatchError::InvalidKey(_)));
    assert_eq!(healthy.calls(), 0);
}

// =============================================================================
// Dispatch: Configuration
// =============================================================================

#[test]
fn when_provider_is_disabled_system_leaves_it_out_of_the_quota() {
    // Given: Settings that disable ReceitaWS and raise CNPJa to 10 rpm
    let vars: HashMap<&str, &str> = HashMap::from([
        ("CADASTRO_RECEITAWS_ENABLED", "false"),
        ("CADASTRO_CNPJA_OPEN_RPM", "10"),
    ]);
    let settings =
        Settings::from_lookup(|name| vars.get(name).map(|value| (*value).to_owned()))
            .expect("valid settings");

    // When: The dispatch manager is built offline
    let manager = DispatchManager::from_settings(&settings, true).expect("manager");

    // Then: Only the enabled providers share the pacing budget
    let providers: Vec<&str> = manager.providers().collect();
    assert_eq!(providers, vec!["cnpja_open", "cnpjws"]);
    assert_eq!(manager.total_requests_per_minute(), 13);
}

#[test]
fn when_every_provider_is_disabled_system_refuses_to_start() {
    // Given: Settings with no enabled provider
    let mut settings = Settings::default();
    for provider in &mut settings.providers {
        provider.enabled = false;
    }

    // When: The dispatch manager is built
    let result = DispatchManager::from_settings(&settings, true);

    // Then: It reports that nothing is configured
    assert!(matches!(result, Err(DispatchError::NoProviders)));
}
