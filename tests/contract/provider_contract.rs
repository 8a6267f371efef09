use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::json;

use cadastro_core::{
    CnpjWsAdapter, CnpjaOpenAdapter, HttpClient, HttpError, HttpFuture, HttpRequest,
    HttpResponse, ProviderAdapter, ProviderErrorKind, ProviderId, ReceitaWsAdapter, RegistryKey,
    ResolveOptions,
};

/// Replays canned responses and records every request.
#[derive(Default)]
struct RecordingHttpClient {
    responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl RecordingHttpClient {
    fn replying(response: Result<HttpResponse, HttpError>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::from([response])),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl HttpClient for RecordingHttpClient {
    fn execute(&self, request: HttpRequest) -> HttpFuture<'_> {
        self.requests.lock().expect("requests lock").push(request);
        let next = self
            .responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Err(HttpError::new("no canned response left")));
        Box::pin(async move { next })
    }
}

#[derive(Clone, Copy)]
struct ProviderCase {
    id: ProviderId,
    host: &'static str,
    success_body: fn(&str) -> serde_json::Value,
}

impl ProviderCase {
    fn online(&self, http: Arc<RecordingHttpClient>) -> Arc<dyn ProviderAdapter> {
        match self.id {
            ProviderId::ReceitaWs => Arc::new(ReceitaWsAdapter::with_http_client(http, 60)),
            ProviderId::CnpjWs => Arc::new(CnpjWsAdapter::with_http_client(http, 60)),
            ProviderId::CnpjaOpen => Arc::new(CnpjaOpenAdapter::with_http_client(http, 60)),
        }
    }

    fn offline(&self) -> Arc<dyn ProviderAdapter> {
        match self.id {
            ProviderId::ReceitaWs => Arc::new(ReceitaWsAdapter::default()),
            ProviderId::CnpjWs => Arc::new(CnpjWsAdapter::default()),
            ProviderId::CnpjaOpen => Arc::new(CnpjaOpenAdapter::default()),
        }
    }
}

fn provider_cases() -> Vec<ProviderCase> {
    vec![
        ProviderCase {
            id: ProviderId::ReceitaWs,
            host: "receitaws.com.br",
            success_body: |key| {
                json!({
                    "status": "OK",
                    "cnpj": key,
                    "nome": "ACME COMERCIO LTDA",
                    "fantasia": "ACME",
                    "situacao": "ATIVA",
                    "municipio": "SAO PAULO",
                    "uf": "SP",
                    "cep": "01310-100"
                })
            },
        },
        ProviderCase {
            id: ProviderId::CnpjWs,
            host: "publica.cnpj.ws",
            success_body: |key| {
                json!({
                    "razao_social": "ACME COMERCIO LTDA",
                    "estabelecimento": {
                        "cnpj": key,
                        "nome_fantasia": "ACME",
                        "situacao_cadastral": "Ativa",
                        "cep": "01310100",
                        "cidade": {"nome": "SAO PAULO"},
                        "estado": {"sigla": "SP"}
                    }
                })
            },
        },
        ProviderCase {
            id: ProviderId::CnpjaOpen,
            host: "open.cnpja.com",
            success_body: |key| {
                json!({
                    "taxId": key,
                    "alias": "ACME",
                    "company": {"name": "ACME COMERCIO LTDA"},
                    "status": {"id": 2, "text": "Ativa"},
                    "address": {"city": "SAO PAULO", "state": "SP", "zip": "01310100"}
                })
            },
        },
    ]
}

fn key() -> RegistryKey {
    RegistryKey::parse("11.222.333/0001-81").expect("valid key")
}

#[tokio::test]
async fn offline_resolve_returns_normalized_record_for_all_providers() {
    let key = key();
    for case in provider_cases() {
        let adapter = case.offline();
        assert_eq!(adapter.name(), case.id.as_str());
        assert_eq!(
            adapter.requests_per_minute(),
            case.id.default_requests_per_minute()
        );

        let record = adapter
            .resolve(&key, ResolveOptions::default())
            .await
            .unwrap_or_else(|error| panic!("provider '{}' offline resolve failed: {error}", case.id));
        assert_eq!(record.key, key, "provider '{}': key", case.id);
        assert_eq!(record.provider, case.id.as_str(), "provider '{}': name", case.id);
        assert!(
            record.fields.company_name.is_some(),
            "provider '{}': company name",
            case.id
        );
        assert!(record.fields.city.is_some(), "provider '{}': city", case.id);
        assert!(record.raw_payload.is_object(), "provider '{}': raw payload", case.id);
    }
}

#[tokio::test]
async fn offline_records_are_stable_per_key() {
    let key = key();
    for case in provider_cases() {
        let adapter = case.offline();
        let first = adapter.resolve(&key, ResolveOptions::default()).await.expect("first");
        let second = adapter.resolve(&key, ResolveOptions::default()).await.expect("second");
        assert_eq!(first, second, "provider '{}': deterministic fixture", case.id);
    }
}

#[tokio::test]
async fn online_success_parses_body_and_requests_the_bare_key() {
    let key = key();
    for case in provider_cases() {
        let body = (case.success_body)(key.as_str()).to_string();
        let http = RecordingHttpClient::replying(Ok(HttpResponse::ok_json(body)));
        let adapter = case.online(Arc::clone(&http));

        let record = adapter
            .resolve(&key, ResolveOptions::default())
            .await
            .unwrap_or_else(|error| panic!("provider '{}' resolve failed: {error}", case.id));
        assert_eq!(
            record.fields.company_name.as_deref(),
            Some("ACME COMERCIO LTDA"),
            "provider '{}': company name",
            case.id
        );
        assert_eq!(record.fields.trade_name.as_deref(), Some("ACME"), "provider '{}'", case.id);
        assert_eq!(record.fields.city.as_deref(), Some("SAO PAULO"), "provider '{}'", case.id);
        assert_eq!(record.fields.state.as_deref(), Some("SP"), "provider '{}'", case.id);
        assert_eq!(record.fields.zip_code.as_deref(), Some("01310100"), "provider '{}'", case.id);

        let requests = http.requests();
        assert_eq!(requests.len(), 1, "provider '{}': one request", case.id);
        assert!(requests[0].url.contains(case.host), "provider '{}': host", case.id);
        assert!(
            requests[0].url.ends_with("/11222333000181"),
            "provider '{}': bare key in url",
            case.id
        );
        assert_eq!(
            requests[0].headers.get("accept").map(String::as_str),
            Some("application/json"),
            "provider '{}': accept header",
            case.id
        );
    }
}

#[tokio::test]
async fn http_statuses_map_to_error_taxonomy_for_all_providers() {
    let key = key();
    let expectations = [
        (429, ProviderErrorKind::RateLimitExceeded),
        (404, ProviderErrorKind::NotFound),
        (503, ProviderErrorKind::Transient),
        (400, ProviderErrorKind::Fatal),
    ];

    for case in provider_cases() {
        for (status, expected) in expectations {
            let http = RecordingHttpClient::replying(Ok(HttpResponse::new(
                status,
                r#"{"message":"upstream says no"}"#,
            )));
            let adapter = case.online(http);

            let error = adapter
                .resolve(&key, ResolveOptions::default())
                .await
                .expect_err("non-200 must fail");
            assert_eq!(
                error.kind(),
                expected,
                "provider '{}': HTTP {status}",
                case.id
            );
        }
    }
}

#[tokio::test]
async fn transport_timeout_is_transient_for_all_providers() {
    let key = key();
    for case in provider_cases() {
        let http = RecordingHttpClient::replying(Err(HttpError::timeout("deadline elapsed")));
        let adapter = case.online(http);

        let error = adapter
            .resolve(&key, ResolveOptions::default())
            .await
            .expect_err("timeout must fail");
        assert_eq!(error.kind(), ProviderErrorKind::Transient, "provider '{}'", case.id);
        assert!(error.retryable(), "provider '{}': retryable", case.id);
        assert!(error.message().contains("timed out"), "provider '{}'", case.id);
    }
}

#[tokio::test]
async fn unreadable_body_is_fatal_for_all_providers() {
    let key = key();
    for case in provider_cases() {
        let http = RecordingHttpClient::replying(Ok(HttpResponse::ok_json("<html>busy</html>")));
        let adapter = case.online(http);

        let error = adapter
            .resolve(&key, ResolveOptions::default())
            .await
            .expect_err("html body must fail");
        assert_eq!(error.kind(), ProviderErrorKind::Fatal, "provider '{}'", case.id);
        assert!(!error.retryable(), "provider '{}': not retryable", case.id);
    }
}

#[tokio::test]
async fn receitaws_error_payloads_are_classified_by_message() {
    let key = key();
    let cases = [
        (
            HttpResponse::ok_json(r#"{"status":"ERROR","message":"CNPJ inválido"}"#),
            ProviderErrorKind::NotFound,
        ),
        (
            HttpResponse::ok_json(r#"{"status":"ERROR","message":"Too many requests, please try again later."}"#),
            ProviderErrorKind::RateLimitExceeded,
        ),
        (HttpResponse::new(504, ""), ProviderErrorKind::NotFound),
    ];

    for (response, expected) in cases {
        let http = RecordingHttpClient::replying(Ok(response));
        let adapter = ReceitaWsAdapter::with_http_client(http, 60);
        let error = adapter
            .resolve(&key, ResolveOptions::default())
            .await
            .expect_err("error payload must fail");
        assert_eq!(error.kind(), expected);
    }
}
