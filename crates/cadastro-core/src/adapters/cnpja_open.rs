use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use cadastro_store::ExtractedFields;

use crate::adapters::{classify_status, digits, join_address, parse_body, text, Fixture, Transport};
use crate::http_client::{HttpClient, HttpRequest};
use crate::provider::{
    NormalizedRecord, ProviderAdapter, ProviderError, ProviderId, ResolveFuture, ResolveOptions,
};
use crate::RegistryKey;

const BASE_URL: &str = "https://open.cnpja.com/office";
const TIMEOUT: Duration = Duration::from_secs(20);

/// CNPJa open (no key) API.
pub struct CnpjaOpenAdapter {
    transport: Transport,
    requests_per_minute: u32,
}

impl Default for CnpjaOpenAdapter {
    fn default() -> Self {
        Self::offline(ProviderId::CnpjaOpen.default_requests_per_minute())
    }
}

impl CnpjaOpenAdapter {
    pub fn offline(requests_per_minute: u32) -> Self {
        Self {
            transport: Transport::offline(ProviderId::CnpjaOpen.as_str(), requests_per_minute, TIMEOUT),
            requests_per_minute,
        }
    }

    pub fn with_http_client(http: Arc<dyn HttpClient>, requests_per_minute: u32) -> Self {
        Self {
            transport: Transport::online(
                ProviderId::CnpjaOpen.as_str(),
                http,
                requests_per_minute,
                TIMEOUT,
            ),
            requests_per_minute,
        }
    }

    async fn fetch(&self, key: &RegistryKey, options: ResolveOptions) -> Result<Value, ProviderError> {
        if self.transport.is_offline() {
            return Ok(fixture(key));
        }

        let request = HttpRequest::get(format!("{BASE_URL}/{}", key.as_str()))
            .with_header("accept", "application/json")
            .with_timeout(self.transport.timeout());
        let response = self.transport.get(request, options).await?;
        if response.status == 200 {
            parse_body(self.name(), &response)
        } else {
            Err(classify_status(self.name(), &response))
        }
    }
}

pub(crate) fn parse(key: &RegistryKey, body: Value) -> Result<NormalizedRecord, ProviderError> {
    let company_name = text(&body, "/company/name");
    if company_name.is_none() {
        return Err(ProviderError::fatal("cnpja_open response has no company name"));
    }

    let first_of = |list: &str, field: &str| -> Option<String> {
        body.pointer(list)?
            .as_array()?
            .iter()
            .find_map(|entry| text(entry, field))
    };
    let phone = body
        .pointer("/phones")
        .and_then(Value::as_array)
        .and_then(|phones| {
            phones.iter().find_map(|phone| {
                let number = text(phone, "/number")?;
                Some(match text(phone, "/area") {
                    Some(area) => format!("{area}{number}"),
                    None => number,
                })
            })
        });

    let fields = ExtractedFields {
        company_name,
        trade_name: text(&body, "/alias"),
        registration_status: text(&body, "/status/text"),
        address: join_address(&[
            text(&body, "/address/street"),
            text(&body, "/address/number"),
            text(&body, "/address/details"),
            text(&body, "/address/district"),
        ]),
        city: text(&body, "/address/city"),
        state: text(&body, "/address/state"),
        zip_code: digits(text(&body, "/address/zip")),
        email: first_of("/emails", "/address"),
        phone,
        simples_optant: body.pointer("/company/simples/optant").and_then(Value::as_bool),
        simples_since: text(&body, "/company/simples/since"),
    };

    Ok(NormalizedRecord {
        key: key.clone(),
        provider: String::from(ProviderId::CnpjaOpen.as_str()),
        fields,
        raw_payload: body,
    })
}

fn fixture(key: &RegistryKey) -> Value {
    let fixture = Fixture::for_seed(key.seed());
    json!({
        "taxId": key.as_str(),
        "alias": fixture.trade_name,
        "company": {
            "name": fixture.name,
            "simples": {"optant": fixture.simples, "since": "2018-01-01"}
        },
        "status": {"id": 2, "text": "Ativa"},
        "address": {
            "street": "Rua das Flores",
            "number": fixture.number,
            "district": "Centro",
            "city": fixture.city,
            "state": fixture.state,
            "zip": fixture.zip
        },
        "phones": [{"area": "11", "number": "30000000"}],
        "emails": []
    })
}

impl ProviderAdapter for CnpjaOpenAdapter {
    fn name(&self) -> &str {
        ProviderId::CnpjaOpen.as_str()
    }

    fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    fn resolve<'a>(&'a self, key: &'a RegistryKey, options: ResolveOptions) -> ResolveFuture<'a> {
        Box::pin(async move {
            let body = self.fetch(key, options).await?;
            parse(key, body)
        })
    }
}
