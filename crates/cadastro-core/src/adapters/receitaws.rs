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

const BASE_URL: &str = "https://receitaws.com.br/v1/cnpj";
const TIMEOUT: Duration = Duration::from_secs(30);

/// ReceitaWS public API.
pub struct ReceitaWsAdapter {
    transport: Transport,
    requests_per_minute: u32,
}

impl Default for ReceitaWsAdapter {
    fn default() -> Self {
        Self::offline(ProviderId::ReceitaWs.default_requests_per_minute())
    }
}

impl ReceitaWsAdapter {
    pub fn offline(requests_per_minute: u32) -> Self {
        Self {
            transport: Transport::offline(ProviderId::ReceitaWs.as_str(), requests_per_minute, TIMEOUT),
            requests_per_minute,
        }
    }

    pub fn with_http_client(http: Arc<dyn HttpClient>, requests_per_minute: u32) -> Self {
        Self {
            transport: Transport::online(
                ProviderId::ReceitaWs.as_str(),
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
        match response.status {
            200 => parse_body(self.name(), &response),
            // The upstream lookup times out for keys it does not know.
            504 => Err(ProviderError::not_found(
                "receitaws lookup timed out upstream; key not found",
            )),
            _ => Err(classify_status(self.name(), &response)),
        }
    }
}

/// Normalize a ReceitaWS body.
pub(crate) fn parse(key: &RegistryKey, body: Value) -> Result<NormalizedRecord, ProviderError> {
    if let Some(status) = text(&body, "/status") {
        if status.eq_ignore_ascii_case("ERROR") {
            let message = text(&body, "/message").unwrap_or_else(|| String::from("unknown error"));
            let lowered = message.to_lowercase();
            if lowered.contains("too many") || lowered.contains("limite") {
                return Err(ProviderError::rate_limited(format!("receitaws: {message}")));
            }
            return Err(ProviderError::not_found(format!("receitaws: {message}")));
        }
    }

    let company_name = text(&body, "/nome");
    if company_name.is_none() {
        return Err(ProviderError::fatal("receitaws response has no company name"));
    }

    let fields = ExtractedFields {
        company_name,
        trade_name: text(&body, "/fantasia"),
        registration_status: text(&body, "/situacao"),
        address: join_address(&[
            text(&body, "/logradouro"),
            text(&body, "/numero"),
            text(&body, "/complemento"),
            text(&body, "/bairro"),
        ]),
        city: text(&body, "/municipio"),
        state: text(&body, "/uf"),
        zip_code: digits(text(&body, "/cep")),
        email: text(&body, "/email"),
        phone: text(&body, "/telefone"),
        simples_optant: body.pointer("/simples/optante").and_then(Value::as_bool),
        simples_since: text(&body, "/simples/data_opcao"),
    };

    Ok(NormalizedRecord {
        key: key.clone(),
        provider: String::from(ProviderId::ReceitaWs.as_str()),
        fields,
        raw_payload: body,
    })
}

fn fixture(key: &RegistryKey) -> Value {
    let fixture = Fixture::for_seed(key.seed());
    json!({
        "status": "OK",
        "cnpj": key.formatted(),
        "nome": fixture.name,
        "fantasia": fixture.trade_name,
        "situacao": "ATIVA",
        "logradouro": "RUA DAS FLORES",
        "numero": fixture.number,
        "complemento": "",
        "bairro": "CENTRO",
        "municipio": fixture.city,
        "uf": fixture.state,
        "cep": format!("{}-{}", &fixture.zip[..5], &fixture.zip[5..]),
        "email": "",
        "telefone": "(11) 3000-0000",
        "simples": {"optante": fixture.simples, "data_opcao": "2018-01-01"},
    })
}

impl ProviderAdapter for ReceitaWsAdapter {
    fn name(&self) -> &str {
        ProviderId::ReceitaWs.as_str()
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
