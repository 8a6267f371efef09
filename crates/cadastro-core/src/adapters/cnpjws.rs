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

const BASE_URL: &str = "https://publica.cnpj.ws/cnpj";
const TIMEOUT: Duration = Duration::from_secs(15);

/// CNPJ.ws public API.
pub struct CnpjWsAdapter {
    transport: Transport,
    requests_per_minute: u32,
}

impl Default for CnpjWsAdapter {
    fn default() -> Self {
        Self::offline(ProviderId::CnpjWs.default_requests_per_minute())
    }
}

impl CnpjWsAdapter {
    pub fn offline(requests_per_minute: u32) -> Self {
        Self {
            transport: Transport::offline(ProviderId::CnpjWs.as_str(), requests_per_minute, TIMEOUT),
            requests_per_minute,
        }
    }

    pub fn with_http_client(http: Arc<dyn HttpClient>, requests_per_minute: u32) -> Self {
        Self {
            transport: Transport::online(
                ProviderId::CnpjWs.as_str(),
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
    let company_name = text(&body, "/razao_social");
    if company_name.is_none() {
        return Err(ProviderError::fatal("cnpjws response has no company name"));
    }

    let street = match (
        text(&body, "/estabelecimento/tipo_logradouro"),
        text(&body, "/estabelecimento/logradouro"),
    ) {
        (Some(kind), Some(street)) => Some(format!("{kind} {street}")),
        (None, street) => street,
        (kind, None) => kind,
    };
    let phone = text(&body, "/estabelecimento/telefone1").map(|number| {
        match text(&body, "/estabelecimento/ddd1") {
            Some(area) => format!("{area}{number}"),
            None => number,
        }
    });
    let simples_optant = text(&body, "/simples/simples").map(|flag| flag.eq_ignore_ascii_case("sim"));

    let fields = ExtractedFields {
        company_name,
        trade_name: text(&body, "/estabelecimento/nome_fantasia"),
        registration_status: text(&body, "/estabelecimento/situacao_cadastral"),
        address: join_address(&[
            street,
            text(&body, "/estabelecimento/numero"),
            text(&body, "/estabelecimento/complemento"),
            text(&body, "/estabelecimento/bairro"),
        ]),
        city: text(&body, "/estabelecimento/cidade/nome"),
        state: text(&body, "/estabelecimento/estado/sigla"),
        zip_code: digits(text(&body, "/estabelecimento/cep")),
        email: text(&body, "/estabelecimento/email"),
        phone,
        simples_optant,
        simples_since: text(&body, "/simples/data_opcao_simples"),
    };

    Ok(NormalizedRecord {
        key: key.clone(),
        provider: String::from(ProviderId::CnpjWs.as_str()),
        fields,
        raw_payload: body,
    })
}

fn fixture(key: &RegistryKey) -> Value {
    let fixture = Fixture::for_seed(key.seed());
    json!({
        "razao_social": fixture.name,
        "estabelecimento": {
            "cnpj": key.as_str(),
            "nome_fantasia": fixture.trade_name,
            "situacao_cadastral": "Ativa",
            "tipo_logradouro": "RUA",
            "logradouro": "DAS FLORES",
            "numero": fixture.number,
            "bairro": "CENTRO",
            "cep": fixture.zip,
            "cidade": {"nome": fixture.city},
            "estado": {"sigla": fixture.state},
            "ddd1": "11",
            "telefone1": "30000000",
            "email": null
        },
        "simples": {
            "simples": if fixture.simples { "Sim" } else { "Não" },
            "data_opcao_simples": "2018-01-01"
        }
    })
}

impl ProviderAdapter for CnpjWsAdapter {
    fn name(&self) -> &str {
        ProviderId::CnpjWs.as_str()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::ScriptedHttpClient;
    use crate::http_client::{HttpError, HttpResponse};
    use crate::provider::ProviderErrorKind;

    fn key() -> RegistryKey {
        RegistryKey::parse("11222333000181").expect("valid key")
    }

    #[test]
    fn test_parse_joins_phone_and_street() {
        let body = json!({
            "razao_social": "ACME LTDA",
            "estabelecimento": {
                "nome_fantasia": "ACME",
                "tipo_logradouro": "AVENIDA",
                "logradouro": "PAULISTA",
                "numero": "1000",
                "cep": "01310100",
                "cidade": {"nome": "São Paulo"},
                "estado": {"sigla": "SP"},
                "ddd1": "11",
                "telefone1": "40000000"
            },
            "simples": {"simples": "Sim", "data_opcao_simples": "2019-01-01"}
        });

        let record = parse(&key(), body).expect("parse");

        assert_eq!(record.fields.address.as_deref(), Some("AVENIDA PAULISTA, 1000"));
        assert_eq!(record.fields.phone.as_deref(), Some("1140000000"));
        assert_eq!(record.fields.city.as_deref(), Some("São Paulo"));
        assert_eq!(record.fields.simples_optant, Some(true));
    }

    #[tokio::test]
    async fn test_timeouts_are_transient() {
        let http = Arc::new(ScriptedHttpClient::replying(vec![Err(HttpError::timeout(
            "deadline elapsed",
        ))]));
        let adapter = CnpjWsAdapter::with_http_client(http, 3);

        let error = adapter
            .resolve(&key(), ResolveOptions::default())
            .await
            .expect_err("timeout");
        assert_eq!(error.kind(), ProviderErrorKind::Transient);
        assert!(error.message().contains("timed out"));
    }

    #[tokio::test]
    async fn test_http_429_is_rate_limited() {
        let http = Arc::new(ScriptedHttpClient::replying(vec![Ok(HttpResponse::new(429, ""))]));
        let adapter = CnpjWsAdapter::with_http_client(http, 3);

        let error = adapter
            .resolve(&key(), ResolveOptions::default())
            .await
            .expect_err("429");
        assert!(error.is_rate_limited());
    }

    #[tokio::test]
    async fn test_offline_fixture_parses() {
        let record = CnpjWsAdapter::default()
            .resolve(&key(), ResolveOptions::default())
            .await
            .expect("fixture");
        assert!(record.fields.company_name.is_some());
        assert_eq!(record.fields.email, None);
    }
}
