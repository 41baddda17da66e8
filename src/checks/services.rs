//! Live probes against the external APIs the workflows depend on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::env_vars::{
    EnvSnapshot, AIRTABLE_API_KEY, AIRTABLE_BASE_ID, APIFY_API_TOKEN, N8N_API_KEY, OPENAI_API_KEY,
};
use super::{CheckCategory, CheckError, CheckOutcome};
use crate::config::ServicesConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Apify,
    OpenAi,
    Airtable,
    N8n,
}

impl ServiceKind {
    /// Pipeline order: scrape, analyse, store, automate.
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::Apify,
        ServiceKind::OpenAi,
        ServiceKind::Airtable,
        ServiceKind::N8n,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Apify => "apify",
            ServiceKind::OpenAi => "openai",
            ServiceKind::Airtable => "airtable",
            ServiceKind::N8n => "n8n",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub service: ServiceKind,
    pub success: bool,
    pub http_status: Option<u16>,
    pub latency_ms: u64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CheckError>,
}

impl ProbeResult {
    pub fn to_outcome(&self) -> CheckOutcome {
        let outcome = match &self.error {
            None => CheckOutcome::pass(CheckCategory::Service, self.service.label(), self.message.clone()),
            Some(e) => CheckOutcome::fail(CheckCategory::Service, self.service.label(), e.clone()),
        };
        outcome.with_latency(self.latency_ms)
    }
}

#[async_trait]
pub trait ServiceProbe: Send + Sync {
    fn service(&self) -> ServiceKind;
    async fn probe(&self) -> ProbeResult;
}

#[derive(Debug, Clone)]
enum ProbeTarget {
    Ready {
        url: String,
        headers: Vec<(&'static str, String)>,
    },
    /// A required credential is absent; no request is made.
    Unconfigured(CheckError),
}

/// A GET request whose status code decides service health.
pub struct HttpProbe {
    service: ServiceKind,
    client: reqwest::Client,
    target: ProbeTarget,
}

/// Maps a non-success HTTP status onto the check taxonomy.
pub fn classify_status(service: ServiceKind, status: StatusCode, headers: &HeaderMap, body: &str) -> CheckError {
    let service = service.label().to_string();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CheckError::ApiAuthenticationFailed {
            service,
            status: status.as_u16(),
        },
        StatusCode::TOO_MANY_REQUESTS => CheckError::RateLimited {
            service,
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok()),
        },
        _ => CheckError::UnexpectedStatus {
            service,
            status: status.as_u16(),
            message: summarize_body(body, status),
        },
    }
}

fn summarize_body(body: &str, status: StatusCode) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body).ok().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .or_else(|| v.get("error"))
            .and_then(|m| m.as_str().map(str::to_string))
    });
    let text = from_json.unwrap_or_else(|| body.trim().chars().take(200).collect());
    if text.is_empty() {
        status.canonical_reason().unwrap_or("unknown error").to_string()
    } else {
        text
    }
}

impl HttpProbe {
    pub fn new(service: ServiceKind, client: reqwest::Client, url: String, headers: Vec<(&'static str, String)>) -> Self {
        Self {
            service,
            client,
            target: ProbeTarget::Ready { url, headers },
        }
    }

    pub fn unconfigured(service: ServiceKind, client: reqwest::Client, error: CheckError) -> Self {
        Self {
            service,
            client,
            target: ProbeTarget::Unconfigured(error),
        }
    }
}

#[async_trait]
impl ServiceProbe for HttpProbe {
    fn service(&self) -> ServiceKind {
        self.service
    }

    async fn probe(&self) -> ProbeResult {
        let (url, headers) = match &self.target {
            ProbeTarget::Unconfigured(error) => {
                return ProbeResult {
                    service: self.service,
                    success: false,
                    http_status: None,
                    latency_ms: 0,
                    message: error.to_string(),
                    error: Some(error.clone()),
                };
            }
            ProbeTarget::Ready { url, headers } => (url, headers),
        };

        let started = Instant::now();
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = request.send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(target: "viralcast::checks::services", service = %self.service, latency_ms, "Probe succeeded");
                ProbeResult {
                    service: self.service,
                    success: true,
                    http_status: Some(resp.status().as_u16()),
                    latency_ms,
                    message: format!("{} responded in {}ms", self.service, latency_ms),
                    error: None,
                }
            }
            Ok(resp) => {
                let status = resp.status();
                let headers = resp.headers().clone();
                let body = resp.text().await.unwrap_or_default();
                let error = classify_status(self.service, status, &headers, &body);
                tracing::warn!(target: "viralcast::checks::services", service = %self.service, status = status.as_u16(), error = %error, "Probe failed");
                ProbeResult {
                    service: self.service,
                    success: false,
                    http_status: Some(status.as_u16()),
                    latency_ms,
                    message: error.to_string(),
                    error: Some(error),
                }
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    format!("timed out after {}ms", latency_ms)
                } else if e.is_connect() {
                    "connection failed".to_string()
                } else {
                    e.to_string()
                };
                let error = CheckError::ApiUnreachable {
                    service: self.service.label().to_string(),
                    reason,
                };
                tracing::warn!(target: "viralcast::checks::services", service = %self.service, error = %error, "Probe could not reach service");
                ProbeResult {
                    service: self.service,
                    success: false,
                    http_status: None,
                    latency_ms,
                    message: error.to_string(),
                    error: Some(error),
                }
            }
        }
    }
}

pub fn http_client(config: &ServicesConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .user_agent(concat!("viralcast/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("checks::services: failed to build HTTP client")
}

fn base(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// One probe per external service, in pipeline order.
pub fn build_probes(config: &ServicesConfig, env: &EnvSnapshot) -> Result<Vec<Arc<dyn ServiceProbe>>> {
    let client = http_client(config)?;

    let probe = |service: ServiceKind| -> HttpProbe {
        let built = match service {
            ServiceKind::Apify => env.require(APIFY_API_TOKEN).map(|token| {
                (
                    format!("{}/v2/users/me", base(&config.apify_base_url)),
                    vec![("Authorization", format!("Bearer {}", token))],
                )
            }),
            ServiceKind::OpenAi => env.require(OPENAI_API_KEY).map(|key| {
                (
                    format!("{}/v1/models", base(&config.openai_base_url)),
                    vec![("Authorization", format!("Bearer {}", key))],
                )
            }),
            ServiceKind::Airtable => env.require(AIRTABLE_API_KEY).and_then(|key| {
                env.require(AIRTABLE_BASE_ID).map(|base_id| {
                    (
                        format!("{}/v0/meta/bases/{}/tables", base(&config.airtable_base_url), base_id),
                        vec![("Authorization", format!("Bearer {}", key))],
                    )
                })
            }),
            ServiceKind::N8n => env.require(N8N_API_KEY).map(|key| {
                (
                    format!("{}/api/v1/workflows?limit=1", base(&config.n8n_base_url)),
                    vec![("X-N8N-API-KEY", key.to_string())],
                )
            }),
        };
        match built {
            Ok((url, headers)) => HttpProbe::new(service, client.clone(), url, headers),
            Err(e) => HttpProbe::unconfigured(service, client.clone(), e),
        }
    };

    Ok(ServiceKind::ALL
        .iter()
        .map(|kind| Arc::new(probe(*kind)) as Arc<dyn ServiceProbe>)
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::checks::env_vars::NOTIFICATION_EMAIL;
    use poem::http::StatusCode as PoemStatus;
    use poem::listener::{Acceptor, Listener, TcpListener};
    use poem::{get, handler, Response, Route, Server};

    pub(crate) fn test_env() -> EnvSnapshot {
        EnvSnapshot::from_pairs([
            (OPENAI_API_KEY, "sk-test-1234567890"),
            (AIRTABLE_API_KEY, "patABCDEFGHIJKL"),
            (AIRTABLE_BASE_ID, "appXYZ123456789"),
            (APIFY_API_TOKEN, "apify_api_abcdefgh"),
            (N8N_API_KEY, "n8n-key-123456"),
            (NOTIFICATION_EMAIL, "team@example.com"),
        ])
    }

    #[handler]
    fn ok() -> &'static str {
        "{\"data\": []}"
    }

    #[handler]
    fn unauthorized() -> Response {
        Response::builder()
            .status(PoemStatus::UNAUTHORIZED)
            .body("{\"error\": {\"message\": \"Incorrect API key provided\"}}")
    }

    #[handler]
    fn limited() -> Response {
        Response::builder()
            .status(PoemStatus::TOO_MANY_REQUESTS)
            .header("Retry-After", "42")
            .body("slow down")
    }

    #[handler]
    fn broken() -> Response {
        Response::builder()
            .status(PoemStatus::BAD_GATEWAY)
            .body("{\"message\": \"upstream exploded\"}")
    }

    /// Serves canned API responses on an ephemeral port; returns its base URL.
    pub(crate) async fn spawn_mock_api() -> String {
        let app = Route::new()
            .at("/v1/models", get(ok))
            .at("/v2/users/me", get(unauthorized))
            .at("/v0/meta/bases/:base/tables", get(limited))
            .at("/api/v1/workflows", get(broken));
        let acceptor = TcpListener::bind("127.0.0.1:0").into_acceptor().await.unwrap();
        let addr = acceptor.local_addr()[0]
            .as_socket_addr()
            .cloned()
            .unwrap();
        tokio::spawn(async move {
            let _ = Server::new_with_acceptor(acceptor).run(app).await;
        });
        format!("http://{}", addr)
    }

    fn services_at(base_url: &str) -> ServicesConfig {
        ServicesConfig {
            openai_base_url: base_url.to_string(),
            airtable_base_url: base_url.to_string(),
            apify_base_url: base_url.to_string(),
            n8n_base_url: base_url.to_string(),
            timeout_secs: 5,
        }
    }

    async fn probe_all(config: &ServicesConfig, env: &EnvSnapshot) -> Vec<ProbeResult> {
        let probes = build_probes(config, env).unwrap();
        let mut results = Vec::new();
        for probe in probes {
            results.push(probe.probe().await);
        }
        results
    }

    #[tokio::test]
    async fn statuses_map_onto_the_taxonomy() {
        let base_url = spawn_mock_api().await;
        let results = probe_all(&services_at(&base_url), &test_env()).await;
        let by_service = |kind| results.iter().find(|r| r.service == kind).unwrap();

        let openai = by_service(ServiceKind::OpenAi);
        assert!(openai.success);
        assert_eq!(openai.http_status, Some(200));

        assert_eq!(
            by_service(ServiceKind::Apify).error,
            Some(CheckError::ApiAuthenticationFailed {
                service: "apify".into(),
                status: 401
            })
        );
        assert_eq!(
            by_service(ServiceKind::Airtable).error,
            Some(CheckError::RateLimited {
                service: "airtable".into(),
                retry_after: Some(42)
            })
        );
        assert_eq!(
            by_service(ServiceKind::N8n).error,
            Some(CheckError::UnexpectedStatus {
                service: "n8n".into(),
                status: 502,
                message: "upstream exploded".into()
            })
        );
    }

    #[tokio::test]
    async fn unreachable_services_become_results_not_errors() {
        let results = probe_all(&services_at("http://127.0.0.1:1"), &test_env()).await;
        assert_eq!(results.len(), 4);
        for result in &results {
            assert!(!result.success);
            assert!(matches!(result.error, Some(CheckError::ApiUnreachable { .. })));
        }
    }

    #[tokio::test]
    async fn missing_credentials_skip_the_network() {
        let results = probe_all(&services_at("http://127.0.0.1:1"), &EnvSnapshot::default()).await;
        for result in &results {
            assert!(matches!(
                result.error,
                Some(CheckError::MissingEnvironmentVariable { .. })
            ));
            assert_eq!(result.latency_ms, 0);
        }
    }

    #[test]
    fn body_summary_prefers_json_messages() {
        assert_eq!(
            summarize_body("{\"error\": {\"message\": \"bad key\"}}", StatusCode::BAD_REQUEST),
            "bad key"
        );
        assert_eq!(summarize_body("", StatusCode::NOT_FOUND), "Not Found");
    }
}
