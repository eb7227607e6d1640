//! The long-lived HTTP client for an upstream Ollama daemon, and the
//! Provider implementation wrapping it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, TryStreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use gateway_audit::AuditStore;
use gateway_core::json::canonical_string;
use gateway_core::{ChatMessage, GatewayError};
use gateway_history::{FoundationModelRow, HistoryStore};
use gateway_stream::ServerStatusHolder;

use crate::adapter::{convert_chat_to_generate, do_generate_raw_templated, translate_generate_to_chat};
use crate::reconcile::reconcile_api_tags;
use crate::registry::{
    InferenceOptions, JsonStream, Provider, ProviderFactory, ProviderLabel, ProviderRegistry,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// `/api/show` is called in bursts during discovery; give it more headroom
/// than the probe endpoints.
const SHOW_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for one Ollama endpoint.
///
/// Connect timeout is short; the read timeout is unbounded because inference
/// streams can run for tens of minutes. Pooled connection reuse is disabled
/// so any request is free to open a fresh connection.
#[derive(Clone)]
pub struct OllamaUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaUpstream {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(0)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| GatewayError::UpstreamUnavailable(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Canonicalised identifier string for this endpoint.
    pub fn identifiers(&self) -> String {
        canonical_string(&json!({
            "endpoint": self.base_url,
            "name": "ollama",
            "platform": format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        }))
    }

    pub fn machine_info(&self) -> Value {
        json!({
            "arch": std::env::consts::ARCH,
            "os": std::env::consts::OS,
        })
    }

    /// Reachability probe; never mutates state.
    pub async fn available(&self) -> bool {
        self.client
            .head(&self.base_url)
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    pub async fn api_tags(&self) -> Result<Value, GatewayError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|err| GatewayError::UpstreamUnavailable(format!("/api/tags: {err}")))?;
        response
            .json()
            .await
            .map_err(|err| GatewayError::UpstreamUnavailable(format!("/api/tags decode: {err}")))
    }

    pub async fn api_show(&self, model_name: &str) -> Result<Value, GatewayError> {
        let response = self
            .client
            .post(format!("{}/api/show", self.base_url))
            .timeout(SHOW_TIMEOUT)
            .json(&json!({"name": model_name}))
            .send()
            .await
            .map_err(|err| GatewayError::UpstreamUnavailable(format!("/api/show: {err}")))?;
        response
            .json()
            .await
            .map_err(|err| GatewayError::UpstreamUnavailable(format!("/api/show decode: {err}")))
    }

    /// Opens a streaming `/api/generate` call.
    pub async fn generate_stream(
        &self,
        body: &Value,
    ) -> Result<impl Stream<Item = Result<Bytes, GatewayError>>, GatewayError> {
        self.open_stream("/api/generate", body).await
    }

    /// Opens a streaming `/api/chat` call, the raw-forwarding fallback when
    /// template substitution is impossible.
    pub async fn chat_stream(
        &self,
        body: &Value,
    ) -> Result<impl Stream<Item = Result<Bytes, GatewayError>>, GatewayError> {
        self.open_stream("/api/chat", body).await
    }

    async fn open_stream(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<impl Stream<Item = Result<Bytes, GatewayError>>, GatewayError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|err| GatewayError::UpstreamUnavailable(format!("{path}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamUnavailable(format!(
                "{path} returned {status}: {detail}"
            )));
        }

        Ok(response
            .bytes_stream()
            .map_err(|err| GatewayError::UpstreamStream(err.to_string())))
    }

    /// Transparent passthrough used by the HEAD probe routes; no audit.
    pub async fn forward_head(&self, path: &str) -> Result<u16, GatewayError> {
        let response = self
            .client
            .head(format!("{}{path}", self.base_url))
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await
            .map_err(|err| GatewayError::UpstreamUnavailable(err.to_string()))?;
        Ok(response.status().as_u16())
    }
}

pub struct OllamaProvider {
    upstream: OllamaUpstream,
    model_cache: tokio::sync::Mutex<Option<Vec<FoundationModelRow>>>,
}

impl OllamaProvider {
    pub fn new(upstream: OllamaUpstream) -> Self {
        Self {
            upstream,
            model_cache: tokio::sync::Mutex::new(None),
        }
    }

    pub fn upstream(&self) -> &OllamaUpstream {
        &self.upstream
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn available(&self) -> bool {
        self.upstream.available().await
    }

    fn identifiers(&self) -> String {
        self.upstream.identifiers()
    }

    fn make_record(&self, history: &HistoryStore) -> Result<(), GatewayError> {
        history.upsert_provider_record(
            &self.identifiers(),
            Some(&self.upstream.machine_info()),
            Some(&format!("ollama at {}", self.upstream.base_url())),
        )
    }

    async fn list_models(
        &self,
        history: &HistoryStore,
    ) -> Result<Vec<FoundationModelRow>, GatewayError> {
        let mut cache = self.model_cache.lock().await;
        if let Some(models) = cache.as_ref() {
            return Ok(models.clone());
        }

        let tags = self.upstream.api_tags().await?;
        let models = reconcile_api_tags(history, &self.identifiers(), Utc::now(), &tags)?;
        debug!(
            "ollama {}: listed {} model(s)",
            self.upstream.base_url(),
            models.len()
        );
        *cache = Some(models.clone());
        Ok(models)
    }

    async fn chat_nolog(
        &self,
        messages: &[ChatMessage],
        model: &FoundationModelRow,
        options: &InferenceOptions,
        reason: &str,
        status: ServerStatusHolder,
        history: Arc<HistoryStore>,
        audit: Arc<AuditStore>,
    ) -> Result<JsonStream, GatewayError> {
        let mut chat_body = json!({
            "model": model.human_id.clone(),
            "messages": messages,
        });
        if let Some(request_options) = &options.request_options {
            chat_body["options"] = request_options.clone();
        }
        let converted = convert_chat_to_generate(&chat_body, model, options, None, None)?;

        status.set(format!(
            "{}: forwarding {} message(s) to /api/generate",
            model.human_id,
            messages.len()
        ));
        let generate_chunks = do_generate_raw_templated(
            &self.upstream,
            history,
            audit,
            model,
            converted.generate_body,
            reason,
        )
        .await?;

        Ok(Box::pin(translate_generate_to_chat(generate_chunks)))
    }
}

/// Builds Ollama providers, eagerly probing the local daemon at startup.
pub struct OllamaFactory {
    endpoints: Vec<String>,
}

impl OllamaFactory {
    pub fn new() -> Self {
        let default = std::env::var("OLLAMA_HOST")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        Self {
            endpoints: vec![default],
        }
    }

    pub fn with_endpoints(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }
}

impl Default for OllamaFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderFactory for OllamaFactory {
    async fn try_make(&self, label: &ProviderLabel) -> Option<Arc<dyn Provider>> {
        if label.kind != "ollama" {
            return None;
        }
        let upstream = OllamaUpstream::new(label.id.clone()).ok()?;
        Some(Arc::new(OllamaProvider::new(upstream)))
    }

    async fn discover(&self, registry: &ProviderRegistry, history: &HistoryStore) {
        for endpoint in &self.endpoints {
            let Ok(upstream) = OllamaUpstream::new(endpoint.clone()) else {
                continue;
            };
            if !upstream.available().await {
                warn!("ollama discovery: {endpoint} unreachable, skipping");
                continue;
            }

            let provider = Arc::new(OllamaProvider::new(upstream));
            if let Err(err) = provider.make_record(history) {
                warn!("ollama discovery: failed to record {endpoint}: {err}");
            }
            info!("ollama discovery: registered {endpoint}");
            registry
                .insert(
                    ProviderLabel {
                        kind: "ollama".into(),
                        id: endpoint.clone(),
                    },
                    provider,
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::do_generate_raw_templated;
    use futures::StreamExt;
    use gateway_history::FoundationModelCandidate;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn upstream_with_tags() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [
                    {
                        "name": "llama3:8b",
                        "modified_at": "2024-04-20T10:00:00Z",
                        "details": {"format": "gguf", "parameter_size": "8B"},
                    },
                ],
            })))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn list_models_reconciles_then_replays_from_cache() {
        let server = upstream_with_tags().await;
        let history = HistoryStore::open_in_memory().unwrap();
        let provider = OllamaProvider::new(OllamaUpstream::new(server.uri()).unwrap());

        let first = provider.list_models(&history).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].human_id, "llama3:8b");

        // Second call must not hit the backend again (mock expects 1 call).
        let second = provider.list_models(&history).await.unwrap();
        assert_eq!(second[0].id, first[0].id);
    }

    #[tokio::test]
    async fn generate_helper_logs_its_own_inference_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                concat!(
                    "{\"model\":\"m1\",\"created_at\":\"2024-05-01T12:00:00Z\",",
                    "\"response\":\"out\",\"done\":true,\"eval_count\":1,\"eval_duration\":1000000000}\n",
                ),
                "application/x-ndjson",
            ))
            .mount(&server)
            .await;

        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let audit = Arc::new(AuditStore::open_in_memory().unwrap());
        let upstream = OllamaUpstream::new(server.uri()).unwrap();
        let model = history
            .insert_foundation_model(&FoundationModelCandidate {
                human_id: "m1".into(),
                provider_identifiers: upstream.identifiers(),
                ..Default::default()
            })
            .unwrap();

        let body = serde_json::json!({
            "model": "m1",
            "prompt": "TEMPLATED",
            "raw": true,
            "stream": true,
        });
        let chunks =
            do_generate_raw_templated(&upstream, history.clone(), audit, &model, body, "prompt")
                .await
                .unwrap();
        let collected: Vec<_> = chunks.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(collected.len(), 1);

        let event = history.get_inference_event(1).unwrap().unwrap();
        assert_eq!(event.prompt_with_templating.as_deref(), Some("TEMPLATED"));
        assert_eq!(event.response_tokens, Some(1));
        assert_eq!(event.response_error, None);
        assert_eq!(event.reason.as_deref(), Some("prompt"));
    }

    #[tokio::test]
    async fn unreachable_upstream_records_the_failure() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let audit = Arc::new(AuditStore::open_in_memory().unwrap());
        // Nothing listens here.
        let upstream = OllamaUpstream::new("http://127.0.0.1:1").unwrap();
        let model = history
            .insert_foundation_model(&FoundationModelCandidate {
                human_id: "m1".into(),
                provider_identifiers: upstream.identifiers(),
                ..Default::default()
            })
            .unwrap();

        let result = do_generate_raw_templated(
            &upstream,
            history.clone(),
            audit,
            &model,
            serde_json::json!({"model": "m1", "prompt": "p"}),
            "prompt",
        )
        .await;
        assert!(result.is_err());

        let event = history.get_inference_event(1).unwrap().unwrap();
        assert!(event.response_error.is_some());
    }
}
