//! OpenAI-compatible chat backend (LM Studio and friends).
//!
//! Speaks the OpenAI chat-completion API and re-emits the delta stream as
//! Ollama-shaped chunks so the rest of the pipeline doesn't care which wire
//! dialect the backend spoke.

use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionStreamOptions, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{info, warn};

use gateway_audit::AuditStore;
use gateway_core::json::canonical_string;
use gateway_core::{wire_timestamp, ChatMessage, GatewayError};
use gateway_history::{FoundationModelCandidate, FoundationModelRow, HistoryStore};
use gateway_stream::{consolidate_and_call, ServerStatusHolder};

use crate::consolidate::ollama_response_consolidator;
use crate::registry::{
    InferenceOptions, JsonStream, Provider, ProviderFactory, ProviderLabel, ProviderRegistry,
};

fn llm_err(err: impl ToString) -> GatewayError {
    GatewayError::UpstreamUnavailable(err.to_string())
}

pub struct OpenAiCompatProvider {
    client: Client<OpenAIConfig>,
    api_base: String,
    model_cache: tokio::sync::Mutex<Option<Vec<FoundationModelRow>>>,
}

impl OpenAiCompatProvider {
    pub fn new(api_base: impl Into<String>) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        let config = OpenAIConfig::new()
            .with_api_base(&api_base)
            .with_api_key("unused-local-key");
        Self {
            client: Client::with_config(config),
            api_base,
            model_cache: tokio::sync::Mutex::new(None),
        }
    }

    fn build_messages(
        messages: &[ChatMessage],
        system_override: Option<&str>,
    ) -> Result<Vec<ChatCompletionRequestMessage>, GatewayError> {
        let mut request_messages = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_override.filter(|s| !s.is_empty()) {
            request_messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()
                    .map_err(llm_err)?,
            ));
        }

        for message in messages {
            let built = match message.role.as_str() {
                "system" => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(&*message.content)
                        .build()
                        .map_err(llm_err)?,
                ),
                "assistant" => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(&*message.content)
                        .build()
                        .map_err(llm_err)?,
                ),
                _ => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(&*message.content)
                        .build()
                        .map_err(llm_err)?,
                ),
            };
            request_messages.push(built);
        }
        Ok(request_messages)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    async fn available(&self) -> bool {
        self.client.models().list().await.is_ok()
    }

    fn identifiers(&self) -> String {
        canonical_string(&json!({
            "endpoint": self.api_base,
            "name": "openai",
            "platform": format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        }))
    }

    fn make_record(&self, history: &HistoryStore) -> Result<(), GatewayError> {
        history.upsert_provider_record(
            &self.identifiers(),
            Some(&json!({
                "arch": std::env::consts::ARCH,
                "os": std::env::consts::OS,
            })),
            Some(&format!("OpenAI-compatible backend at {}", self.api_base)),
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

        let listed = self.client.models().list().await.map_err(llm_err)?;
        let mut rows = Vec::with_capacity(listed.data.len());
        for model in listed.data {
            let first_seen = DateTime::<Utc>::from_timestamp(model.created as i64, 0);
            let candidate = FoundationModelCandidate {
                human_id: model.id,
                provider_identifiers: self.identifiers(),
                model_identifiers: Some(json!({
                    "object": model.object,
                    "owned_by": model.owned_by,
                })),
                combined_inference_parameters: None,
                first_seen_at: first_seen,
                last_seen: Some(Utc::now()),
            };
            let row = match history.lookup_foundation_model_detailed(&candidate)? {
                Some(existing) => history.merge_in_updates(existing.id, &candidate)?,
                None => history.insert_foundation_model(&candidate)?,
            };
            rows.push(row);
        }

        *cache = Some(rows.clone());
        Ok(rows)
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
        let request_messages =
            Self::build_messages(messages, options.override_system_prompt.as_deref())?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&model.human_id)
            .stream_options(ChatCompletionStreamOptions {
                include_usage: true,
            })
            .messages(request_messages)
            .build()
            .map_err(llm_err)?;

        let audit_event = serde_json::to_value(&request)
            .ok()
            .and_then(|body| audit.begin_http_event("openai:/v1/chat/completions", &body));

        let event_id = history.create_inference_event(model.id, reason, None)?;
        status.set(format!("{}: streaming chat completion", model.human_id));

        let upstream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|err| {
                let _ = history.finalize_inference_event(event_id, &json!({}), Some(&err.to_string()));
                llm_err(err)
            })?;

        let human_id = model.human_id.clone();
        let chunks = upstream.map(move |result| match result {
            Ok(response) => {
                if let Some(usage) = response.usage {
                    return Ok(json!({
                        "model": human_id,
                        "created_at": wire_timestamp(Utc::now()),
                        "done": true,
                        "message": {"content": "", "role": "assistant"},
                        "prompt_eval_count": usage.prompt_tokens,
                        "eval_count": usage.completion_tokens,
                    }));
                }
                let content = response
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
                    .unwrap_or_default();
                Ok(json!({
                    "model": human_id,
                    "created_at": wire_timestamp(Utc::now()),
                    "done": false,
                    "message": {"content": content, "role": "assistant"},
                }))
            }
            Err(err) => Err(GatewayError::UpstreamStream(err.to_string())),
        });

        let recorded = consolidate_and_call(
            chunks,
            ollama_response_consolidator,
            Value::Null,
            move |consolidated: Value, stream_err: Option<GatewayError>| async move {
                let error_text = stream_err.as_ref().map(ToString::to_string);
                history.finalize_inference_event(event_id, &consolidated, error_text.as_deref())?;
                if let Some(audit_event) = audit_event {
                    audit.set_http_response(audit_event, &json!({"content": consolidated}));
                }
                match stream_err {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            },
        );

        Ok(Box::pin(recorded))
    }
}

/// Probes OpenAI-compatible local servers (LM Studio's default port).
pub struct OpenAiCompatFactory {
    endpoints: Vec<String>,
}

impl OpenAiCompatFactory {
    pub fn new() -> Self {
        Self {
            endpoints: vec!["http://localhost:1234/v1".to_string()],
        }
    }

    pub fn with_endpoints(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }
}

impl Default for OpenAiCompatFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderFactory for OpenAiCompatFactory {
    async fn try_make(&self, label: &ProviderLabel) -> Option<Arc<dyn Provider>> {
        (label.kind == "openai").then(|| Arc::new(OpenAiCompatProvider::new(&label.id)) as _)
    }

    async fn discover(&self, registry: &ProviderRegistry, history: &HistoryStore) {
        for endpoint in &self.endpoints {
            let provider = Arc::new(OpenAiCompatProvider::new(endpoint));
            if !provider.available().await {
                warn!("openai discovery: {endpoint} unreachable, skipping");
                continue;
            }
            if let Err(err) = provider.make_record(history) {
                warn!("openai discovery: failed to record {endpoint}: {err}");
            }
            info!("openai discovery: registered {endpoint}");
            registry
                .insert(
                    ProviderLabel {
                        kind: "openai".into(),
                        id: endpoint.clone(),
                    },
                    provider,
                )
                .await;
        }
    }
}
