//! The provider capability and the process-wide registry of backends.
//!
//! The registry is an explicit value held in the server state; maps are
//! written during discovery or on the first request for a label, and read
//! concurrently everywhere else.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use gateway_audit::AuditStore;
use gateway_core::{ChatMessage, GatewayError};
use gateway_history::{FoundationModelRow, HistoryStore};
use gateway_stream::ServerStatusHolder;

/// A boxed stream of Ollama-shaped response chunks.
pub type JsonStream = Pin<Box<dyn Stream<Item = Result<Value, GatewayError>> + Send>>;

/// Names a backend instance, e.g. `ollama` / `http://localhost:11434`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderLabel {
    pub kind: String,
    pub id: String,
}

/// Per-request inference tweaks, resolved against model defaults by the
/// chat-to-generate adapter.
#[derive(Debug, Clone, Default)]
pub struct InferenceOptions {
    pub override_model_template: Option<String>,
    pub override_system_prompt: Option<String>,
    pub seed_assistant_response: Option<String>,
    /// Raw `options` object forwarded from the client request.
    pub request_options: Option<Value>,
}

/// The contract any inference backend must satisfy.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Cheap reachability probe; must not mutate state.
    async fn available(&self) -> bool;

    /// Canonicalised identifier JSON; the ProviderRecord primary key.
    fn identifiers(&self) -> String;

    /// Ensures the ProviderRecord row exists (idempotent).
    fn make_record(&self, history: &HistoryStore) -> Result<(), GatewayError>;

    /// Lists this backend's models, reconciled into the history store.
    /// Cached per instance: the first call hits the backend, later calls
    /// replay.
    async fn list_models(
        &self,
        history: &HistoryStore,
    ) -> Result<Vec<FoundationModelRow>, GatewayError>;

    /// Streams one chat completion as Ollama-shaped chunks. The backend logs
    /// its own InferenceEvent under `reason` but creates no ChatSequences.
    #[allow(clippy::too_many_arguments)]
    async fn chat_nolog(
        &self,
        messages: &[ChatMessage],
        model: &FoundationModelRow,
        options: &InferenceOptions,
        reason: &str,
        status: ServerStatusHolder,
        history: Arc<HistoryStore>,
        audit: Arc<AuditStore>,
    ) -> Result<JsonStream, GatewayError>;
}

/// Builds providers for labels it understands; `try_make` returning `None`
/// means "this factory doesn't handle this label".
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn try_make(&self, label: &ProviderLabel) -> Option<Arc<dyn Provider>>;

    /// Eager probing at startup (e.g. try localhost endpoints), registering
    /// whatever answers.
    async fn discover(&self, registry: &ProviderRegistry, history: &HistoryStore);
}

#[derive(Default)]
pub struct ProviderRegistry {
    factories: Vec<Box<dyn ProviderFactory>>,
    by_label: RwLock<HashMap<ProviderLabel, Arc<dyn Provider>>>,
    by_identifiers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory(&mut self, factory: Box<dyn ProviderFactory>) {
        self.factories.push(factory);
    }

    /// Registers a live provider under a label.
    pub async fn insert(&self, label: ProviderLabel, provider: Arc<dyn Provider>) {
        self.by_identifiers
            .write()
            .await
            .insert(provider.identifiers(), provider.clone());
        self.by_label.write().await.insert(label, provider);
    }

    /// Returns the provider for `label`, building it through the factories on
    /// first use.
    pub async fn try_make(&self, label: &ProviderLabel) -> Option<Arc<dyn Provider>> {
        if let Some(existing) = self.by_label.read().await.get(label) {
            return Some(existing.clone());
        }

        for factory in &self.factories {
            if let Some(provider) = factory.try_make(label).await {
                debug!("provider registry: built {label:?}");
                self.insert(label.clone(), provider.clone()).await;
                return Some(provider);
            }
        }
        None
    }

    /// Runs every factory's eager discovery pass.
    pub async fn discover(&self, history: &HistoryStore) {
        for factory in &self.factories {
            factory.discover(self, history).await;
        }
        let count = self.by_label.read().await.len();
        info!("provider discovery finished: {count} provider(s) registered");
    }

    /// The provider whose record identifiers match the model's.
    pub async fn provider_for_model(
        &self,
        model: &FoundationModelRow,
    ) -> Option<Arc<dyn Provider>> {
        self.by_identifiers
            .read()
            .await
            .get(&model.provider_identifiers)
            .cloned()
    }

    pub async fn labels(&self) -> Vec<ProviderLabel> {
        self.by_label.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider(String);

    #[async_trait]
    impl Provider for StaticProvider {
        async fn available(&self) -> bool {
            true
        }
        fn identifiers(&self) -> String {
            self.0.clone()
        }
        fn make_record(&self, _history: &HistoryStore) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn list_models(
            &self,
            _history: &HistoryStore,
        ) -> Result<Vec<FoundationModelRow>, GatewayError> {
            Ok(Vec::new())
        }
        async fn chat_nolog(
            &self,
            _messages: &[ChatMessage],
            _model: &FoundationModelRow,
            _options: &InferenceOptions,
            _reason: &str,
            _status: ServerStatusHolder,
            _history: Arc<HistoryStore>,
            _audit: Arc<AuditStore>,
        ) -> Result<JsonStream, GatewayError> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    struct StaticFactory;

    #[async_trait]
    impl ProviderFactory for StaticFactory {
        async fn try_make(&self, label: &ProviderLabel) -> Option<Arc<dyn Provider>> {
            (label.kind == "static")
                .then(|| Arc::new(StaticProvider(format!("{{\"id\":\"{}\"}}", label.id))) as _)
        }
        async fn discover(&self, _registry: &ProviderRegistry, _history: &HistoryStore) {}
    }

    #[tokio::test]
    async fn try_make_caches_and_indexes_by_identifiers() {
        let mut registry = ProviderRegistry::new();
        registry.register_factory(Box::new(StaticFactory));

        let label = ProviderLabel {
            kind: "static".into(),
            id: "a".into(),
        };
        let provider = registry.try_make(&label).await.unwrap();
        let again = registry.try_make(&label).await.unwrap();
        assert!(Arc::ptr_eq(&provider, &again));

        let model = FoundationModelRow {
            id: 1,
            human_id: "m".into(),
            first_seen_at: None,
            last_seen: None,
            provider_identifiers: provider.identifiers(),
            model_identifiers: None,
            combined_inference_parameters: None,
        };
        assert!(registry.provider_for_model(&model).await.is_some());
    }

    #[tokio::test]
    async fn unknown_labels_fall_through_every_factory() {
        let mut registry = ProviderRegistry::new();
        registry.register_factory(Box::new(StaticFactory));
        let label = ProviderLabel {
            kind: "llamafile".into(),
            id: "x".into(),
        };
        assert!(registry.try_make(&label).await.is_none());
    }
}
