//! Shared server state, threaded through every handler.

use std::sync::Arc;

use gateway_audit::AuditStore;
use gateway_history::HistoryStore;
use gateway_providers::{OllamaUpstream, ProviderRegistry};
use gateway_retrieval::KnowledgeStore;

pub struct ServerState {
    pub history: Arc<HistoryStore>,
    pub audit: Arc<AuditStore>,
    pub registry: Arc<ProviderRegistry>,
    pub upstream: OllamaUpstream,
    pub knowledge: Arc<dyn KnowledgeStore>,
    /// Apply the simple retrieval policy to proxied `/api/chat` calls that
    /// didn't ask for one.
    pub force_ollama_rag: bool,
}
