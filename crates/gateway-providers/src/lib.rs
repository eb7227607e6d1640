//! Inference backends: the provider capability, the process-wide registry,
//! the Ollama upstream client with model reconciliation, and the
//! chat-to-generate request adapter.

mod adapter;
mod consolidate;
mod ollama;
mod openai_compat;
mod reconcile;
mod registry;

pub use adapter::{convert_chat_to_generate, do_generate_raw_templated, translate_generate_to_chat, ConvertedRequest};
pub use consolidate::{ollama_log_indexer, ollama_response_consolidator};
pub use ollama::{OllamaFactory, OllamaProvider, OllamaUpstream};
pub use openai_compat::{OpenAiCompatFactory, OpenAiCompatProvider};
pub use reconcile::{reconcile_api_show, reconcile_api_tags};
pub use registry::{
    InferenceOptions, JsonStream, Provider, ProviderFactory, ProviderLabel, ProviderRegistry,
};
