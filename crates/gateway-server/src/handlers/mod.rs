//! HTTP route handlers for the gateway server.

pub mod messages;
pub mod proxy;
pub mod sequences;

/// Health check endpoint.
pub async fn health() -> &'static str {
    "OK"
}

/// Clients probe `HEAD /` to decide whether the server is an Ollama; answer
/// like one.
pub async fn head_ok() {}
