//! The gateway binary: CLI parsing, store bootstrap, provider discovery,
//! router assembly.

mod autoname;
mod capture;
mod dto;
mod error;
mod handlers;
mod middleware;
mod pipeline;
mod response;
mod state;
#[cfg(test)]
mod tests_e2e;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{Request, Response};
use axum::routing::{get, head, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use gateway_audit::AuditStore;
use gateway_history::HistoryStore;
use gateway_providers::{OllamaFactory, OllamaUpstream, OpenAiCompatFactory, ProviderRegistry};
use gateway_retrieval::InMemoryKnowledge;

use crate::state::ServerState;

#[derive(Parser, Debug)]
#[command(name = "gateway-server", about = "Local-first chat gateway over Ollama-compatible backends")]
struct Cli {
    /// Filesystem directory to store/read data from (must already exist).
    #[arg(long, default_value = "data/")]
    data_dir: PathBuf,

    #[arg(long, default_value = "127.0.0.1")]
    bind_host: String,

    #[arg(long, default_value_t = 6635)]
    bind_port: u16,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Record server ingress/egress at the HTTP request/response level.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    trace_http: bool,

    /// Apply the simple retrieval policy to any proxied /api/chat call.
    #[arg(long, default_value_t = false)]
    force_ollama_rag: bool,
}

fn ensure_writable_dir(path: &PathBuf) -> Result<()> {
    anyhow::ensure!(
        path.is_dir(),
        "data directory does not exist: {}",
        path.display()
    );
    let probe = path.join(".write-probe");
    std::fs::write(&probe, b"")
        .with_context(|| format!("data directory is not writable: {}", path.display()))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .compact()
        .init();

    ensure_writable_dir(&cli.data_dir)?;

    let audit = Arc::new(
        AuditStore::open(cli.data_dir.join("audit.db")).context("failed to open audit.db")?,
    );
    let history = Arc::new(
        HistoryStore::open(cli.data_dir.join("requests-history.db"))
            .context("failed to open requests-history.db")?,
    );

    let upstream = OllamaUpstream::new(
        std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "http://localhost:11434".to_string()),
    )?;

    let mut registry = ProviderRegistry::new();
    registry.register_factory(Box::new(OllamaFactory::new()));
    registry.register_factory(Box::new(OpenAiCompatFactory::new()));
    let registry = Arc::new(registry);
    registry.discover(&history).await;

    let state = Arc::new(ServerState {
        history,
        audit,
        registry,
        upstream,
        knowledge: Arc::new(InMemoryKnowledge::default()),
        force_ollama_rag: cli.force_ollama_rag,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
            )
        })
        .on_response(
            |res: &Response<Body>, latency: Duration, _span: &tracing::Span| {
                info!(
                    latency = %format!("{} ms", latency.as_millis()),
                    status = %res.status().as_u16(),
                    "finished processing request"
                );
            },
        );

    let mut app = Router::new()
        .route("/", head(handlers::head_ok))
        .route("/health", get(handlers::health))
        .route("/ollama-proxy/api/chat", post(handlers::proxy::api_chat))
        .route("/ollama-proxy/api/generate", post(handlers::proxy::api_generate))
        .route("/ollama-proxy/api/tags", get(handlers::proxy::api_tags))
        .route("/ollama-proxy/api/show", post(handlers::proxy::api_show))
        .route("/ollama-proxy/{*rest}", head(handlers::proxy::head_passthrough))
        .route("/messages", post(handlers::messages::post_message))
        .route("/messages/{message_id}", get(handlers::messages::get_message))
        .route("/sequences", post(handlers::sequences::post_sequence))
        .route("/sequences/.recent/as-ids", get(handlers::sequences::recent_ids))
        .route("/sequences/{sequence_id}", get(handlers::sequences::get_sequence))
        .route(
            "/sequences/{sequence_id}/continue",
            post(handlers::sequences::continue_sequence),
        )
        .route(
            "/sequences/{sequence_id}/extend",
            post(handlers::sequences::extend_sequence),
        )
        .route(
            "/sequences/{sequence_id}/autoname",
            post(handlers::sequences::autoname_sequence_route),
        )
        .route(
            "/sequences/{sequence_id}/add/{message_id}",
            post(handlers::sequences::add_message),
        )
        .layer(cors)
        .layer(trace_layer)
        .with_state(state.clone());

    if cli.trace_http {
        app = app.layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::audit_ingress,
        ));
    }

    let listener = tokio::net::TcpListener::bind((cli.bind_host.as_str(), cli.bind_port))
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.bind_host, cli.bind_port))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("caught shutdown signal, exiting gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
