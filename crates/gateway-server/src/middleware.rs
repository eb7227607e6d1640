//! Ingress audit middleware: every client-facing request/response pair lands
//! in the audit DB, streaming bodies included.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde_json::{json, Value};

use gateway_audit::{scrub_images, wrap_streaming_body};

use crate::state::ServerState;

fn headers_to_json(headers: &axum::http::HeaderMap) -> Value {
    let mut out = serde_json::Map::new();
    for (name, value) in headers {
        out.insert(
            name.to_string(),
            json!(value.to_str().unwrap_or("[non-utf8]")),
        );
    }
    Value::Object(out)
}

/// Buffers the request body (scrubbing image payloads for the audit copy),
/// commits the request half before the handler runs, and re-commits the
/// response body as it streams out.
pub async fn audit_ingress(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    let audited_body = match serde_json::from_slice::<Value>(&body_bytes) {
        Ok(mut parsed) => {
            scrub_images(&mut parsed);
            serde_json::to_vec(&parsed).unwrap_or_else(|_| body_bytes.to_vec())
        }
        Err(_) => body_bytes.to_vec(),
    };

    let event_id = state.audit.begin_raw_event(
        &parts.uri.to_string(),
        parts.method.as_str(),
        &headers_to_json(&parts.headers),
        &audited_body,
    );

    let request = Request::from_parts(parts, Body::from(body_bytes));
    let response = next.run(request).await;

    let Some(event_id) = event_id else {
        return response;
    };

    let (parts, body) = response.into_parts();
    state
        .audit
        .set_raw_response_meta(event_id, parts.status.as_u16(), &headers_to_json(&parts.headers));

    let captured = wrap_streaming_body(state.audit.clone(), event_id, body.into_data_stream());
    Response::from_parts(parts, Body::from_stream(captured))
}
