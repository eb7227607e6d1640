//! NDJSON streaming responses.

use std::convert::Infallible;
use std::pin::pin;

use async_stream::stream;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use gateway_stream::JsonResult;

/// Status code marking a stream that carries augmented (non-Ollama) keys.
pub const AUGMENTED_STREAM_STATUS: u16 = 218;

fn ndjson_line(value: &Value) -> Bytes {
    let mut line = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    line.push(b'\n');
    Bytes::from(line)
}

/// Streams one JSON object per line. A stream error becomes a terminal
/// `{error, done:true}` line and closes the response.
pub fn ndjson_response<S>(status: u16, chunks: S) -> Response
where
    S: Stream<Item = JsonResult> + Send + 'static,
{
    let body = stream! {
        let mut chunks = pin!(chunks);
        while let Some(item) = chunks.next().await {
            match item {
                Ok(value) => yield Ok::<_, Infallible>(ndjson_line(&value)),
                Err(err) => {
                    yield Ok(ndjson_line(&json!({
                        "error": err.to_string(),
                        "done": true,
                    })));
                    break;
                }
            }
        }
    };

    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
