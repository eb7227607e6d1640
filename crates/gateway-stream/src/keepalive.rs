//! Keep-alive frames for long-running streaming responses.
//!
//! A client watching an Ollama-style NDJSON stream sees a synthetic frame at
//! least every cadence window, so reverse proxies and mobile clients don't
//! time the connection out during slow prompt evaluation or retrieval.

use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use futures::StreamExt;
use serde_json::{json, Value};

use gateway_core::wire_timestamp;

use crate::combinators::{emit_keepalive_chunks, JsonResult};
use crate::status::ServerStatusHolder;

/// Builds one synthetic streaming frame, shaped like a normal Ollama chunk
/// with empty content.
pub fn keepalive_frame(model_human_id: &str, status: Option<&str>) -> Value {
    let mut frame = json!({
        "model": model_human_id,
        "created_at": wire_timestamp(Utc::now()),
        "done": false,
        "message": {
            "content": "",
            "role": "assistant",
        },
    });
    if let Some(status) = status {
        // Clients tolerant of extra fields also get the server-side status.
        frame["response"] = json!("");
        frame["status"] = json!(status);
    }
    frame
}

/// Wraps the final response stream, substituting a [`keepalive_frame`] for
/// every cadence window without a real chunk. Never cancels the upstream.
pub fn keepalive_wrapper<S>(
    model_human_id: String,
    src: S,
    period: Duration,
    status_holder: ServerStatusHolder,
    augmented_fields: bool,
) -> impl Stream<Item = JsonResult>
where
    S: Stream<Item = JsonResult>,
{
    emit_keepalive_chunks(src, period).map(move |slot| match slot {
        Some(item) => item,
        None => {
            let status = status_holder.get();
            let status = augmented_fields.then_some(status.as_str());
            Ok(keepalive_frame(&model_human_id, status))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_stream::stream;

    #[tokio::test(start_paused = true)]
    async fn stalled_source_yields_status_frames() {
        let status = ServerStatusHolder::new("warming up");
        let src = stream! {
            tokio::time::sleep(Duration::from_secs(10)).await;
            yield Ok(json!({"message": {"role": "assistant", "content": "hi"}, "done": true}));
        };

        let out: Vec<Value> = keepalive_wrapper(
            "m1".into(),
            src,
            Duration::from_secs(3),
            status.clone(),
            true,
        )
        .map(|item| item.unwrap())
        .collect()
        .await;

        assert!(out.len() >= 4, "expected keepalives plus the real chunk");
        for frame in &out[..out.len() - 1] {
            assert_eq!(frame["done"], json!(false));
            assert_eq!(frame["status"], json!("warming up"));
            assert_eq!(frame["message"]["content"], json!(""));
        }
        assert_eq!(out.last().unwrap()["done"], json!(true));
    }

    #[tokio::test]
    async fn no_keepalive_after_terminal_chunk() {
        let src = futures::stream::iter(vec![Ok(json!({"done": true}))]);
        let out: Vec<Value> = keepalive_wrapper(
            "m1".into(),
            src,
            Duration::from_millis(5),
            ServerStatusHolder::new(""),
            false,
        )
        .map(|item| item.unwrap())
        .collect()
        .await;

        assert_eq!(out, vec![json!({"done": true})]);
    }
}
