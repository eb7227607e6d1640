//! Streaming body capture with periodic re-commit.

use std::pin::pin;

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::{SharedAuditStore, COMMIT_CADENCE_BYTES};

/// Yields each chunk unchanged while accumulating a newline-delimited copy;
/// the audit row is re-committed whenever another cadence window of bytes has
/// arrived, and once more when the source ends. Errors pass through
/// uncaptured; auditing never interferes with the stream.
pub fn wrap_streaming_body<S, E>(
    store: SharedAuditStore,
    event_id: i64,
    src: S,
) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    stream! {
        let mut accumulated: Vec<u8> = Vec::new();
        let mut last_commit_len = 0usize;
        let mut src = pin!(src);

        while let Some(chunk) = src.next().await {
            if let Ok(chunk) = &chunk {
                accumulated.extend_from_slice(chunk);
                // Delineate chunks; NDJSON content escapes its own newlines.
                accumulated.push(b'\n');

                if accumulated.len() - last_commit_len > COMMIT_CADENCE_BYTES {
                    store.set_raw_response_content(event_id, &accumulated);
                    last_commit_len = accumulated.len();
                }
            }
            yield chunk;
        }

        store.set_raw_response_content(event_id, &accumulated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuditStore;
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::Arc;

    #[tokio::test]
    async fn capture_preserves_chunks_and_commits_final_content() {
        let store = Arc::new(AuditStore::open_in_memory().unwrap());
        let event_id = store
            .begin_raw_event("/api/chat", "POST", &json!({}), b"{}")
            .unwrap();

        let chunks: Vec<Result<Bytes, Infallible>> = vec![
            Ok(Bytes::from_static(b"{\"response\":\"hi\"}")),
            Ok(Bytes::from_static(b"{\"done\":true}")),
        ];
        let forwarded: Vec<_> = wrap_streaming_body(store.clone(), event_id, futures::stream::iter(chunks))
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(forwarded.len(), 2);
        let captured = store.raw_response_content_for_test(event_id).unwrap();
        assert_eq!(
            captured,
            b"{\"response\":\"hi\"}\n{\"done\":true}\n".to_vec()
        );
    }

    #[tokio::test]
    async fn long_streams_commit_before_the_end() {
        let store = Arc::new(AuditStore::open_in_memory().unwrap());
        let event_id = store
            .begin_raw_event("/api/generate", "POST", &json!({}), b"{}")
            .unwrap();

        // Two chunks, each over the cadence window: the first must already be
        // durable before the second arrives.
        let big = vec![b'x'; COMMIT_CADENCE_BYTES + 1];
        let store_probe = store.clone();
        let first = Bytes::from(big.clone());
        let probing = stream! {
            yield Ok::<_, Infallible>(first);
            // By the time the consumer polls for this chunk, the previous
            // window has been committed.
            let committed = store_probe.raw_response_content_for_test(event_id).unwrap();
            assert!(committed.len() > COMMIT_CADENCE_BYTES);
            yield Ok(Bytes::from(big.clone()));
        };

        let total: usize = wrap_streaming_body(store, event_id, probing)
            .map(|c| c.unwrap().len())
            .collect::<Vec<_>>()
            .await
            .iter()
            .sum();
        assert_eq!(total, 2 * (COMMIT_CADENCE_BYTES + 1));
    }
}
