//! Stream combinators: framing, tee, consolidation, keep-alive races.
//!
//! Ordering guarantee: for any element emitted by the source, all elements
//! emitted before it have already been forwarded to the sink, and folds
//! observe elements in source order.

use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::info;

use gateway_core::GatewayError;

/// The element type flowing through most pipeline stages.
pub type JsonResult = Result<Value, GatewayError>;

/// Lifts a synchronous iterator into an async stream.
pub fn to_async<I>(iter: I) -> impl Stream<Item = I::Item>
where
    I: IntoIterator,
{
    futures::stream::iter(iter)
}

/// UTF-8 encodes each string element.
pub fn encode_to_bytes<S>(src: S) -> impl Stream<Item = Bytes>
where
    S: Stream<Item = String>,
{
    src.map(|s| Bytes::from(s.into_bytes()))
}

/// Decodes each byte chunk as (lossy) UTF-8.
pub fn decode_from_bytes<S>(src: S) -> impl Stream<Item = String>
where
    S: Stream<Item = Bytes>,
{
    src.map(|b| String::from_utf8_lossy(&b).into_owned())
}

/// JSON-encodes each element independently.
pub fn dump_to_bytes<S>(src: S) -> impl Stream<Item = Result<Bytes, GatewayError>>
where
    S: Stream<Item = JsonResult>,
{
    src.map(|item| item.map(|v| Bytes::from(v.to_string().into_bytes())))
}

/// Reframes a byte stream into JSON values.
///
/// A single value may be split across chunks, and one chunk may carry several
/// back-to-back (or newline-delimited) values; incomplete tails are buffered
/// until the next chunk. The stream fails hard only when the source ends with
/// a non-empty unparseable buffer.
pub fn stream_bytes_to_json<S>(src: S) -> impl Stream<Item = JsonResult>
where
    S: Stream<Item = Result<Bytes, GatewayError>>,
{
    stream! {
        let mut buffer: Vec<u8> = Vec::new();
        let mut src = pin!(src);

        while let Some(chunk) = src.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            loop {
                let start = buffer
                    .iter()
                    .position(|b| !b.is_ascii_whitespace())
                    .unwrap_or(buffer.len());
                if start == buffer.len() {
                    buffer.clear();
                    break;
                }

                let (next, offset) = {
                    let mut values = serde_json::Deserializer::from_slice(&buffer[start..])
                        .into_iter::<Value>();
                    let next = values.next();
                    (next, values.byte_offset())
                };
                match next {
                    Some(Ok(value)) => {
                        buffer.drain(..start + offset);
                        yield Ok(value);
                    }
                    Some(Err(err)) if err.is_eof() => break,
                    Some(Err(err)) => {
                        yield Err(GatewayError::UpstreamStream(format!(
                            "undecodable JSON mid-stream: {err}"
                        )));
                        return;
                    }
                    None => break,
                }
            }
        }

        if !buffer.iter().all(|b| b.is_ascii_whitespace()) {
            yield Err(GatewayError::UpstreamStream(format!(
                "stream ended with {} undecoded bytes",
                buffer.len()
            )));
        }
    }
}

/// Yields each element unchanged while batching `indexer(element)` into a
/// line buffer, flushed to the log when it reaches `max_buffer_len` or the
/// source ends.
pub fn tee_to_console_output<S, F>(
    src: S,
    indexer: F,
    max_buffer_len: usize,
) -> impl Stream<Item = JsonResult>
where
    S: Stream<Item = JsonResult>,
    F: Fn(&Value) -> String,
{
    stream! {
        let mut buffer = String::new();
        let mut src = pin!(src);

        while let Some(item) = src.next().await {
            if let Ok(value) = &item {
                if buffer.len() >= max_buffer_len {
                    info!("{buffer}");
                    buffer = indexer(value);
                } else {
                    buffer.push_str(&indexer(value));
                }
            }
            yield item;
        }

        if !buffer.is_empty() {
            info!("{buffer}");
        }
    }
}

/// Yields each element unchanged while folding it into an accumulator; once
/// the source is exhausted, `on_done` receives the accumulator plus the error
/// that terminated the source (if any). Errors raised by `on_done` propagate
/// after all source elements have been yielded.
pub fn consolidate_and_call<S, C, U, F, Fut>(
    src: S,
    consolidator: C,
    initial: U,
    on_done: F,
) -> impl Stream<Item = JsonResult>
where
    S: Stream<Item = JsonResult>,
    C: Fn(Value, U) -> Result<U, GatewayError>,
    F: FnOnce(U, Option<GatewayError>) -> Fut,
    Fut: Future<Output = Result<(), GatewayError>>,
{
    stream! {
        let mut acc = initial;
        let mut terminal_err: Option<GatewayError> = None;
        {
            let mut src = pin!(src);
            while let Some(item) = src.next().await {
                match item {
                    Ok(chunk) => {
                        yield Ok(chunk.clone());
                        match consolidator(chunk, acc) {
                            Ok(next) => acc = next,
                            Err(err) => {
                                yield Err(err);
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        terminal_err = Some(err);
                        break;
                    }
                }
            }
        }

        if let Err(err) = on_done(acc, terminal_err).await {
            yield Err(err);
        }
    }
}

/// As [`consolidate_and_call`], but `on_done` is itself a stream whose
/// elements are appended to the output.
pub fn consolidate_and_yield<S, C, U, F, S2>(
    src: S,
    consolidator: C,
    initial: U,
    on_done: F,
) -> impl Stream<Item = JsonResult>
where
    S: Stream<Item = JsonResult>,
    C: Fn(Value, U) -> Result<U, GatewayError>,
    F: FnOnce(U, Option<GatewayError>) -> S2,
    S2: Stream<Item = JsonResult>,
{
    stream! {
        let mut acc = initial;
        let mut terminal_err: Option<GatewayError> = None;
        {
            let mut src = pin!(src);
            while let Some(item) = src.next().await {
                match item {
                    Ok(chunk) => {
                        yield Ok(chunk.clone());
                        match consolidator(chunk, acc) {
                            Ok(next) => acc = next,
                            Err(err) => {
                                yield Err(err);
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        terminal_err = Some(err);
                        break;
                    }
                }
            }
        }

        let trailer = on_done(acc, terminal_err);
        let mut trailer = pin!(trailer);
        while let Some(item) = trailer.next().await {
            yield item;
        }
    }
}

/// Races `next(src)` against a timeout; a `None` element marks each window
/// that elapsed without a real chunk. Keep-alives are only ever emitted
/// between source elements, never after the source ends.
pub fn emit_keepalive_chunks<S>(src: S, period: Duration) -> impl Stream<Item = Option<S::Item>>
where
    S: Stream,
{
    stream! {
        let mut src = pin!(src);
        loop {
            match tokio::time::timeout(period, src.next()).await {
                Ok(Some(item)) => yield Some(item),
                Ok(None) => break,
                Err(_elapsed) => yield None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn byte_stream(parts: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes, GatewayError>> {
        futures::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p))))
    }

    #[tokio::test]
    async fn frames_value_split_across_chunks() {
        let src = byte_stream(vec![b"{\"response\":", b" \"hi\"}\n"]);
        let values: Vec<_> = stream_bytes_to_json(src).collect().await;
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].as_ref().unwrap(), &json!({"response": "hi"}));
    }

    #[tokio::test]
    async fn frames_back_to_back_values_in_one_chunk() {
        let src = byte_stream(vec![b"{\"a\":1}\n{\"b\":2}{\"c\":3}"]);
        let values: Vec<_> = stream_bytes_to_json(src)
            .map(|v| v.unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![json!({"a":1}), json!({"b":2}), json!({"c":3})]);
    }

    #[tokio::test]
    async fn fails_hard_on_trailing_garbage() {
        let src = byte_stream(vec![b"{\"a\":1}\n{\"b\":"]);
        let values: Vec<_> = stream_bytes_to_json(src).collect().await;
        assert_eq!(values.len(), 2);
        assert!(values[0].is_ok());
        assert!(values[1].is_err());
    }

    #[tokio::test]
    async fn consolidate_and_call_folds_in_source_order() {
        let chunks = vec![Ok(json!({"n": 1})), Ok(json!({"n": 2})), Ok(json!({"n": 3}))];
        let (tx, rx) = std::sync::mpsc::channel();
        let out: Vec<_> = consolidate_and_call(
            futures::stream::iter(chunks),
            |chunk, mut acc: Vec<i64>| {
                acc.push(chunk["n"].as_i64().unwrap());
                Ok(acc)
            },
            Vec::new(),
            |acc, err| async move {
                assert!(err.is_none());
                tx.send(acc).unwrap();
                Ok(())
            },
        )
        .collect()
        .await;

        assert_eq!(out.len(), 3);
        assert_eq!(rx.recv().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn consolidate_and_yield_appends_trailer_after_source() {
        let chunks = vec![Ok(json!({"response": "a"})), Ok(json!({"response": "b"}))];
        let out: Vec<_> = consolidate_and_yield(
            futures::stream::iter(chunks),
            |chunk, acc: String| Ok(acc + chunk["response"].as_str().unwrap()),
            String::new(),
            |acc, _err| futures::stream::iter(vec![Ok(json!({"combined": acc, "done": true}))]),
        )
        .map(|v| v.unwrap())
        .collect()
        .await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[2], json!({"combined": "ab", "done": true}));
    }

    #[tokio::test]
    async fn consolidate_passes_terminating_error_to_on_done() {
        let chunks = vec![
            Ok(json!({"response": "partial"})),
            Err(GatewayError::UpstreamStream("connection reset".into())),
        ];
        let out: Vec<_> = consolidate_and_yield(
            futures::stream::iter(chunks),
            |chunk, acc: String| Ok(acc + chunk["response"].as_str().unwrap()),
            String::new(),
            |acc, err| {
                assert_eq!(acc, "partial");
                assert!(err.is_some());
                futures::stream::iter(vec![Ok(json!({"error": "recorded", "done": true}))])
            },
        )
        .collect()
        .await;

        // The raw source error is not forwarded; on_done speaks for it.
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_ref().unwrap(), &json!({"error": "recorded", "done": true}));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_marks_silent_windows() {
        let src = stream! {
            tokio::time::sleep(Duration::from_secs(10)).await;
            yield json!({"response": "late"});
        };

        let out: Vec<_> = emit_keepalive_chunks(src, Duration::from_secs(3))
            .collect()
            .await;

        let sentinels = out.iter().filter(|o| o.is_none()).count();
        assert_eq!(sentinels, 3);
        assert_eq!(out.last().unwrap().as_ref().unwrap(), &json!({"response": "late"}));
    }

    #[tokio::test]
    async fn tee_forwards_every_element_unchanged() {
        let chunks = vec![Ok(json!({"response": "x"})), Ok(json!({"response": "y"}))];
        let out: Vec<_> = tee_to_console_output(
            futures::stream::iter(chunks),
            |v| v["response"].as_str().unwrap_or_default().to_string(),
            120,
        )
        .map(|v| v.unwrap())
        .collect()
        .await;

        assert_eq!(out, vec![json!({"response": "x"}), json!({"response": "y"})]);
    }
}
