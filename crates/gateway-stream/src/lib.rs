//! Async stream utilities for the inference pipeline.
//!
//! Every stage of the streaming pipeline is a `futures::Stream` that owns its
//! upstream; the combinators here preserve lazy evaluation with in-order
//! observation of every element by every stage.

mod combinators;
mod keepalive;
mod status;

pub use combinators::{
    consolidate_and_call, consolidate_and_yield, decode_from_bytes, dump_to_bytes,
    emit_keepalive_chunks, encode_to_bytes, stream_bytes_to_json, tee_to_console_output, to_async,
    JsonResult,
};
pub use keepalive::{keepalive_frame, keepalive_wrapper};
pub use status::{ServerStatusHolder, StatusScope};
