//! # gRPC Transport
//!
//! The gRPC half of the gateway is served by tonic itself, through generated service
//! bindings configured with [`crate::codec::AdaptiveCodec`]. This module holds the pieces
//! those bindings need to run a [`StreamingHandler`], plus the generic client.
pub mod client;

use crate::stream::{CallContext, StreamingHandler, spawn_call};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Status, metadata::MetadataMap};

/// Header carrying the call timeout.
pub const TIMEOUT_HEADER: &str = "grpc-timeout";

/// Response stream produced by [`serve_streaming`].
pub type ServerStream<T> = ReceiverStream<Result<T, Status>>;

/// Runs `handler` for a gRPC request.
///
/// The `grpc-timeout` header, when present, becomes the call deadline. The returned stream
/// ends with the handler's error, if any, which tonic writes as the status trailers.
pub fn serve_streaming<H: StreamingHandler>(
    handler: Arc<H>,
    request: tonic::Request<H::Request>,
    buffer: usize,
) -> Result<tonic::Response<ServerStream<H::Response>>, Status> {
    let deadline = parse_timeout(request.metadata())?.map(|timeout| Instant::now() + timeout);
    let ctx = CallContext::new(buffer).with_deadline(deadline);

    Ok(tonic::Response::new(spawn_call(
        handler,
        request.into_inner(),
        ctx,
    )))
}

/// Reads the `grpc-timeout` header.
///
/// The value is at most 8 ASCII digits followed by a unit: `H`ours, `M`inutes, `S`econds,
/// `m`illiseconds, `u` (microseconds) or `n`anoseconds.
pub fn parse_timeout(metadata: &MetadataMap) -> Result<Option<Duration>, Status> {
    let Some(value) = metadata.get(TIMEOUT_HEADER) else {
        return Ok(None);
    };

    let invalid = || Status::invalid_argument(format!("Invalid {TIMEOUT_HEADER} {value:?}"));

    let value = value.to_str().map_err(|_| invalid())?;
    if value.len() < 2 || value.len() > 9 {
        return Err(invalid());
    }

    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let amount: u64 = digits.parse().map_err(|_| invalid())?;

    let timeout = match unit {
        "H" => Duration::from_secs(amount * 60 * 60),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return Err(invalid()),
    };

    Ok(Some(timeout))
}
