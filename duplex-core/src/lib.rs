//! # Duplex Core
//!
//! `duplex-core` serves one server-streaming RPC surface through two wire protocols on a
//! single listener, and ships the clients that talk to it through each of them.
//!
//! ## Key Components
//!
//! * **[`codec::MessageCodec`]:** The adaptive Protobuf codec. For every message type it picks,
//!   at the moment of use, a compiled fast path when the type has one, and falls back to a
//!   reflection-based path driven by the message schema otherwise.
//! * **[`codec::AdaptiveCodec`]:** The same codec, packaged as a `tonic::codec::Codec` so that
//!   generated gRPC bindings can use it.
//! * **[`gateway::Gateway`]:** An HTTP/2 cleartext listener that routes `application/grpc`
//!   requests to tonic and everything else to the Connect router.
//! * **[`stream::StreamingHandler`]:** Protocol-agnostic business logic, written against a
//!   [`stream::ResponseSink`].
//! * **[`connect::client::ConnectClient`] & [`grpc::client::GrpcClient`]:** One client per
//!   protocol, both yielding a [`call::ResponseStream`].
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod call;
pub mod codec;
pub mod connect;
pub mod error;
pub mod gateway;
pub mod grpc;
pub mod stream;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
