//! # Greet Service
//!
//! The `greet.v1.GreetService` served by the duplex gateway: committed Protobuf bindings,
//! the placeholder greeter and the harness that checks Connect and gRPC agree.
//!
//! The bindings in `src/generated` are produced by the `generate-greet-service` binary
//! (feature `gen-proto`).
pub mod conformance;
pub mod greeter;
pub mod grpc;
pub mod schema;

pub mod pb {
    include!("generated/greet.v1.rs");
}

pub use greeter::{GREET_PATH, GreetServer};
pub use pb::greet_service_server::{GreetService, GreetServiceServer};

use duplex_core::connect::server::ConnectRouter;
use duplex_core::gateway::{Gateway, GatewayConfig};
use duplex_core::stream::StreamingHandler;
use duplex_core::tonic::service::Routes;
use grpc::GrpcGreeter;
use pb::{GreetRequest, GreetResponse};
use std::sync::Arc;

/// A gateway serving `handler` as `greet.v1.GreetService` over both protocols.
///
/// Both front-ends share the same handler instance.
pub fn gateway<H>(config: GatewayConfig, handler: Arc<H>) -> Gateway
where
    H: StreamingHandler<Request = GreetRequest, Response = GreetResponse>,
{
    let grpc = GreetServiceServer::new(
        GrpcGreeter::new(handler.clone()).stream_buffer(config.stream_buffer),
    );
    let connect = ConnectRouter::new().server_streaming(GREET_PATH, handler);

    Gateway::new(config)
        .grpc_routes(Routes::new(grpc))
        .connect_router(connect)
}
