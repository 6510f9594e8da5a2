//! Binds a [`StreamingHandler`] to the generated `GreetService` trait.
use crate::pb::{GreetRequest, GreetResponse, greet_service_server::GreetService};
use duplex_core::grpc::{ServerStream, serve_streaming};
use duplex_core::stream::{DEFAULT_STREAM_BUFFER, StreamingHandler};
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// The gRPC face of a greet handler.
#[derive(Debug)]
pub struct GrpcGreeter<H> {
    handler: Arc<H>,
    buffer: usize,
}

impl<H> GrpcGreeter<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn stream_buffer(mut self, capacity: usize) -> Self {
        self.buffer = capacity.max(1);
        self
    }
}

#[tonic::async_trait]
impl<H> GreetService for GrpcGreeter<H>
where
    H: StreamingHandler<Request = GreetRequest, Response = GreetResponse>,
{
    type GreetStream = ServerStream<GreetResponse>;

    async fn greet(
        &self,
        request: Request<GreetRequest>,
    ) -> Result<Response<Self::GreetStream>, Status> {
        serve_streaming(self.handler.clone(), request, self.buffer)
    }
}
