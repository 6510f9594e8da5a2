//! The placeholder greeter, served identically over Connect and gRPC.
use crate::pb::{GreetRequest, GreetResponse};
use duplex_core::stream::{ResponseSink, StreamingHandler};
use tonic::Status;

/// Path of the `Greet` method on both protocols.
pub const GREET_PATH: &str = "/greet.v1.GreetService/Greet";

/// Answers every request with two greetings, `"greeting 1"` then `"greeting 2"`.
///
/// The request name is only logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreetServer;

#[tonic::async_trait]
impl StreamingHandler for GreetServer {
    type Request = GreetRequest;
    type Response = GreetResponse;

    async fn handle(
        &self,
        request: GreetRequest,
        sink: &ResponseSink<GreetResponse>,
    ) -> Result<(), Status> {
        tracing::debug!(name = %request.name, "Greeting");

        for greeting in ["greeting 1", "greeting 2"] {
            sink.send(GreetResponse {
                message: vec![greeting.to_string()],
            })
            .await?;
        }

        Ok(())
    }
}
