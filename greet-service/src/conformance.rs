//! # Cross-Protocol Conformance
//!
//! Sends the same `GreetRequest` through the Connect client and the gRPC client against one
//! server, and checks that both protocols deliver the same responses in the same order.
use crate::greeter::GREET_PATH;
use crate::pb::{GreetRequest, GreetResponse};
use duplex_core::call::CallOptions;
use duplex_core::connect::client::{ConnectClient, ConnectError};
use duplex_core::error::CallError;
use duplex_core::grpc::client::{ClientConnectError, GrpcClient};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Connect,
    Grpc,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Connect => f.write_str("connect"),
            Protocol::Grpc => f.write_str("grpc"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConformanceError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    GrpcConnect(#[from] ClientConnectError),
    #[error("The {protocol} call failed: '{source}'")]
    Call {
        protocol: Protocol,
        #[source]
        source: CallError,
    },
    #[error("Connect and gRPC disagree: {reason}")]
    Divergence {
        reason: String,
        connect: Vec<GreetResponse>,
        grpc: Vec<GreetResponse>,
    },
}

/// The responses both protocols agreed on.
#[derive(Debug, Clone, PartialEq)]
pub struct ConformanceReport {
    pub request: GreetRequest,
    pub responses: Vec<GreetResponse>,
}

/// Runs `request` through both clients against the server at `url`.
pub async fn check(
    url: &str,
    request: &GreetRequest,
    options: CallOptions,
) -> Result<ConformanceReport, ConformanceError> {
    let connect_client = ConnectClient::new(url)?;
    let mut grpc_client = GrpcClient::connect(url).await?;

    let connect = async {
        connect_client
            .server_streaming::<GreetRequest, GreetResponse>(GREET_PATH, request, options.clone())
            .await?
            .collect()
            .await
    };
    let connect = connect.await.map_err(|source| ConformanceError::Call {
        protocol: Protocol::Connect,
        source,
    })?;

    let grpc = async {
        grpc_client
            .server_streaming::<GreetRequest, GreetResponse>(GREET_PATH, request.clone(), options)
            .await?
            .collect()
            .await
    };
    let grpc = grpc.await.map_err(|source| ConformanceError::Call {
        protocol: Protocol::Grpc,
        source,
    })?;

    compare(request.clone(), connect, grpc)
}

/// Compares the two response sequences item by item.
pub fn compare(
    request: GreetRequest,
    connect: Vec<GreetResponse>,
    grpc: Vec<GreetResponse>,
) -> Result<ConformanceReport, ConformanceError> {
    let reason = if connect.len() != grpc.len() {
        Some(format!(
            "connect returned {} responses, grpc returned {}",
            connect.len(),
            grpc.len()
        ))
    } else {
        connect
            .iter()
            .zip(&grpc)
            .position(|(a, b)| a != b)
            .map(|index| {
                format!(
                    "response #{index} differs: connect {:?}, grpc {:?}",
                    connect[index].message, grpc[index].message
                )
            })
    };

    match reason {
        Some(reason) => Err(ConformanceError::Divergence {
            reason,
            connect,
            grpc,
        }),
        None => Ok(ConformanceReport {
            request,
            responses: connect,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(text: &str) -> GreetResponse {
        GreetResponse {
            message: vec![text.to_string()],
        }
    }

    #[test]
    fn test_identical_sequences_conform() {
        let report = compare(
            GreetRequest::default(),
            vec![response("a"), response("b")],
            vec![response("a"), response("b")],
        )
        .unwrap();

        assert_eq!(report.responses.len(), 2);
    }

    #[test]
    fn test_count_order_and_content_diverge() {
        let cases = [
            (vec![response("a")], vec![response("a"), response("b")]),
            (vec![response("a"), response("b")], vec![response("b"), response("a")]),
            (vec![response("a")], vec![response("A")]),
        ];

        for (connect, grpc) in cases {
            let err = compare(GreetRequest::default(), connect, grpc).unwrap_err();
            assert!(matches!(err, ConformanceError::Divergence { .. }), "{err}");
        }
    }
}
