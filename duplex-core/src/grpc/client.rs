//! # Generic gRPC Client
//!
//! This module wraps a standard `tonic` client to call server-streaming methods with any
//! [`WireMessage`] type.
//!
//! ## How it works
//!
//! The [`GrpcClient`] hands the [`AdaptiveCodec`] to `tonic::client::Grpc`, which takes care
//! of framing, HTTP/2 and status trailers. The client only builds the request (path,
//! metadata, timeout) and wraps the resulting stream in a [`ResponseStream`] that honours the
//! caller's cancellation token and deadline.
use crate::BoxError;
use crate::call::{CallOptions, ResponseStream, interrupted};
use crate::codec::{self, AdaptiveCodec, WireMessage};
use crate::error::CallError;
use futures_util::StreamExt;
use http_body::Body as HttpBody;
use std::str::FromStr;
use tonic::{
    client::GrpcService,
    metadata::{
        MetadataKey, MetadataValue,
        errors::{InvalidMetadataKey, InvalidMetadataValue},
    },
    transport::{Channel, Endpoint},
};

/// Errors that can occur when connecting to a gRPC server.
#[derive(Debug, thiserror::Error)]
pub enum ClientConnectError {
    #[error("Invalid URL '{0}': {1}")]
    InvalidUrl(String, #[source] tonic::transport::Error),
    #[error("Failed to connect to '{0}': {1}")]
    ConnectionFailed(String, #[source] tonic::transport::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum GrpcRequestError {
    #[error("Internal error, the client was not ready: '{0}'")]
    ClientNotReady(#[source] BoxError),
    #[error("Invalid method path '{0}'")]
    InvalidPath(String),
    #[error("Invalid metadata (header) key '{key}': '{source}'")]
    InvalidMetadataKey {
        key: String,
        source: InvalidMetadataKey,
    },
    #[error("Invalid metadata (header) value for key '{key}': '{source}'")]
    InvalidMetadataValue {
        key: String,
        source: InvalidMetadataValue,
    },
}

impl From<GrpcRequestError> for CallError {
    fn from(err: GrpcRequestError) -> Self {
        match err {
            GrpcRequestError::ClientNotReady(source) => CallError::Transport(source),
            err => CallError::InvalidRequest(err.to_string()),
        }
    }
}

/// A gRPC client for server-streaming calls.
#[derive(Debug, Clone)]
pub struct GrpcClient<S = Channel> {
    client: tonic::client::Grpc<S>,
}

impl GrpcClient<Channel> {
    /// Connects to a gRPC server over cleartext HTTP/2.
    ///
    /// # Arguments
    ///
    /// * `addr` - The server URI (e.g., `http://localhost:8080`).
    pub async fn connect(addr: &str) -> Result<Self, ClientConnectError> {
        let endpoint = Endpoint::new(addr.to_string())
            .map_err(|e| ClientConnectError::InvalidUrl(addr.to_string(), e))?;

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| ClientConnectError::ConnectionFailed(addr.to_string(), e))?;

        Ok(Self::new(channel))
    }
}

impl<S> GrpcClient<S>
where
    S: GrpcService<tonic::body::Body>,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S) -> Self {
        let client = tonic::client::Grpc::new(service);
        Self { client }
    }

    /// Performs a Server Streaming gRPC call (Single Request -> Stream of Responses).
    ///
    /// # Returns
    ///
    /// * `Ok(ResponseStream)` - The server accepted the call.
    /// * `Err(CallError)` - The call failed before the first response. Unsupported message
    ///   types are rejected here, before anything is sent.
    pub async fn server_streaming<Req, Res>(
        &mut self,
        path: &str,
        request: Req,
        options: CallOptions,
    ) -> Result<ResponseStream<Res>, CallError>
    where
        Req: WireMessage + Sync,
        Res: WireMessage + Sync,
    {
        codec::probe::<Req>()?;
        codec::probe::<Res>()?;

        let deadline = options.deadline();
        let cancel = options.cancel.clone();

        let path = http::uri::PathAndQuery::from_str(path)
            .map_err(|_| GrpcRequestError::InvalidPath(path.to_string()))?;
        let request = build_request(request, &options)?;

        tracing::debug!(path = %path, "Sending gRPC request");

        let call = async {
            self.client
                .ready()
                .await
                .map_err(|e| GrpcRequestError::ClientNotReady(e.into()))?;

            let response = self
                .client
                .server_streaming(request, path, AdaptiveCodec::<Req, Res>::default())
                .await
                .map_err(CallError::from_status)?;

            Ok::<_, CallError>(response)
        };

        let response = tokio::select! {
            biased;
            err = interrupted(cancel.as_ref(), deadline) => return Err(err),
            response = call => response?,
        };

        let messages = response
            .into_inner()
            .map(|item| item.map_err(CallError::from_status));

        Ok(ResponseStream::new(messages, cancel, deadline))
    }
}

fn build_request<T>(
    payload: T,
    options: &CallOptions,
) -> Result<tonic::Request<T>, GrpcRequestError> {
    let mut request = tonic::Request::new(payload);

    if let Some(timeout) = options.timeout {
        // Sent as the `grpc-timeout` header.
        request.set_timeout(timeout);
    }

    for (k, v) in &options.headers {
        let key =
            MetadataKey::from_str(k).map_err(|source| GrpcRequestError::InvalidMetadataKey {
                key: k.clone(),
                source,
            })?;
        let val = MetadataValue::from_str(v).map_err(|source| {
            GrpcRequestError::InvalidMetadataValue {
                key: k.clone(),
                source,
            }
        })?;
        request.metadata_mut().insert(key, val);
    }
    Ok(request)
}
