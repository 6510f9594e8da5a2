//! # Connect Client
//!
//! Calls server-streaming methods over the Connect protocol.
//!
//! The request message is sent as a single envelope. Response envelopes are parsed as the
//! body arrives, so each message is handed to the caller as soon as its last byte is in.
//!
//! ```rust,no_run
//! use duplex_core::{call::CallOptions, connect::client::ConnectClient};
//! # use duplex_core::codec::{FastPath, WireMessage};
//! # #[derive(Clone, PartialEq, prost::Message)]
//! # struct Ping { #[prost(uint64, tag = "1")] id: u64 }
//! # impl WireMessage for Ping {
//! #     fn fast_path() -> Option<FastPath<Self>> { Some(FastPath::prost()) }
//! # }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ConnectClient::new("http://127.0.0.1:8080")?;
//!
//! let mut pongs = client
//!     .server_streaming::<Ping, Ping>("/ping.v1.PingService/Ping", &Ping { id: 1 }, CallOptions::default())
//!     .await?;
//!
//! while let Some(pong) = pongs.message().await? {
//!     println!("{}", pong.id);
//! }
//! # Ok(())
//! # }
//! ```
use super::envelope::{DEFAULT_MAX_MESSAGE_SIZE, Envelope, EnvelopeCodec, FramingError};
use super::{
    EndStream, PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER, STREAMING_CONTENT_TYPE, TIMEOUT_HEADER,
    code_from_http_status,
};
use crate::call::{CallOptions, ResponseStream, interrupted};
use crate::codec::{self, MessageCodec, WireMessage};
use crate::error::CallError;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use http::{Request, StatusCode, Uri, header};
use http_body_util::{BodyDataStream, Full};
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tokio_util::{codec::FramedRead, io::StreamReader};
use tonic::Status;

/// Errors that can occur when creating a [`ConnectClient`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Invalid URL '{0}': {1}")]
    InvalidUrl(String, #[source] http::uri::InvalidUri),
    #[error("Invalid URL '{0}': a scheme and a host are required")]
    IncompleteUrl(String),
}

/// A Connect client bound to one server.
#[derive(Debug, Clone)]
pub struct ConnectClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base: Uri,
    codec: MessageCodec,
    max_message_size: usize,
}

impl ConnectClient {
    /// Creates a client speaking HTTP/2 with prior knowledge.
    ///
    /// No connection is made until the first call.
    pub fn new(url: &str) -> Result<Self, ConnectError> {
        Self::build(url, true)
    }

    /// Creates a client speaking HTTP/1.1.
    pub fn http1(url: &str) -> Result<Self, ConnectError> {
        Self::build(url, false)
    }

    fn build(url: &str, http2_only: bool) -> Result<Self, ConnectError> {
        let base: Uri = url
            .parse()
            .map_err(|err| ConnectError::InvalidUrl(url.to_string(), err))?;

        if base.scheme().is_none() || base.authority().is_none() {
            return Err(ConnectError::IncompleteUrl(url.to_string()));
        }

        let client = Client::builder(TokioExecutor::new())
            .http2_only(http2_only)
            .build_http();

        Ok(Self {
            client,
            base,
            codec: MessageCodec,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    /// Largest response message accepted.
    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    /// Performs a server-streaming call.
    ///
    /// # Arguments
    ///
    /// * `path` - The method path, e.g. `/greet.v1.GreetService/Greet`.
    /// * `request` - The single request message.
    /// * `options` - Timeout, cancellation and custom headers.
    ///
    /// # Returns
    ///
    /// * `Ok(ResponseStream)` - The server accepted the call.
    /// * `Err(CallError)` - The call failed before the first response. Unsupported message
    ///   types are rejected here, before anything is sent.
    pub async fn server_streaming<Req, Res>(
        &self,
        path: &str,
        request: &Req,
        options: CallOptions,
    ) -> Result<ResponseStream<Res>, CallError>
    where
        Req: WireMessage,
        Res: WireMessage,
    {
        codec::probe::<Req>()?;
        codec::probe::<Res>()?;

        let payload = self.codec.marshal(request)?;
        let deadline = options.deadline();
        let http_request = self.build_request(path, payload, &options)?;

        tracing::debug!(path, "Sending Connect request");

        let cancel = options.cancel;
        let response = tokio::select! {
            biased;
            err = interrupted(cancel.as_ref(), deadline) => return Err(err),
            response = self.client.request(http_request) => {
                response.map_err(|err| CallError::Transport(Box::new(err)))?
            }
        };

        if response.status() != StatusCode::OK {
            let status = response.status();
            return Err(CallError::from_status(Status::new(
                code_from_http_status(status),
                format!("The server answered with HTTP {status}"),
            )));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(STREAMING_CONTENT_TYPE) {
            return Err(CallError::ProtocolFraming(format!(
                "Unexpected response content type '{content_type}'"
            )));
        }

        let messages = response_messages(response.into_body(), self.codec, self.max_message_size);

        Ok(ResponseStream::new(messages, cancel, deadline))
    }

    fn build_request(
        &self,
        path: &str,
        payload: Bytes,
        options: &CallOptions,
    ) -> Result<Request<Full<Bytes>>, CallError> {
        let mut uri = Uri::builder().path_and_query(path);
        if let Some(scheme) = self.base.scheme() {
            uri = uri.scheme(scheme.clone());
        }
        if let Some(authority) = self.base.authority() {
            uri = uri.authority(authority.clone());
        }

        let mut builder = Request::post(uri.build().map_err(invalid_request)?)
            .header(header::CONTENT_TYPE, STREAMING_CONTENT_TYPE)
            .header(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);

        if let Some(timeout) = options.timeout {
            // A zero timeout would read as "no timeout".
            builder = builder.header(TIMEOUT_HEADER, timeout.as_millis().max(1).to_string());
        }

        for (key, value) in &options.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        builder
            .body(Full::new(Envelope::message(payload).into_bytes()))
            .map_err(invalid_request)
    }
}

fn invalid_request(err: http::Error) -> CallError {
    CallError::InvalidRequest(err.to_string())
}

/// Decodes response envelopes until the end-of-stream message.
fn response_messages<Res: WireMessage>(
    body: Incoming,
    codec: MessageCodec,
    max_message_size: usize,
) -> impl Stream<Item = Result<Res, CallError>> + Send + 'static {
    let reader = StreamReader::new(BodyDataStream::new(body).map_err(std::io::Error::other));
    let frames = Box::pin(FramedRead::new(reader, EnvelopeCodec::new(max_message_size)));

    futures_util::stream::unfold(Some(frames), move |state| async move {
        let mut frames = state?;

        let item = match frames.next().await {
            Some(Ok(envelope)) if envelope.is_end_stream() => {
                match serde_json::from_slice::<EndStream>(&envelope.data) {
                    Ok(end) => match end.into_result() {
                        Ok(()) => return None,
                        Err(status) => Err(CallError::from_status(status)),
                    },
                    Err(err) => Err(CallError::ProtocolFraming(format!(
                        "Invalid end-of-stream message: '{err}'"
                    ))),
                }
            }
            Some(Ok(envelope)) if envelope.is_compressed() => Err(CallError::ProtocolFraming(
                "Received a compressed message, but no compression was negotiated".to_string(),
            )),
            Some(Ok(envelope)) => codec.unmarshal(envelope.data).map_err(CallError::from),
            Some(Err(FramingError::Io(err))) => Err(CallError::Transport(Box::new(err))),
            Some(Err(err)) => Err(CallError::ProtocolFraming(err.to_string())),
            None => Err(CallError::ProtocolFraming(
                "The response ended without an end-of-stream message".to_string(),
            )),
        };

        // Any error is terminal.
        let next = item.is_ok().then_some(frames);
        Some((item, next))
    })
}
