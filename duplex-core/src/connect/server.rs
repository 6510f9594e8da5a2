//! # Connect Server
//!
//! Serves [`StreamingHandler`]s over the Connect protocol.
//!
//! Requests that never make it to a handler (wrong method, unknown path, unsupported content
//! type) are answered with a plain HTTP error. Once a route is matched the response is always
//! `200` and any failure, including a malformed request, is reported in the end-of-stream
//! message.
use super::envelope::{DEFAULT_MAX_MESSAGE_SIZE, Envelope, EnvelopeCodec, FramingError};
use super::{
    EndStream, PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER, STREAMING_CONTENT_TYPE, TIMEOUT_HEADER,
};
use crate::BoxError;
use crate::codec::{CodecError, MessageCodec, WireMessage};
use crate::stream::{CallContext, DEFAULT_STREAM_BUFFER, StreamingHandler, spawn_call};
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream::BoxStream};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, header};
use http_body::{Body as HttpBody, Frame};
use http_body_util::{BodyExt, LengthLimitError, Limited, StreamBody};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tonic::{Status, body::Body};

type EncodedStream = BoxStream<'static, Result<Bytes, Status>>;

/// A route with its message types erased.
trait ErasedRoute: Send + Sync + 'static {
    fn call(&self, payload: Bytes, ctx: CallContext) -> Result<EncodedStream, Status>;
}

struct ServerStreamingRoute<H> {
    handler: Arc<H>,
    codec: MessageCodec,
}

impl<H> ErasedRoute for ServerStreamingRoute<H>
where
    H: StreamingHandler,
    H::Request: WireMessage,
    H::Response: WireMessage,
{
    fn call(&self, payload: Bytes, ctx: CallContext) -> Result<EncodedStream, Status> {
        let request: H::Request = self.codec.unmarshal(payload).map_err(|err| match err {
            CodecError::UnsupportedMessageType { .. } => Status::from(err),
            err => Status::invalid_argument(err.to_string()),
        })?;

        let codec = self.codec;
        let responses = spawn_call(self.handler.clone(), request, ctx).map(move |item| {
            item.and_then(|message| codec.marshal(&message).map_err(Status::from))
        });

        Ok(responses.boxed())
    }
}

/// Routes Connect requests by path.
#[derive(Clone)]
pub struct ConnectRouter {
    routes: HashMap<String, Arc<dyn ErasedRoute>>,
    stream_buffer: usize,
    max_message_size: usize,
}

impl Default for ConnectRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRouter")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("stream_buffer", &self.stream_buffer)
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

impl ConnectRouter {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            stream_buffer: DEFAULT_STREAM_BUFFER,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Serves `handler` at `path`, e.g. `/greet.v1.GreetService/Greet`.
    pub fn server_streaming<H>(mut self, path: impl Into<String>, handler: Arc<H>) -> Self
    where
        H: StreamingHandler,
        H::Request: WireMessage,
        H::Response: WireMessage,
    {
        let route = ServerStreamingRoute {
            handler,
            codec: MessageCodec,
        };
        self.routes.insert(path.into(), Arc::new(route));
        self
    }

    /// Capacity of the channel between each handler and its response body.
    pub fn stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn has_route(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Answers one HTTP request.
    pub async fn handle<B>(&self, request: Request<B>) -> Response<Body>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if request.method() != Method::POST {
            return http_error(StatusCode::METHOD_NOT_ALLOWED, |headers| {
                headers.insert(header::ALLOW, HeaderValue::from_static("POST"));
            });
        }

        let Some(route) = self.routes.get(request.uri().path()).cloned() else {
            tracing::debug!(path = request.uri().path(), "No Connect route");
            return http_error(StatusCode::NOT_FOUND, |_| {});
        };

        if !is_streaming_content_type(request.headers()) {
            return http_error(StatusCode::UNSUPPORTED_MEDIA_TYPE, |headers| {
                headers.insert("accept-post", streaming_content_type_value());
            });
        }

        let path = request.uri().path().to_string();
        tracing::debug!(path = %path, "Connect call");

        let responses = match self.start(route.as_ref(), request).await {
            Ok(responses) => responses,
            Err(status) => {
                tracing::warn!(path = %path, code = ?status.code(), message = status.message(), "Rejected Connect call");
                futures_util::stream::iter([Err(status)]).boxed()
            }
        };

        let mut response = Response::new(streaming_body(responses));
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, streaming_content_type_value());
        response
    }

    async fn start<B>(
        &self,
        route: &dyn ErasedRoute,
        request: Request<B>,
    ) -> Result<EncodedStream, Status>
    where
        B: HttpBody<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();

        if let Some(version) = parts.headers.get(PROTOCOL_VERSION_HEADER)
            && version != PROTOCOL_VERSION
        {
            return Err(Status::invalid_argument(format!(
                "Unsupported connect-protocol-version {version:?}, want \"{PROTOCOL_VERSION}\""
            )));
        }

        let deadline = parse_timeout(&parts.headers)?.map(|timeout| Instant::now() + timeout);

        // The header is 5 bytes; anything past one envelope is rejected below anyway.
        let body = Limited::new(body, self.max_message_size.saturating_add(5))
            .collect()
            .await
            .map_err(|err| {
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    Status::resource_exhausted(format!(
                        "Request is larger than {} bytes",
                        self.max_message_size
                    ))
                } else {
                    Status::invalid_argument(format!("Failed to read the request body: '{err}'"))
                }
            })?
            .to_bytes();

        let envelope = single_envelope(body, self.max_message_size)?;

        let ctx = CallContext::new(self.stream_buffer).with_deadline(deadline);
        route.call(envelope.data, ctx)
    }
}

fn parse_timeout(headers: &HeaderMap) -> Result<Option<Duration>, Status> {
    let Some(value) = headers.get(TIMEOUT_HEADER) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .filter(|value| !value.is_empty() && value.len() <= 10)
        .and_then(|value| value.parse::<u64>().ok())
        .map(|millis| Some(Duration::from_millis(millis)))
        .ok_or_else(|| Status::invalid_argument(format!("Invalid {TIMEOUT_HEADER} {value:?}")))
}

/// Reads the one envelope a server-streaming request carries.
fn single_envelope(body: Bytes, max_message_size: usize) -> Result<Envelope, Status> {
    let mut codec = EnvelopeCodec::new(max_message_size);
    let mut buf = BytesMut::from(&body[..]);

    let envelope = codec
        .decode_eof(&mut buf)
        .map_err(|err| match err {
            FramingError::TooLarge { .. } => Status::resource_exhausted(err.to_string()),
            err => Status::invalid_argument(err.to_string()),
        })?
        .ok_or_else(|| Status::invalid_argument("The request body holds no message"))?;

    if !buf.is_empty() {
        return Err(Status::invalid_argument(
            "The request body holds more than one message",
        ));
    }
    if envelope.is_compressed() {
        return Err(Status::unimplemented("Compressed messages are not supported"));
    }
    if envelope.is_end_stream() {
        return Err(Status::invalid_argument(
            "The request message is flagged as end-of-stream",
        ));
    }

    Ok(envelope)
}

/// Frames each encoded response as it arrives and closes with the end-of-stream message.
fn streaming_body(responses: EncodedStream) -> Body {
    let envelopes = futures_util::stream::unfold(Some(responses), |state| async move {
        let mut responses = state?;
        match responses.next().await {
            Some(Ok(message)) => Some((Envelope::message(message).into_bytes(), Some(responses))),
            Some(Err(status)) => Some((end_stream(&EndStream::error(&status)), None)),
            None => Some((end_stream(&EndStream::ok()), None)),
        }
    });

    let frames = envelopes.map(|bytes| Ok::<_, Status>(Frame::data(bytes)));
    Body::new(StreamBody::new(frames))
}

fn end_stream(end: &EndStream) -> Bytes {
    let json = serde_json::to_vec(end).unwrap_or_else(|err| {
        tracing::error!(error = %err, "Failed to serialize the end-of-stream message");
        br#"{"error":{"code":"internal"}}"#.to_vec()
    });
    Envelope::end_stream(Bytes::from(json)).into_bytes()
}

fn is_streaming_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or_default().trim())
        .is_some_and(|value| value.eq_ignore_ascii_case(STREAMING_CONTENT_TYPE))
}

fn streaming_content_type_value() -> HeaderValue {
    HeaderValue::from_static(STREAMING_CONTENT_TYPE)
}

fn http_error(status: StatusCode, headers: impl FnOnce(&mut HeaderMap)) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FastPath;
    use crate::stream::ResponseSink;
    use http_body_util::Full;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Count {
        #[prost(uint32, tag = "1")]
        n: u32,
    }

    impl WireMessage for Count {
        fn fast_path() -> Option<FastPath<Self>> {
            Some(FastPath::prost())
        }
    }

    /// Emits `1..=n`, failing instead of emitting 13.
    struct UpTo;

    #[tonic::async_trait]
    impl StreamingHandler for UpTo {
        type Request = Count;
        type Response = Count;

        async fn handle(&self, request: Count, sink: &ResponseSink<Count>) -> Result<(), Status> {
            for n in 1..=request.n {
                if n == 13 {
                    return Err(Status::failed_precondition("unlucky"));
                }
                sink.send(Count { n }).await?;
            }
            Ok(())
        }
    }

    const PATH: &str = "/count.v1.CountService/UpTo";

    fn router() -> ConnectRouter {
        ConnectRouter::new().server_streaming(PATH, Arc::new(UpTo))
    }

    fn request(body: Bytes) -> Request<Full<Bytes>> {
        Request::post(PATH)
            .header(header::CONTENT_TYPE, "application/connect+proto")
            .body(Full::new(body))
            .unwrap()
    }

    fn count_request(n: u32) -> Request<Full<Bytes>> {
        let payload = MessageCodec.marshal(&Count { n }).unwrap();
        request(Envelope::message(payload).into_bytes())
    }

    async fn envelopes(response: Response<Body>) -> Vec<Envelope> {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let mut buf = BytesMut::from(&body[..]);
        let mut codec = EnvelopeCodec::default();

        let mut envelopes = Vec::new();
        while let Some(envelope) = codec.decode_eof(&mut buf).unwrap() {
            envelopes.push(envelope);
        }
        envelopes
    }

    fn end_of(envelopes: &[Envelope]) -> EndStream {
        let last = envelopes.last().unwrap();
        assert!(last.is_end_stream());
        serde_json::from_slice(&last.data).unwrap()
    }

    #[tokio::test]
    async fn test_streams_every_message_then_ends() {
        let response = router().handle(count_request(3)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/connect+proto"
        );

        let envelopes = envelopes(response).await;
        assert_eq!(envelopes.len(), 4);

        let counts: Vec<u32> = envelopes[..3]
            .iter()
            .map(|envelope| MessageCodec.unmarshal::<Count>(envelope.data.clone()).unwrap().n)
            .collect();
        assert_eq!(counts, vec![1, 2, 3]);
        assert_eq!(end_of(&envelopes), EndStream::ok());
        assert_eq!(&envelopes[3].data[..], b"{}");
    }

    #[tokio::test]
    async fn test_handler_error_closes_the_stream() {
        let envelopes = envelopes(router().handle(count_request(20)).await).await;

        assert_eq!(envelopes.len(), 13);
        let error = end_of(&envelopes).error.unwrap();
        assert_eq!(error.code, super::super::ConnectCode::FailedPrecondition);
        assert_eq!(error.message, "unlucky");
    }

    #[tokio::test]
    async fn test_wrong_method_is_405() {
        let request = Request::get(PATH).body(Full::new(Bytes::new())).unwrap();
        let response = router().handle(request).await;

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "POST");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let request = Request::post("/count.v1.CountService/Missing")
            .header(header::CONTENT_TYPE, "application/connect+proto")
            .body(Full::new(Bytes::new()))
            .unwrap();

        assert_eq!(router().handle(request).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unsupported_content_type_is_415() {
        let request = Request::post(PATH)
            .header(header::CONTENT_TYPE, "application/connect+json")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = router().handle(request).await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(response.headers()["accept-post"], "application/connect+proto");
    }

    #[tokio::test]
    async fn test_malformed_requests_end_with_an_error() {
        let payload = MessageCodec.marshal(&Count { n: 1 }).unwrap();
        let one = Envelope::message(payload).into_bytes();

        let cases = [
            // Truncated envelope.
            (Bytes::from_static(b"\x00\x00\x00\x00\x09ab"), tonic::Code::InvalidArgument),
            // Empty body.
            (Bytes::new(), tonic::Code::InvalidArgument),
            // Two envelopes.
            (Bytes::from([&one[..], &one[..]].concat()), tonic::Code::InvalidArgument),
            // Compressed envelope.
            (Bytes::from_static(b"\x01\x00\x00\x00\x00"), tonic::Code::Unimplemented),
            // Not a Count.
            (Bytes::from_static(b"\x00\x00\x00\x00\x02\x08\xff"), tonic::Code::InvalidArgument),
        ];

        for (body, code) in cases {
            let response = router().handle(request(body.clone())).await;
            assert_eq!(response.status(), StatusCode::OK);

            let envelopes = envelopes(response).await;
            assert_eq!(envelopes.len(), 1, "body {body:?}");
            let status = end_of(&envelopes).into_result().unwrap_err();
            assert_eq!(status.code(), code, "body {body:?}");
        }
    }

    #[tokio::test]
    async fn test_invalid_timeout_is_rejected() {
        let mut request = count_request(1);
        request
            .headers_mut()
            .insert(TIMEOUT_HEADER, HeaderValue::from_static("soon"));

        let envelopes = envelopes(router().handle(request).await).await;
        let status = end_of(&envelopes).into_result().unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unknown_protocol_version_is_rejected() {
        let mut request = count_request(1);
        request
            .headers_mut()
            .insert(PROTOCOL_VERSION_HEADER, HeaderValue::from_static("2"));

        let envelopes = envelopes(router().handle(request).await).await;
        assert_eq!(envelopes.len(), 1);
    }

    #[test]
    fn test_timeout_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_timeout(&headers).unwrap(), None);

        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("250"));
        assert_eq!(
            parse_timeout(&headers).unwrap(),
            Some(Duration::from_millis(250))
        );

        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("12345678901"));
        assert!(parse_timeout(&headers).is_err());
    }
}
