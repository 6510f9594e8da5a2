//! # Connect Protocol
//!
//! The lightweight streaming protocol served next to gRPC.
//!
//! A server-streaming call is a plain HTTP `POST /<package.Service>/<Method>` with
//! content type `application/connect+<codec>`. The request body holds a single
//! [`envelope::Envelope`]; the response body is a sequence of envelopes written as the
//! handler produces messages, closed by an end-of-stream envelope whose JSON payload carries
//! either nothing or the error that ended the call.
//!
//! ## References
//!
//! * [Connect Protocol Reference](https://connectrpc.com/docs/protocol)
pub mod client;
pub mod envelope;
pub mod server;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tonic::{Code, Status};

/// Header carrying the protocol version, always `1`.
pub const PROTOCOL_VERSION_HEADER: &str = "connect-protocol-version";
pub const PROTOCOL_VERSION: &str = "1";
/// Header carrying the call timeout in milliseconds.
pub const TIMEOUT_HEADER: &str = "connect-timeout-ms";

/// Content type of streaming calls encoded with the adaptive codec.
pub const STREAMING_CONTENT_TYPE: &str = "application/connect+proto";

/// Error codes, spelled as the protocol spells them on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectCode {
    // Connect uses the American spelling.
    #[serde(rename = "canceled")]
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl From<Code> for ConnectCode {
    fn from(code: Code) -> Self {
        match code {
            // `Ok` never travels as an error; treat a misuse as unknown.
            Code::Ok | Code::Unknown => ConnectCode::Unknown,
            Code::Cancelled => ConnectCode::Cancelled,
            Code::InvalidArgument => ConnectCode::InvalidArgument,
            Code::DeadlineExceeded => ConnectCode::DeadlineExceeded,
            Code::NotFound => ConnectCode::NotFound,
            Code::AlreadyExists => ConnectCode::AlreadyExists,
            Code::PermissionDenied => ConnectCode::PermissionDenied,
            Code::ResourceExhausted => ConnectCode::ResourceExhausted,
            Code::FailedPrecondition => ConnectCode::FailedPrecondition,
            Code::Aborted => ConnectCode::Aborted,
            Code::OutOfRange => ConnectCode::OutOfRange,
            Code::Unimplemented => ConnectCode::Unimplemented,
            Code::Internal => ConnectCode::Internal,
            Code::Unavailable => ConnectCode::Unavailable,
            Code::DataLoss => ConnectCode::DataLoss,
            Code::Unauthenticated => ConnectCode::Unauthenticated,
        }
    }
}

impl From<ConnectCode> for Code {
    fn from(code: ConnectCode) -> Self {
        match code {
            ConnectCode::Cancelled => Code::Cancelled,
            ConnectCode::Unknown => Code::Unknown,
            ConnectCode::InvalidArgument => Code::InvalidArgument,
            ConnectCode::DeadlineExceeded => Code::DeadlineExceeded,
            ConnectCode::NotFound => Code::NotFound,
            ConnectCode::AlreadyExists => Code::AlreadyExists,
            ConnectCode::PermissionDenied => Code::PermissionDenied,
            ConnectCode::ResourceExhausted => Code::ResourceExhausted,
            ConnectCode::FailedPrecondition => Code::FailedPrecondition,
            ConnectCode::Aborted => Code::Aborted,
            ConnectCode::OutOfRange => Code::OutOfRange,
            ConnectCode::Unimplemented => Code::Unimplemented,
            ConnectCode::Internal => Code::Internal,
            ConnectCode::Unavailable => Code::Unavailable,
            ConnectCode::DataLoss => Code::DataLoss,
            ConnectCode::Unauthenticated => Code::Unauthenticated,
        }
    }
}

/// Code implied by a non-200 HTTP status, for responses that never reached the stream.
pub fn code_from_http_status(status: StatusCode) -> Code {
    match status.as_u16() {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 | 502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Error object of an end-of-stream message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ConnectCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// JSON payload of the end-of-stream envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndStream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Vec<String>>,
}

impl EndStream {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(status: &Status) -> Self {
        Self {
            error: Some(ErrorBody {
                code: status.code().into(),
                message: status.message().to_string(),
            }),
            metadata: HashMap::new(),
        }
    }

    /// `Ok(())` for a normal end, the carried error otherwise.
    pub fn into_result(self) -> Result<(), Status> {
        match self.error {
            None => Ok(()),
            Some(ErrorBody { code, message }) => Err(Status::new(code.into(), message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_use_connect_spelling() {
        let json = serde_json::to_string(&ConnectCode::Cancelled).unwrap();
        assert_eq!(json, "\"canceled\"");

        let json = serde_json::to_string(&ConnectCode::DeadlineExceeded).unwrap();
        assert_eq!(json, "\"deadline_exceeded\"");
    }

    #[test]
    fn test_end_stream_success_is_an_empty_object() {
        assert_eq!(serde_json::to_string(&EndStream::ok()).unwrap(), "{}");
        assert!(EndStream::ok().into_result().is_ok());
    }

    #[test]
    fn test_end_stream_error_round_trip() {
        let end = EndStream::error(&Status::resource_exhausted("slow down"));
        let json = serde_json::to_string(&end).unwrap();
        assert_eq!(
            json,
            r#"{"error":{"code":"resource_exhausted","message":"slow down"}}"#
        );

        let parsed: EndStream = serde_json::from_str(&json).unwrap();
        let status = parsed.into_result().unwrap_err();
        assert_eq!(status.code(), Code::ResourceExhausted);
        assert_eq!(status.message(), "slow down");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(code_from_http_status(StatusCode::NOT_FOUND), Code::Unimplemented);
        assert_eq!(
            code_from_http_status(StatusCode::SERVICE_UNAVAILABLE),
            Code::Unavailable
        );
        assert_eq!(code_from_http_status(StatusCode::IM_A_TEAPOT), Code::Unknown);
    }

    #[test]
    fn test_content_type_uses_codec_name() {
        let suffix = STREAMING_CONTENT_TYPE.rsplit('+').next().unwrap();
        assert_eq!(suffix, crate::codec::CODEC_NAME);
    }
}
