//! # Call Errors
//!
//! Every way a single RPC can fail, whichever protocol carried it.
//!
//! Failures are per call: none of them stops the gateway or affects other calls. Listener
//! level failures live in [`crate::gateway::GatewayError`].
use crate::{BoxError, codec::CodecError};
use tonic::{Code, Status};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Unsupported message type '{type_name}'")]
    UnsupportedMessageType { type_name: &'static str },

    #[error("Transport error: '{0}'")]
    Transport(#[source] BoxError),

    #[error("Protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("The handler failed with code {:?}: '{}'", .0.code(), .0.message())]
    Handler(Status),

    #[error("The call was cancelled: '{}'", .0.message())]
    Cancelled(Status),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl CallError {
    /// Classifies a status received from a peer.
    pub fn from_status(status: Status) -> Self {
        match status.code() {
            Code::Cancelled | Code::DeadlineExceeded => CallError::Cancelled(status),
            Code::Unavailable => CallError::Transport(Box::new(status)),
            _ => CallError::Handler(status),
        }
    }

    /// The error raised when the caller cancels a call.
    pub fn cancelled() -> Self {
        CallError::Cancelled(Status::cancelled("The call was cancelled by the caller"))
    }

    /// The error raised when a call outlives its deadline.
    pub fn deadline_exceeded() -> Self {
        CallError::Cancelled(Status::deadline_exceeded("The call deadline was exceeded"))
    }

    /// `true` for deadlines and explicit cancellation, which callers usually expect.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CallError::Cancelled(_))
    }

    /// The status code this error is reported with on the wire.
    pub fn code(&self) -> Code {
        match self {
            CallError::UnsupportedMessageType { .. } => Code::Internal,
            CallError::Transport(_) => Code::Unavailable,
            CallError::ProtocolFraming(_) => Code::Internal,
            CallError::Handler(status) | CallError::Cancelled(status) => status.code(),
            CallError::InvalidRequest(_) => Code::InvalidArgument,
        }
    }
}

impl From<CodecError> for CallError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnsupportedMessageType { type_name } => {
                CallError::UnsupportedMessageType { type_name }
            }
            err => CallError::ProtocolFraming(err.to_string()),
        }
    }
}

impl From<CallError> for Status {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Handler(status) | CallError::Cancelled(status) => status,
            err => Status::new(err.code(), err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_codes_are_not_handler_errors() {
        assert!(CallError::from_status(Status::cancelled("bye")).is_cancellation());
        assert!(CallError::from_status(Status::deadline_exceeded("late")).is_cancellation());
        assert!(matches!(
            CallError::from_status(Status::internal("boom")),
            CallError::Handler(_)
        ));
        assert!(matches!(
            CallError::from_status(Status::unavailable("gone")),
            CallError::Transport(_)
        ));
    }

    #[test]
    fn test_status_round_trip_keeps_code_and_message() {
        let status: Status = CallError::Handler(Status::not_found("no such greeting")).into();

        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "no such greeting");
    }

    #[test]
    fn test_codec_errors_are_classified() {
        let unsupported: CallError = CodecError::UnsupportedMessageType { type_name: "Opaque" }.into();
        assert!(matches!(
            unsupported,
            CallError::UnsupportedMessageType { type_name: "Opaque" }
        ));
        assert_eq!(Status::from(unsupported).code(), Code::Internal);
    }
}
