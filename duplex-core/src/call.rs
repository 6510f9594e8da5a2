//! # Client Calls
//!
//! Options shared by both protocol clients, and the [`ResponseStream`] they return.
use crate::error::CallError;
use futures_util::{Stream, StreamExt, stream::BoxStream};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-call options understood by both clients.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline relative to the start of the call. It is sent to the server and enforced
    /// locally as well.
    pub timeout: Option<Duration>,
    /// Cancelling this token aborts the call.
    pub cancel: Option<CancellationToken>,
    /// Custom metadata (headers) to attach to the request.
    pub headers: Vec<(String, String)>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }
}

/// Waits for the first of the caller's cancellation and the deadline.
pub(crate) async fn interrupted(
    cancel: Option<&CancellationToken>,
    deadline: Option<Instant>,
) -> CallError {
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => CallError::cancelled(),
        _ = expired => CallError::deadline_exceeded(),
    }
}

/// The read half of a server-streaming call.
///
/// Iteration ends in exactly one of two ways: [`ResponseStream::message`] returns
/// `Ok(None)` when the server completed the stream normally, or `Err(_)` when the call
/// failed. Once either happened no further item is delivered.
///
/// The stream is fused: the terminal result is reported once, and every later call to
/// `message` returns `Ok(None)`. [`ResponseStream::is_finished`] reports whether that
/// point was reached.
pub struct ResponseStream<T> {
    inner: BoxStream<'static, Result<T, CallError>>,
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
    finished: bool,
}

impl<T: Send + 'static> ResponseStream<T> {
    pub(crate) fn new(
        inner: impl Stream<Item = Result<T, CallError>> + Send + 'static,
        cancel: Option<CancellationToken>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            inner: inner.boxed(),
            cancel,
            deadline,
            finished: false,
        }
    }

    /// Waits for the next response.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(T))` - The next response, in the order the server produced it.
    /// * `Ok(None)` - The stream ended normally.
    /// * `Err(CallError)` - The stream ended with an error. Cancellation and deadlines
    ///   surface as [`CallError::Cancelled`].
    ///
    /// After the first `Ok(None)` or `Err(_)` the stream is fused and keeps returning
    /// `Ok(None)`.
    pub async fn message(&mut self) -> Result<Option<T>, CallError> {
        if self.finished {
            return Ok(None);
        }

        let Self {
            inner,
            cancel,
            deadline,
            ..
        } = self;

        let next = tokio::select! {
            biased;
            err = interrupted(cancel.as_ref(), *deadline) => Some(Err(err)),
            next = inner.next() => next,
        };

        match next {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(err)) => {
                self.finish();
                Err(err)
            }
            None => {
                self.finish();
                Ok(None)
            }
        }
    }

    /// Whether a terminal result (normal end or error) was already returned.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drains the stream, returning every response or the error that ended it.
    pub async fn collect(mut self) -> Result<Vec<T>, CallError> {
        let mut items = Vec::new();
        while let Some(item) = self.message().await? {
            items.push(item);
        }
        Ok(items)
    }

    // Dropping the transport stream resets it, which tells the server to stop.
    fn finish(&mut self) {
        self.finished = true;
        self.inner = futures_util::stream::empty().boxed();
    }
}
