//! # Server Streams
//!
//! Business logic is written once, against a [`ResponseSink`], and each protocol front-end
//! adapts the resulting stream to its own framing.
//!
//! [`spawn_call`] runs a [`StreamingHandler`] on its own task. Emitted items flow through a
//! bounded channel: when the transport stops pulling, the channel fills up and
//! [`ResponseSink::send`] waits, so a slow reader never makes the server buffer without
//! limit. When the reader goes away the handler is dropped mid-flight.
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

/// Default capacity of the channel between a handler and its transport.
pub const DEFAULT_STREAM_BUFFER: usize = 16;

/// A server-streaming method, independent of the protocol it is reached through.
#[tonic::async_trait]
pub trait StreamingHandler: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Emits the responses for `request` in order through `sink`.
    ///
    /// Returning `Ok(())` completes the stream normally; returning an error terminates it
    /// with that status, after every item already sent.
    async fn handle(
        &self,
        request: Self::Request,
        sink: &ResponseSink<Self::Response>,
    ) -> Result<(), Status>;
}

/// The write half of a response stream.
#[derive(Debug)]
pub struct ResponseSink<T> {
    tx: mpsc::Sender<Result<T, Status>>,
}

impl<T> ResponseSink<T> {
    /// Queues `item` for framing, waiting while the transport is behind.
    ///
    /// Fails with `CANCELLED` once the caller stopped reading.
    pub async fn send(&self, item: T) -> Result<(), Status> {
        self.tx
            .send(Ok(item))
            .await
            .map_err(|_| Status::cancelled("The caller is no longer reading this stream"))
    }

    /// `true` once the caller stopped reading.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Per-call settings derived from the inbound request.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    deadline: Option<Instant>,
    buffer: usize,
}

impl Default for CallContext {
    fn default() -> Self {
        Self {
            deadline: None,
            buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl CallContext {
    pub fn new(buffer: usize) -> Self {
        Self {
            deadline: None,
            buffer: buffer.max(1),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Starts `handler` for `request` and returns the stream of its responses.
///
/// The stream ends after the last item when the handler succeeds, or yields the handler's
/// error as its final item. Passing the deadline ends it with `DEADLINE_EXCEEDED`.
pub fn spawn_call<H: StreamingHandler>(
    handler: Arc<H>,
    request: H::Request,
    ctx: CallContext,
) -> ReceiverStream<Result<H::Response, Status>> {
    let (tx, rx) = mpsc::channel(ctx.buffer);

    tokio::spawn(async move {
        let sink = ResponseSink { tx };

        let run = async {
            match ctx.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, handler.handle(request, &sink))
                    .await
                    .unwrap_or_else(|_| Err(Status::deadline_exceeded("Call deadline exceeded"))),
                None => handler.handle(request, &sink).await,
            }
        };

        let outcome = tokio::select! {
            outcome = run => outcome,
            _ = sink.tx.closed() => {
                tracing::debug!("Caller went away, dropping the handler");
                return;
            }
        };

        match outcome {
            Ok(()) => tracing::trace!("Handler completed"),
            Err(status) => {
                tracing::debug!(code = ?status.code(), message = status.message(), "Handler failed");
                // A closed channel means nobody is left to tell.
                let _ = sink.tx.send(Err(status)).await;
            }
        }
    });

    ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    struct Countdown {
        from: u32,
        fail_at: Option<u32>,
    }

    #[tonic::async_trait]
    impl StreamingHandler for Countdown {
        type Request = ();
        type Response = u32;

        async fn handle(&self, _: (), sink: &ResponseSink<u32>) -> Result<(), Status> {
            for n in (0..self.from).rev() {
                if self.fail_at == Some(n) {
                    return Err(Status::aborted(format!("stopped at {n}")));
                }
                sink.send(n).await?;
            }
            Ok(())
        }
    }

    struct Stalled;

    #[tonic::async_trait]
    impl StreamingHandler for Stalled {
        type Request = ();
        type Response = u32;

        async fn handle(&self, _: (), sink: &ResponseSink<u32>) -> Result<(), Status> {
            sink.send(1).await?;
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_items_arrive_in_emission_order() {
        let handler = Arc::new(Countdown {
            from: 50,
            fail_at: None,
        });

        let items: Vec<_> = spawn_call(handler, (), CallContext::new(2))
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(items, (0..50).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_handler_error_follows_emitted_items() {
        let handler = Arc::new(Countdown {
            from: 5,
            fail_at: Some(2),
        });

        let items: Vec<_> = spawn_call(handler, (), CallContext::default()).collect().await;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), &4);
        assert_eq!(items[1].as_ref().unwrap(), &3);
        let status = items[2].as_ref().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_ends_the_stream() {
        let deadline = Instant::now() + Duration::from_millis(100);
        let ctx = CallContext::default().with_deadline(Some(deadline));

        let items: Vec<_> = spawn_call(Arc::new(Stalled), (), ctx).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1].as_ref().unwrap_err().code(),
            tonic::Code::DeadlineExceeded
        );
    }

    #[tokio::test]
    async fn test_sink_reports_closed_reader() {
        let (tx, rx) = mpsc::channel(1);
        let sink = ResponseSink { tx };
        drop(rx);

        assert!(sink.is_closed());
        let status = sink.send(7u32).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }
}
