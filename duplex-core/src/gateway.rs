//! # Dual-Protocol Gateway
//!
//! One TCP listener serving gRPC and Connect side by side.
//!
//! ## How it works
//!
//! 1. [`Gateway::start`] binds the listener before anything else. The returned
//!    [`GatewayHandle`] exposes the bound address, so callers can connect as soon as it
//!    returns.
//! 2. Each accepted connection is served by hyper's auto builder, which speaks HTTP/2 when
//!    the client sends the cleartext preface and HTTP/1.1 otherwise.
//! 3. Each request is dispatched on its content type: `application/grpc` (and its `+proto`
//!    variants) goes to the tonic [`Routes`], everything else to the [`ConnectRouter`].
//! 4. [`GatewayHandle::shutdown`] closes the listening socket, so new connections are
//!    refused, then asks every open connection to finish its in-flight streams and waits
//!    for them (up to the grace period).
use crate::connect::server::ConnectRouter;
use crate::stream::DEFAULT_STREAM_BUFFER;
use http::{Request, Response, header};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::{conn::auto, graceful::GracefulShutdown},
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tonic::{body::Body, codegen::Service, service::Routes};

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listener settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind. Port `0` picks a free port.
    pub addr: SocketAddr,
    /// How long shutdown waits for in-flight calls before giving up on them.
    pub grace_period: Duration,
    /// Capacity of the channel between each handler and its transport.
    pub stream_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            grace_period: Duration::from_secs(10),
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to bind '{addr}': '{source}'")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("The listener task failed: '{0}'")]
    Join(#[from] tokio::task::JoinError),
}

/// Builder for the gateway.
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
    grpc: Routes,
    connect: ConnectRouter,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            grpc: Routes::default(),
            connect: ConnectRouter::new(),
        }
    }

    /// The gRPC services, typically built with `Routes::new(GeneratedServer::new(..))`.
    pub fn grpc_routes(mut self, routes: Routes) -> Self {
        self.grpc = routes;
        self
    }

    /// The Connect routes. The configured stream buffer is applied to them.
    pub fn connect_router(mut self, router: ConnectRouter) -> Self {
        self.connect = router;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Binds the listener and starts serving.
    ///
    /// # Returns
    ///
    /// * `Ok(GatewayHandle)` - The gateway is accepting connections.
    /// * `Err(GatewayError::Bind)` - The address could not be bound.
    pub async fn start(self) -> Result<GatewayHandle, GatewayError> {
        let Self {
            config,
            grpc,
            connect,
        } = self;

        let listener = TcpListener::bind(config.addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: config.addr,
                source,
            })?;

        let local_addr = listener
            .local_addr()
            .map_err(|source| GatewayError::Bind {
                addr: config.addr,
                source,
            })?;

        tracing::info!(addr = %local_addr, "Gateway listening");

        let service = GatewayService {
            grpc,
            connect: Arc::new(connect.stream_buffer(config.stream_buffer)),
        };
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            service,
            shutdown.clone(),
            config.grace_period,
        ));

        Ok(GatewayHandle {
            local_addr,
            shutdown,
            task,
        })
    }
}

/// A running gateway.
#[derive(Debug)]
pub struct GatewayHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    /// The bound address, with the real port when port `0` was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Base URL for clients, e.g. `http://127.0.0.1:8080`.
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// A token that triggers the graceful shutdown when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Shuts down gracefully and waits until every connection is closed.
    pub async fn shutdown(self) -> Result<(), GatewayError> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Waits for the gateway to stop, after its shutdown token is cancelled.
    pub async fn wait(self) -> Result<(), GatewayError> {
        self.task.await?;
        Ok(())
    }
}

async fn serve(
    listener: TcpListener,
    service: GatewayService,
    shutdown: CancellationToken,
    grace_period: Duration,
) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            (stream, peer) = accept_with_backoff(|| listener.accept()) => {
                tracing::debug!(%peer, "Accepted connection");

                let service = service.clone();
                let connection = builder.serve_connection_with_upgrades(
                    TokioIo::new(stream),
                    service_fn(move |request| service.clone().dispatch(request)),
                );
                let connection = graceful.watch(connection.into_owned());

                connections.spawn(async move {
                    match connection.await {
                        Ok(()) => tracing::debug!(%peer, "Connection closed"),
                        Err(err) => tracing::debug!(%peer, error = %err, "Connection closed with an error"),
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.cancelled() => break,
        }
    }

    // New connections are refused from here on; accepted ones keep their own sockets.
    drop(listener);

    tracing::info!("Shutting down, draining in-flight calls");

    tokio::select! {
        _ = graceful.shutdown() => tracing::info!("All connections drained"),
        _ = tokio::time::sleep(grace_period) => {
            tracing::warn!(
                ?grace_period,
                open = connections.len(),
                "Grace period elapsed, aborting open connections"
            )
        }
    }

    // Aborts whatever outlived the grace period and waits for every task to finish.
    connections.shutdown().await;
}

/// Retries `accept` until it succeeds, pausing after each failure.
///
/// Accept errors are usually transient (EMFILE, ECONNABORTED) and retrying at once would spin.
async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to accept a connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Routes each request to the protocol stack that understands it.
#[derive(Clone)]
struct GatewayService {
    grpc: Routes,
    connect: Arc<ConnectRouter>,
}

impl GatewayService {
    async fn dispatch(mut self, request: Request<Incoming>) -> Result<Response<Body>, Infallible> {
        if !is_grpc(&request) {
            return Ok(self.connect.handle(request).await);
        }

        tracing::debug!(path = request.uri().path(), "gRPC call");

        std::future::poll_fn(|cx| {
            <Routes as Service<Request<Incoming>>>::poll_ready(&mut self.grpc, cx)
        })
        .await?;
        <Routes as Service<Request<Incoming>>>::call(&mut self.grpc, request).await
    }
}

fn is_grpc<B>(request: &Request<B>) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value.starts_with("application/grpc") && !value.starts_with("application/grpc-web")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(content_type: &str) -> Request<()> {
        Request::post("/greet.v1.GreetService/Greet")
            .header(header::CONTENT_TYPE, content_type)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_demux_by_content_type() {
        assert!(is_grpc(&request("application/grpc")));
        assert!(is_grpc(&request("application/grpc+proto")));
        assert!(!is_grpc(&request("application/grpc-web+proto")));
        assert!(!is_grpc(&request("application/connect+proto")));
        assert!(!is_grpc(&Request::post("/").body(()).unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_errors_back_off_before_retrying() {
        let mut attempts = 0;
        let started = tokio::time::Instant::now();

        let accepted = accept_with_backoff(|| {
            attempts += 1;
            let outcome = if attempts < 3 {
                Err(std::io::Error::other("too many open files"))
            } else {
                Ok(attempts)
            };
            async move { outcome }
        })
        .await;

        assert_eq!(accepted, 3);
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF * 2);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = GatewayConfig {
            addr: taken.local_addr().unwrap(),
            ..Default::default()
        };

        let err = Gateway::new(config).start().await.unwrap_err();

        assert!(matches!(err, GatewayError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_port_zero_reports_the_real_port() {
        let config = GatewayConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };

        let handle = Gateway::new(config).start().await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert!(handle.url().starts_with("http://127.0.0.1:"));

        handle.shutdown().await.unwrap();
    }
}
