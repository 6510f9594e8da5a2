//! # Duplex CLI Entry Point
//!
//! The main executable for duplex. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Parses command-line arguments using [`cli::Cli`] and installs the
//!    `tracing` subscriber (`RUST_LOG` overrides the default `info` filter).
//! 2. **Execution**: Runs the gateway, the conformance check or the in-process demo.
//! 3. **Presentation**: Formats and prints the results or the error to standard output/error.

mod cli;
mod formatter;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use duplex_core::call::CallOptions;
use duplex_core::connect::client::ConnectClient;
use duplex_core::gateway::GatewayConfig;
use duplex_core::grpc::client::GrpcClient;
use formatter::{FormattedString, Greeting};
use greet_service::pb::{GreetRequest, GreetResponse};
use greet_service::{GREET_PATH, GreetServer, conformance};
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();

    let result = match args.command {
        Commands::Serve {
            addr,
            grace_period,
            stream_buffer,
        } => {
            serve(GatewayConfig {
                addr,
                grace_period,
                stream_buffer,
            })
            .await
        }
        Commands::Check { url, name, timeout } => check(&url, name, timeout).await,
        Commands::Demo { name } => demo(name).await,
    };

    if let Err(err) = result {
        eprintln!("{}", FormattedString::from(err));
        process::exit(1);
    }
}

async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    let handle = greet_service::gateway(config, Arc::new(GreetServer))
        .start()
        .await?;

    tracing::info!(url = %handle.url(), "Serving greet.v1 over Connect and gRPC");

    let token = handle.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Ctrl-C received, draining in-flight streams"),
            Err(err) => tracing::warn!(error = %err, "Failed to listen for Ctrl-C"),
        }
        token.cancel();
    });

    handle.wait().await?;
    Ok(())
}

async fn check(url: &str, name: String, timeout: Option<Duration>) -> anyhow::Result<()> {
    let mut options = CallOptions::default();
    if let Some(timeout) = timeout {
        options = options.with_timeout(timeout);
    }

    let report = conformance::check(url, &GreetRequest { name }, options)
        .await
        .with_context(|| format!("Conformance check against {url} failed"))?;

    println!("{}", FormattedString::from(report));
    Ok(())
}

/// Serves on an ephemeral port, greets through both clients and shuts down.
async fn demo(name: String) -> anyhow::Result<()> {
    let config = GatewayConfig {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..Default::default()
    };
    // `start` only returns once the listener is bound.
    let handle = greet_service::gateway(config, Arc::new(GreetServer))
        .start()
        .await?;
    let url = handle.url();
    let request = GreetRequest { name };

    let mut responses = ConnectClient::new(&url)?
        .server_streaming::<GreetRequest, GreetResponse>(
            GREET_PATH,
            &request,
            CallOptions::default(),
        )
        .await
        .context("Connect call failed")?;
    while let Some(response) = responses.message().await? {
        print!("{}", FormattedString::from(Greeting("connect", &response)));
    }

    let mut responses = GrpcClient::connect(&url)
        .await?
        .server_streaming::<GreetRequest, GreetResponse>(
            GREET_PATH,
            request,
            CallOptions::default(),
        )
        .await
        .context("gRPC call failed")?;
    while let Some(response) = responses.message().await? {
        print!("{}", FormattedString::from(Greeting("grpc", &response)));
    }

    handle.shutdown().await?;
    Ok(())
}
