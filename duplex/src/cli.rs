//! # CLI
//!
//! This module defines the command-line interface of `duplex` using `clap`.
//!
//! Every flag can also be set through a `DUPLEX_*` environment variable.
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "duplex",
    version,
    about = "Serve greet.v1 over Connect and gRPC on one port"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway until Ctrl-C
    ///
    /// Connect and gRPC requests are accepted on the same address.
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// duplex serve --addr 0.0.0.0:8080 --grace-period-ms 5000
    /// ```
    Serve {
        /// Address to listen on
        #[arg(long, env = "DUPLEX_ADDR", default_value = "127.0.0.1:8080")]
        addr: SocketAddr,

        /// How long in-flight streams may keep running once shutdown starts
        #[arg(
            long = "grace-period-ms",
            env = "DUPLEX_GRACE_PERIOD_MS",
            default_value = "10000",
            value_parser = parse_millis
        )]
        grace_period: Duration,

        /// Responses buffered per stream before the handler is slowed down
        #[arg(long, env = "DUPLEX_STREAM_BUFFER", default_value_t = 16, value_parser = parse_buffer)]
        stream_buffer: usize,
    },

    /// Call a running server over both protocols and compare the responses
    ///
    /// ## Examples:
    ///
    /// ```bash
    /// duplex check --url http://127.0.0.1:8080 --name matt
    /// ```
    Check {
        /// The server URL (e.g. http://127.0.0.1:8080)
        #[arg(long, env = "DUPLEX_URL", default_value = "http://127.0.0.1:8080")]
        url: String,

        #[arg(long, default_value = "matt")]
        name: String,

        /// Deadline applied to each call
        #[arg(long = "timeout-ms", value_parser = parse_millis)]
        timeout: Option<Duration>,
    },

    /// Start an in-process gateway, greet through both clients and stop
    Demo {
        #[arg(long, default_value = "matt")]
        name: String,
    },
}

fn parse_millis(value: &str) -> Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| format!("Invalid milliseconds '{value}': {e}"))
}

fn parse_buffer(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("The stream buffer must hold at least one response".to_string()),
        Ok(size) => Ok(size),
        Err(e) => Err(format!("Invalid buffer size '{value}': {e}")),
    }
}
