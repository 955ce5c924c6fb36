//! stdio-bridge binary: spawn the configured command and serve it over HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use stdio_bridge::transport::{ServerConfig, serve};
use stdio_bridge::{CorrelationMode, RelayConfig, RelayService, SubprocessConfig};

#[derive(Parser, Debug)]
#[command(name = "stdio-bridge", version)]
#[command(about = "Relay HTTP JSON-RPC requests to a stdio subprocess")]
struct Args {
    /// Command that starts the stdio server, run as `bash -lc "exec <command>"`
    #[arg(long, env = "MCP_CMD")]
    command: String,

    /// Host to bind to
    #[arg(long, env = "BRIDGE_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "BRIDGE_PORT", default_value_t = 8080)]
    port: u16,

    /// How long to wait for a reply before answering 504
    #[arg(
        long,
        env = "BRIDGE_TIMEOUT_MS",
        default_value_t = 8000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout_ms: u64,

    /// How replies are matched to requests
    #[arg(long, env = "BRIDGE_CORRELATION", value_enum, default_value_t = CorrelationMode::Identifier)]
    correlation: CorrelationMode,

    /// Extra environment variable for the subprocess (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

impl Args {
    fn subprocess(&self) -> SubprocessConfig {
        self.env
            .iter()
            .fold(SubprocessConfig::shell(&self.command), |config, (k, v)| {
                config.with_env(k, v)
            })
    }

    fn relay(&self) -> RelayConfig {
        RelayConfig::default()
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_correlation(self.correlation)
    }

    fn server(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Initialize tracing with BRIDGE_LOG and LOG_FORMAT support.
///
/// Logs always go to stderr.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("BRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("stdio_bridge={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    tracing::info!(
        version = stdio_bridge::BRIDGE_VERSION,
        command = %args.command,
        "Starting stdio-bridge"
    );

    let service = RelayService::start(&args.subprocess(), args.relay())
        .context("failed to start subprocess")?;

    serve(args.server(), Arc::new(service)).await
}
