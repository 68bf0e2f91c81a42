use anyhow::{Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wsproxy_config::{DstConfig, ServerConfig};
use wsproxy_control::Hub;
use wsproxy_server::ProxyServer;

/// WebSocket reverse proxy: relays every client connection to one backend
#[derive(Parser, Debug)]
#[command(name = "websocket-proxy")]
#[command(version)]
struct Cli {
    /// Host to listen on (empty for all interfaces)
    #[arg(long, env = "WSPROXY_HOST", default_value = "")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "WSPROXY_PORT")]
    port: String,

    /// URI path accepting client connections
    #[arg(long, env = "WSPROXY_PATH", default_value = "/")]
    path: String,

    /// Backend host
    #[arg(long, env = "WSPROXY_DST_HOST", default_value = "127.0.0.1")]
    dst_host: String,

    /// Backend port (omitted from the backend URL when empty)
    #[arg(long, env = "WSPROXY_DST_PORT", default_value = "")]
    dst_port: String,

    /// Backend URI path
    #[arg(long, env = "WSPROXY_DST_PATH", default_value = "/")]
    dst_path: String,

    /// Dial the backend over ws:// instead of wss://
    #[arg(long, env = "WSPROXY_INSECURE")]
    insecure: bool,

    /// File receiving JSON log lines
    #[arg(long, env = "WSPROXY_LOG_FILE", default_value = "/tmp/websocket-proxy.log")]
    log_file: PathBuf,

    /// Log human-readable lines to stderr instead of the log file
    #[arg(long)]
    log_stderr: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// How long to let sessions close after Ctrl+C
    #[arg(long, env = "WSPROXY_SHUTDOWN_GRACE_MS", default_value = "500")]
    shutdown_grace_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config = ServerConfig::new(cli.host.clone(), cli.port.clone(), &cli.path);
    config.validate().context("Invalid listen configuration")?;

    let dst = DstConfig::new(
        ServerConfig::new(cli.dst_host.clone(), cli.dst_port.clone(), &cli.dst_path),
        cli.insecure,
    );

    info!("Listen on {}, proxy to {}", config, dst);

    let hub = Arc::new(Hub::new());
    let server = ProxyServer::new(config, dst, hub.clone());
    let server_task = tokio::spawn(server.start());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = server_task => {
            match result {
                Ok(Ok(())) => {
                    info!("Server stopped");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    error!("Server error: {}", e);
                    return Err(e).context("Proxy server failed");
                }
                Err(e) => {
                    return Err(e).context("Proxy server task panicked");
                }
            }
        }
    }

    hub.stop().await;

    let closing = hub.clone();
    tokio::spawn(async move {
        let count = closing.close_all().await;
        info!("Closed {} connections", count);
    });

    tokio::time::sleep(Duration::from_millis(cli.shutdown_grace_ms)).await;
    info!("Shutdown complete");

    Ok(())
}

fn setup_logging(cli: &Cli) -> Result<()> {
    let log_level = if cli.verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, stderr_layer) = if cli.log_stderr {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false);
        (None, Some(layer))
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cli.log_file)
            .with_context(|| format!("Failed to open log file {}", cli.log_file.display()))?;
        let layer = fmt::layer()
            .json()
            .with_writer(Mutex::new(file))
            .with_target(true)
            .with_thread_ids(false);
        (Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(filter)
        .init();

    Ok(())
}
