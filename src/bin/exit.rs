//! Mirage Tunnel exit node
//!
//! Terminates the overlay paths: reassembles uplink messages, exchanges
//! them with the upstream echo server, and schedules the shaped responses
//! back across the paths.

use anyhow::{Context, Result};
use clap::Parser;
use mirage_tunnel::config::{parse_port_list, Config};
use mirage_tunnel::relay::ExitNode;
use mirage_tunnel::runlog::RunContext;
use tracing::info;

/// Mirage Tunnel exit node
#[derive(Parser, Debug)]
#[command(name = "mirage-exit")]
#[command(about = "Mirage Tunnel exit node - path-terminating egress")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(long)]
    config: Option<String>,

    /// Listen port for middle connections
    #[arg(long)]
    listen_port: Option<u16>,

    /// Comma-separated middle relay ports (sizes the path set)
    #[arg(long)]
    middle_ports: Option<String>,

    /// Exit port (alias of --listen-port, accepted for launcher parity)
    #[arg(long)]
    exit_port: Option<u16>,

    /// Upstream echo server port
    #[arg(long)]
    server_port: Option<u16>,

    /// Run identifier for output grouping
    #[arg(long)]
    run_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    config.apply_env();
    if let Some(ports) = &args.middle_ports {
        config.middle_ports = parse_port_list(ports)?;
    }
    if let Some(port) = args.server_port {
        config.server_port = port;
    }
    if let Some(run_id) = &args.run_id {
        config.run_id = Some(run_id.clone());
    }
    let listen_port = args
        .listen_port
        .or(args.exit_port)
        .unwrap_or(config.exit_port);

    let runlog = RunContext::init(&config).context("Failed to initialize run outputs")?;
    info!(
        "exit node v{} ({} paths, server port {})",
        mirage_tunnel::VERSION,
        config.path_count(),
        config.server_port
    );

    let node = ExitNode::new(config, runlog);
    tokio::select! {
        result = node.run(listen_port) => result.context("exit node failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
