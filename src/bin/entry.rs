//! Mirage Tunnel entry node
//!
//! Client-facing ingress: fragments the client bytestream, shapes and
//! obfuscates each fragment, and fans the frames out across the middle
//! paths. The echoed downlink is reassembled and written back in order.

use anyhow::{Context, Result};
use clap::Parser;
use mirage_tunnel::config::{parse_port_list, Config};
use mirage_tunnel::relay::EntryNode;
use mirage_tunnel::runlog::RunContext;
use tracing::info;

/// Mirage Tunnel entry node
#[derive(Parser, Debug)]
#[command(name = "mirage-entry")]
#[command(about = "Mirage Tunnel entry node - client-facing multi-path ingress")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(long)]
    config: Option<String>,

    /// Listen port for client connections
    #[arg(long)]
    listen_port: Option<u16>,

    /// Comma-separated middle relay ports
    #[arg(long)]
    middle_ports: Option<String>,

    /// Exit node port (unused by the entry, accepted for launcher parity)
    #[arg(long)]
    exit_port: Option<u16>,

    /// Server port (unused by the entry, accepted for launcher parity)
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
    if let Some(run_id) = &args.run_id {
        config.run_id = Some(run_id.clone());
    }
    let listen_port = args.listen_port.unwrap_or(config.entry_port);

    let runlog = RunContext::init(&config).context("Failed to initialize run outputs")?;
    info!(
        "entry node v{} ({} paths, mode {:?})",
        mirage_tunnel::VERSION,
        config.path_count(),
        config.mode
    );

    let node = EntryNode::new(config, runlog);
    tokio::select! {
        result = node.run(listen_port) => result.context("entry node failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
