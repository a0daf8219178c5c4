//! Mirage Tunnel middle relay
//!
//! One overlay hop of one path. Forwards framed traffic between the entry
//! and the exit, emulating per-path delay, jitter, and loss, and recording
//! attacker-view traces for the uplink direction.

use anyhow::{Context, Result};
use clap::Parser;
use mirage_tunnel::config::Config;
use mirage_tunnel::relay::{LinkEmulation, MiddleNode};
use mirage_tunnel::runlog::RunContext;
use std::time::Duration;
use tracing::info;

/// Mirage Tunnel middle relay
#[derive(Parser, Debug)]
#[command(name = "mirage-middle")]
#[command(about = "Mirage Tunnel middle relay - one emulated overlay path")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(long)]
    config: Option<String>,

    /// Listen port for the entry connection
    #[arg(long)]
    listen_port: Option<u16>,

    /// Exit node port to forward to
    #[arg(long)]
    exit_port: Option<u16>,

    /// Server port (unused by the middle, accepted for launcher parity)
    #[arg(long)]
    server_port: Option<u16>,

    /// Path id for traces; derived from the port list when omitted
    #[arg(long)]
    path_id: Option<u8>,

    /// Emulated base one-way delay in milliseconds
    #[arg(long, default_value_t = 20)]
    base_delay_ms: u64,

    /// Emulated delay jitter in milliseconds
    #[arg(long, default_value_t = 10)]
    jitter_ms: u64,

    /// Emulated per-frame loss rate in [0, 1]
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

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
    if let Some(run_id) = &args.run_id {
        config.run_id = Some(run_id.clone());
    }

    let listen_port = args
        .listen_port
        .or_else(|| config.middle_ports.first().copied())
        .context("no listen port configured")?;
    let exit_port = args.exit_port.unwrap_or(config.exit_port);
    let path_id = args.path_id.unwrap_or_else(|| {
        config
            .middle_ports
            .iter()
            .position(|&port| port == listen_port)
            .unwrap_or(0) as u8
    });

    let emulation = LinkEmulation {
        base_delay: Duration::from_millis(args.base_delay_ms),
        jitter: Duration::from_millis(args.jitter_ms),
        loss_rate: args.loss.clamp(0.0, 1.0),
    };

    let runlog = RunContext::init(&config).context("Failed to initialize run outputs")?;
    info!(
        "middle node v{} (path {path_id}, delay {}ms, loss {:.0}%)",
        mirage_tunnel::VERSION,
        args.base_delay_ms,
        emulation.loss_rate * 100.0
    );

    let node = MiddleNode::new(config, runlog, path_id, emulation);
    tokio::select! {
        result = node.run(listen_port, exit_port) => result.context("middle node failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
