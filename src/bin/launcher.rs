//! Mirage Tunnel launcher
//!
//! Spawns a full loopback topology in dependency order (server, exit,
//! middles, entry, client), waits for the client to finish its sessions,
//! then tears everything down. Exit code 0 on a clean run, nonzero when
//! any node fails to start or the client reports failures.

use anyhow::{bail, Context, Result};
use clap::Parser;
use mirage_tunnel::config::Config;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{info, warn};

/// Mirage Tunnel launcher
#[derive(Parser, Debug)]
#[command(name = "mirage-launch")]
#[command(about = "Mirage Tunnel launcher - spawns server, exit, middles, entry, client")]
#[command(version)]
struct Args {
    /// Message size for the client
    #[arg(long, default_value_t = 4096)]
    size: usize,

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

    let mut config = Config::default();
    config.apply_env();
    let run_id = args
        .run_id
        .or_else(|| config.run_id.clone())
        .unwrap_or_else(|| format!("{:08x}", rand::random::<u32>()));
    let out_dir = std::env::var("OUT_DIR").unwrap_or_else(|_| format!("out/{run_id}"));
    info!("launching run {run_id} into {out_dir}");

    let mut nodes: Vec<(&str, Child)> = Vec::new();

    let server = spawn_node(
        "mirage-server",
        &[format!("--listen-port={}", config.server_port)],
        &run_id,
        &out_dir,
    )?;
    nodes.push(("server", server));
    sleep(Duration::from_millis(300)).await;

    let exit = spawn_node(
        "mirage-exit",
        &[
            format!("--listen-port={}", config.exit_port),
            format!("--server-port={}", config.server_port),
        ],
        &run_id,
        &out_dir,
    )?;
    nodes.push(("exit", exit));
    sleep(Duration::from_millis(300)).await;

    for (path_id, &port) in config.middle_ports.iter().enumerate() {
        let middle = spawn_node(
            "mirage-middle",
            &[
                format!("--listen-port={port}"),
                format!("--exit-port={}", config.exit_port),
                format!("--path-id={path_id}"),
            ],
            &run_id,
            &out_dir,
        )?;
        nodes.push(("middle", middle));
    }
    sleep(Duration::from_millis(300)).await;

    let middle_ports = config
        .middle_ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let entry = spawn_node(
        "mirage-entry",
        &[
            format!("--listen-port={}", config.entry_port),
            format!("--middle-ports={middle_ports}"),
        ],
        &run_id,
        &out_dir,
    )?;
    nodes.push(("entry", entry));
    sleep(Duration::from_millis(500)).await;

    let mut client = spawn_node(
        "mirage-client",
        &[
            format!("--entry-port={}", config.entry_port),
            format!("--size={}", args.size),
        ],
        &run_id,
        &out_dir,
    )?;

    let status = client.wait().await.context("client wait failed")?;

    for (name, mut node) in nodes {
        if let Err(e) = node.start_kill() {
            warn!("failed to stop {name}: {e}");
        }
        let _ = node.wait().await;
    }

    if !status.success() {
        bail!("client exited with {status}");
    }
    info!("run {run_id} complete");
    Ok(())
}

/// Spawn a sibling binary with the shared run environment.
fn spawn_node(name: &str, args: &[String], run_id: &str, out_dir: &str) -> Result<Child> {
    let path = sibling(name)?;
    Command::new(&path)
        .args(args)
        .env("RUN_ID", run_id)
        .env("OUT_DIR", out_dir)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", path.display()))
}

/// Node binaries live next to the launcher.
fn sibling(name: &str) -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate current executable")?;
    let dir = exe.parent().context("executable has no parent directory")?;
    Ok(dir.join(name))
}
