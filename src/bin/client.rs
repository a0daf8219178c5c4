//! Mirage Tunnel test client
//!
//! Connects to the entry node, sends seeded random messages, verifies the
//! echoed bytes, and records per-message latency.

use anyhow::{Context, Result};
use clap::Parser;
use mirage_tunnel::config::Config;
use mirage_tunnel::runlog::{LatencyRecord, RunContext};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info};

/// Per-message echo deadline
const ECHO_TIMEOUT: Duration = Duration::from_secs(30);

/// Mirage Tunnel test client
#[derive(Parser, Debug)]
#[command(name = "mirage-client")]
#[command(about = "Mirage Tunnel test client - sends echo sessions through the entry")]
#[command(version)]
struct Args {
    /// Entry node port
    #[arg(long)]
    entry_port: Option<u16>,

    /// Listen port (unused by the client, accepted for launcher parity)
    #[arg(long)]
    listen_port: Option<u16>,

    /// Message size in bytes
    #[arg(long, default_value_t = 4096)]
    size: usize,

    /// Number of messages; overrides SESSION_COUNT
    #[arg(long)]
    count: Option<u32>,

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
    if let Some(run_id) = &args.run_id {
        config.run_id = Some(run_id.clone());
    }
    if let Some(count) = args.count {
        config.session_count = count;
    }

    let runlog = RunContext::init(&config).context("Failed to initialize run outputs")?;
    let entry_port = args.entry_port.unwrap_or(config.entry_port);
    let addr = format!("{}:{entry_port}", config.entry_host);
    let mut stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Failed to connect to entry {addr}"))?;
    stream.set_nodelay(true).ok();
    info!(
        "sending {} message(s) of {} bytes via {addr}",
        config.session_count, args.size
    );

    let mut rng = StdRng::seed_from_u64(runlog.seed ^ 0xC11E);
    let pause = if config.session_count > 1 {
        Duration::from_secs_f64(config.session_duration_sec as f64 / config.session_count as f64)
    } else {
        Duration::ZERO
    };

    let mut failures = 0u32;
    for session in 0..config.session_count {
        let mut payload = vec![0u8; args.size];
        rng.fill_bytes(&mut payload);

        let start = Instant::now();
        stream.write_all(&payload).await?;
        let mut echoed = vec![0u8; args.size];
        let read = timeout(ECHO_TIMEOUT, stream.read_exact(&mut echoed)).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let success = matches!(read, Ok(Ok(_))) && echoed == payload;

        runlog.log_latency(&LatencyRecord {
            session,
            latency_ms,
            success,
        });
        if success {
            info!("session {session}: echo verified ({:.1} ms)", latency_ms);
        } else {
            failures += 1;
            error!("session {session}: echo mismatch or timeout");
        }
        if !pause.is_zero() {
            sleep(pause).await;
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} sessions failed", config.session_count);
    }
    Ok(())
}
