//! Mirage Tunnel echo server
//!
//! The upstream endpoint the exit pairs frames with: echoes every byte it
//! receives back to the sender.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Mirage Tunnel echo server
#[derive(Parser, Debug)]
#[command(name = "mirage-server")]
#[command(about = "Mirage Tunnel echo server")]
#[command(version)]
struct Args {
    /// Listen port
    #[arg(long, default_value_t = 9301)]
    listen_port: u16,

    /// Server port (alias of --listen-port, accepted for launcher parity)
    #[arg(long)]
    server_port: Option<u16>,

    /// Run identifier (unused, accepted for launcher parity)
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

    let port = args.server_port.unwrap_or(args.listen_port);
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("echo server listening on {addr}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                info!("client connected from {peer}");
                tokio::spawn(async move {
                    if let Err(e) = echo(stream).await {
                        debug!("connection from {peer} ended: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn echo(mut stream: TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true).ok();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stream.write_all(&buf[..n]).await?;
    }
}
