//! Mirage Tunnel monitoring proxy
//!
//! Transparent forwarder: relays framed traffic between a listen port and
//! a target port without altering a single byte, and prints one JSON line
//! per observed frame to stdout.

use anyhow::{Context, Result};
use bytes::BytesMut;
use clap::Parser;
use mirage_tunnel::tunnel::{Frame, Peek};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// Mirage Tunnel monitoring proxy
#[derive(Parser, Debug)]
#[command(name = "mirage-monitor")]
#[command(about = "Mirage Tunnel monitoring proxy - transparent frame logger")]
#[command(version)]
struct Args {
    /// Listen port
    #[arg(long)]
    listen_port: u16,

    /// Target port to forward to
    #[arg(long)]
    target_port: u16,

    /// Target host
    #[arg(long, default_value = "127.0.0.1")]
    target_host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let addr = format!("127.0.0.1:{}", args.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(
        "monitor listening on {addr}, forwarding to {}:{}",
        args.target_host, args.target_port
    );

    loop {
        let (downstream, peer) = listener.accept().await?;
        downstream.set_nodelay(true).ok();
        info!("connection from {peer}");
        let target = format!("{}:{}", args.target_host, args.target_port);
        tokio::spawn(async move {
            let upstream = match TcpStream::connect(&target).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    stream
                }
                Err(e) => {
                    warn!("target connect failed: {e}");
                    return;
                }
            };
            let (down_read, down_write) = downstream.into_split();
            let (up_read, up_write) = upstream.into_split();
            tokio::join!(
                tap(down_read, up_write, "up"),
                tap(up_read, down_write, "down"),
            );
        });
    }
}

/// Forward bytes verbatim, emitting a JSON line per complete frame.
async fn tap<R, W>(mut reader: R, mut writer: W, direction: &'static str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(16 * 1024);
    'outer: loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        loop {
            match Frame::peek(&buf) {
                Peek::NeedMore => break,
                Peek::Junk { skip } => {
                    let raw = buf.split_to(skip);
                    if writer.write_all(&raw).await.is_err() {
                        break 'outer;
                    }
                }
                Peek::Frame(summary) => {
                    let raw = buf.split_to(summary.wire_len);
                    println!(
                        "{}",
                        json!({
                            "dir": direction,
                            "proto_id": summary.proto_id,
                            "flags": summary.flags,
                            "extra_len": summary.extra_len,
                            "seq": summary.seq,
                            "frag_id": summary.frag_id,
                            "frag_total": summary.frag_total,
                            "payload_len": summary.payload_len,
                        })
                    );
                    if writer.write_all(&raw).await.is_err() {
                        break 'outer;
                    }
                }
            }
        }
    }
    if !buf.is_empty() {
        let _ = writer.write_all(&buf).await;
    }
    let _ = writer.shutdown().await;
}
