//! Middle node
//!
//! A per-path relay between the entry and the exit. Forwarding is
//! frame-aligned so emulated loss drops whole frames without
//! desynchronizing the byte stream, but the forwarded bytes themselves are
//! never altered. Uplink frames are recorded to the attacker-view trace
//! files; delay and jitter emulation apply in both directions.

use super::RelayError;
use crate::runlog::{RunContext, TraceWriter};
use crate::tunnel::{Frame, Peek};
use crate::Config;
use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{info, warn};

/// Emulated link conditions for one path.
#[derive(Debug, Clone, Copy)]
pub struct LinkEmulation {
    pub base_delay: Duration,
    pub jitter: Duration,
    /// Per-frame drop probability in [0, 1]
    pub loss_rate: f64,
}

impl Default for LinkEmulation {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(20),
            jitter: Duration::from_millis(10),
            loss_rate: 0.0,
        }
    }
}

/// One overlay hop between entry and exit.
pub struct MiddleNode {
    config: Config,
    runlog: Arc<RunContext>,
    path_id: u8,
    emulation: LinkEmulation,
}

impl MiddleNode {
    pub fn new(
        config: Config,
        runlog: Arc<RunContext>,
        path_id: u8,
        emulation: LinkEmulation,
    ) -> Self {
        Self {
            config,
            runlog,
            path_id,
            emulation,
        }
    }

    /// Bind the entry-facing listener and bridge each connection to the
    /// exit. A bind failure is fatal and propagates.
    pub async fn run(&self, listen_port: u16, exit_port: u16) -> Result<(), RelayError> {
        let addr = format!("{}:{}", self.config.middle_host, listen_port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| RelayError::Bind {
            addr: addr.clone(),
            source,
        })?;
        info!(
            "middle path {} listening on {addr}, forwarding to exit port {exit_port}",
            self.path_id
        );

        let mut session: u64 = 0;
        loop {
            let (entry_stream, peer) = listener.accept().await?;
            entry_stream.set_nodelay(true).ok();
            session += 1;
            info!("entry connected from {peer} (session {session})");

            let exit_addr = format!("{}:{}", self.config.exit_host, exit_port);
            let exit_stream = match TcpStream::connect(&exit_addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    stream
                }
                Err(e) => {
                    warn!("exit connect failed: {e}");
                    continue;
                }
            };

            let trace = match self.runlog.trace_writer(session, self.path_id) {
                Ok(writer) => Some(writer),
                Err(e) => {
                    warn!("trace disabled for session {session}: {e}");
                    None
                }
            };

            let (entry_read, entry_write) = entry_stream.into_split();
            let (exit_read, exit_write) = exit_stream.into_split();
            let seed = self.runlog.seed ^ session.wrapping_mul(0x51_7C_C1);
            tokio::spawn(forward(
                entry_read,
                exit_write,
                trace,
                self.emulation,
                seed,
                "up",
            ));
            tokio::spawn(forward(
                exit_read,
                entry_write,
                None,
                self.emulation,
                seed ^ 1,
                "down",
            ));
        }
    }
}

/// Frame-aligned one-way forwarder with loss/delay emulation. Bytes that
/// do decode as frames are forwarded verbatim or dropped whole; bytes that
/// do not are passed through untouched.
async fn forward<R, W>(
    mut reader: R,
    mut writer: W,
    mut trace: Option<TraceWriter>,
    emulation: LinkEmulation,
    seed: u64,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut rng = StdRng::seed_from_u64(seed);
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
                    if let Some(trace) = trace.as_mut() {
                        trace.record(direction, summary.wire_len, summary.payload_len as usize);
                    }
                    if emulation.loss_rate > 0.0 && rng.gen::<f64>() < emulation.loss_rate {
                        continue;
                    }
                    let delay = emulated_delay(&emulation, &mut rng);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    if writer.write_all(&raw).await.is_err() {
                        break 'outer;
                    }
                }
            }
        }
    }
    // Hand over whatever tail is left so the peer sees the same bytes
    if !buf.is_empty() {
        let _ = writer.write_all(&buf).await;
    }
    let _ = writer.shutdown().await;
}

fn emulated_delay(emulation: &LinkEmulation, rng: &mut StdRng) -> Duration {
    let jitter_us = emulation.jitter.as_micros() as u64;
    let jitter = if jitter_us == 0 {
        Duration::ZERO
    } else {
        Duration::from_micros(rng.gen_range(0..=jitter_us))
    };
    emulation.base_delay + jitter
}
