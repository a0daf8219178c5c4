//! Entry node
//!
//! Accepts a client TCP stream, splits it into logical messages (one group
//! per read), fans the shaped and wrapped fragments out across the middle
//! paths, and reassembles the echoed downlink. The downlink consumer is a
//! byte stream, so completed groups are written back in group-id order
//! even though the scheduler delivers them in completion order.

use super::{
    clear_acked, snapshot_handles, spawn_reaper, spawn_window_ticker, FrameSender, RelayError,
    SharedPaths,
};
use crate::config::Config;
use crate::path::{PathHandle, PathTuning};
use crate::runlog::RunContext;
use crate::scheduler::ReceiveDedup;
use crate::strategy::StrategyEngine;
use crate::tunnel::{Frame, FragmentBuffer};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{tcp::OwnedWriteHalf, TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Sender id of the exit node in reassembly keys; there is one exit
const EXIT_SENDER: u64 = 0;

/// Client-facing ingress of the tunnel.
pub struct EntryNode {
    config: Config,
    runlog: Arc<RunContext>,
}

impl EntryNode {
    pub fn new(config: Config, runlog: Arc<RunContext>) -> Self {
        Self { config, runlog }
    }

    /// Bind the client listener and serve sessions one at a time. A bind
    /// failure is fatal and propagates.
    pub async fn run(&self, listen_port: u16) -> Result<(), RelayError> {
        let addr = format!("{}:{}", self.config.entry_host, listen_port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| RelayError::Bind {
            addr: addr.clone(),
            source,
        })?;
        info!("entry listening on {addr}");

        let mut conn_id: u64 = 0;
        loop {
            let (client, peer) = listener.accept().await?;
            conn_id += 1;
            info!("client connected from {peer}");
            match self.handle_client(client, conn_id).await {
                Ok(()) => info!("client session {conn_id} finished"),
                Err(e) => warn!("client session {conn_id} ended: {e}"),
            }
        }
    }

    async fn handle_client(&self, client: TcpStream, conn_id: u64) -> Result<(), RelayError> {
        client.set_nodelay(true).ok();
        let session_seed = self.runlog.seed ^ conn_id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let tuning = PathTuning {
            ack_timeout_floor: Duration::from_millis(self.config.ack_timeout_floor_ms),
            max_inflight: self.config.max_inflight,
            ..PathTuning::default()
        };

        // One framed connection per middle; the connection is the path.
        let (inbound_tx, mut inbound_rx) = mpsc::channel(512);
        let mut slots = Vec::with_capacity(self.config.path_count());
        for (path_id, &port) in self.config.middle_ports.iter().enumerate() {
            let addr = format!("{}:{}", self.config.middle_host, port);
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|source| RelayError::Connect {
                    addr: addr.clone(),
                    source,
                })?;
            stream.set_nodelay(true).ok();
            slots.push(Some(PathHandle::spawn(
                path_id as u8,
                stream,
                tuning.clone(),
                inbound_tx.clone(),
            )));
            debug!("path {path_id} connected via {addr}");
        }
        let paths: SharedPaths = Arc::new(Mutex::new(slots));

        let engine = StrategyEngine::new(&self.config);
        let (strategy_tx, strategy_rx) = watch::channel(Arc::new(engine.initial_snapshot()));
        let ticker = spawn_window_ticker(
            engine,
            paths.clone(),
            strategy_tx,
            self.config.window_size(),
            None,
        );
        let fragment_buffer = Arc::new(Mutex::new(FragmentBuffer::new(self.config.frag_ttl())));
        let reaper = spawn_reaper(paths.clone(), fragment_buffer.clone());

        let mut sender = FrameSender::new(paths.clone(), &self.config, session_seed, strategy_rx);
        // Group ids stay unique to this sender across sequential sessions
        let group_base = (conn_id as u32) << 16;
        sender.set_group_base(group_base);
        sender.send_preludes()?;

        let (mut client_read, mut client_write) = client.into_split();
        let mut dedup = ReceiveDedup::new(8192);
        let mut pending: BTreeMap<u32, Bytes> = BTreeMap::new();
        let mut next_group = group_base;
        let mut read_buf = vec![0u8; 2048];

        let result = loop {
            tokio::select! {
                read = client_read.read(&mut read_buf) => {
                    match read {
                        Ok(0) => break Ok(()),
                        Ok(n) => {
                            if let Err(e) = sender.send_message(&read_buf[..n]) {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(e.into()),
                    }
                }
                inbound = inbound_rx.recv() => {
                    let Some((path_id, frame)) = inbound else { break Ok(()) };
                    if let Some(acked) = frame.acked_seq() {
                        clear_acked(&snapshot_handles(&paths), acked, path_id);
                        continue;
                    }
                    self.ack_back(&paths, path_id, &frame);
                    let completed = {
                        let mut buffer = fragment_buffer.lock().expect("fragment lock");
                        match buffer.insert(EXIT_SENDER, &frame) {
                            Ok(completed) => completed,
                            Err(e) => {
                                warn!("dropping inconsistent fragment: {e}");
                                continue;
                            }
                        }
                    };
                    let Some(message) = completed else { continue };
                    if !dedup.accept(EXIT_SENDER, frame.group_id) {
                        continue;
                    }
                    pending.insert(frame.group_id, message);
                    if let Err(e) = flush_in_order(&mut pending, &mut next_group, &mut client_write).await {
                        break Err(e.into());
                    }
                }
            }
        };

        ticker.abort();
        reaper.abort();
        result
    }

    /// Acknowledge a downlink data frame on the path it arrived on.
    fn ack_back(&self, paths: &SharedPaths, path_id: u8, frame: &Frame) {
        let handles = snapshot_handles(paths);
        if let Some(handle) = handles.get(path_id as usize).and_then(|slot| slot.as_ref()) {
            if let Err(e) = handle.send(Frame::ack(frame.seq, frame.seq), Duration::ZERO) {
                debug!(path = path_id, "ack dropped: {e}");
            }
        }
    }
}

/// Write completed groups back to the client in group-id order.
async fn flush_in_order(
    pending: &mut BTreeMap<u32, Bytes>,
    next_group: &mut u32,
    writer: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    while let Some(message) = pending.remove(next_group) {
        writer.write_all(&message).await?;
        *next_group = next_group.wrapping_add(1);
    }
    Ok(())
}
