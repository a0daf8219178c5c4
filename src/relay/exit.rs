//! Exit node
//!
//! Terminates the overlay paths: reassembles uplink fragment groups,
//! forwards each completed message to the upstream echo server over a
//! single serialized connection, and shapes + schedules the response back
//! across the paths under the uplink's group id. Each middle connection is
//! one path; slots are assigned in accept order and reused when a path
//! goes down.

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
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Sender id of the entry node in reassembly keys; there is one entry
const ENTRY_SENDER: u64 = 0;

/// Seed salt so the downlink pipeline draws an independent stream
const DOWNLINK_SALT: u64 = 0xEE11;

/// Path-terminating egress of the tunnel.
pub struct ExitNode {
    config: Config,
    runlog: Arc<RunContext>,
}

impl ExitNode {
    pub fn new(config: Config, runlog: Arc<RunContext>) -> Self {
        Self { config, runlog }
    }

    /// Bind the middle-facing listener and serve forever. A bind failure
    /// is fatal and propagates.
    pub async fn run(&self, listen_port: u16) -> Result<(), RelayError> {
        let addr = format!("{}:{}", self.config.exit_host, listen_port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| RelayError::Bind {
            addr: addr.clone(),
            source,
        })?;
        info!("exit listening on {addr}");

        let (inbound_tx, inbound_rx) = mpsc::channel(512);
        let paths: SharedPaths = Arc::new(Mutex::new(vec![None; self.config.path_count()]));

        let engine = StrategyEngine::new(&self.config);
        let (strategy_tx, strategy_rx) = watch::channel(Arc::new(engine.initial_snapshot()));
        let _ticker = spawn_window_ticker(
            engine,
            paths.clone(),
            strategy_tx,
            self.config.window_size(),
            Some(self.runlog.clone()),
        );
        let fragment_buffer = Arc::new(Mutex::new(FragmentBuffer::new(self.config.frag_ttl())));
        let _reaper = spawn_reaper(paths.clone(), fragment_buffer.clone());

        let (server_tx, server_rx) = mpsc::channel::<(u32, Bytes)>(256);
        let (response_tx, response_rx) = mpsc::channel::<(u32, Bytes)>(256);
        let server_addr = format!("{}:{}", self.config.server_host, self.config.server_port);
        tokio::spawn(server_echo_task(server_addr, server_rx, response_tx));

        let sender = FrameSender::new(
            paths.clone(),
            &self.config,
            self.runlog.seed ^ DOWNLINK_SALT,
            strategy_rx,
        );
        tokio::spawn(downlink_task(sender, response_rx));
        tokio::spawn(inbound_task(
            inbound_rx,
            paths.clone(),
            fragment_buffer,
            server_tx,
        ));

        let tuning = PathTuning {
            ack_timeout_floor: Duration::from_millis(self.config.ack_timeout_floor_ms),
            max_inflight: self.config.max_inflight,
            ..PathTuning::default()
        };
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            let path_id = assign_slot(&paths, stream, tuning.clone(), inbound_tx.clone());
            info!("middle connected from {peer} as path {path_id}");
        }
    }
}

/// Register a new middle connection in the first free or dead path slot.
fn assign_slot(
    paths: &SharedPaths,
    stream: TcpStream,
    tuning: PathTuning,
    inbound_tx: mpsc::Sender<(u8, Frame)>,
) -> u8 {
    let mut slots = paths.lock().expect("paths lock");
    let idx = slots
        .iter()
        .position(|slot| slot.as_ref().map_or(true, |handle| handle.is_down()))
        .unwrap_or(slots.len());
    if idx == slots.len() {
        slots.push(None);
    }
    slots[idx] = Some(PathHandle::spawn(idx as u8, stream, tuning, inbound_tx));
    idx as u8
}

/// Reassemble uplink groups, dedup redundant copies, ACK each data frame
/// on its arriving path, and hand completed messages to the server task.
async fn inbound_task(
    mut inbound_rx: mpsc::Receiver<(u8, Frame)>,
    paths: SharedPaths,
    fragment_buffer: Arc<Mutex<FragmentBuffer>>,
    server_tx: mpsc::Sender<(u32, Bytes)>,
) {
    let mut dedup = ReceiveDedup::new(8192);
    while let Some((path_id, frame)) = inbound_rx.recv().await {
        if let Some(acked) = frame.acked_seq() {
            clear_acked(&snapshot_handles(&paths), acked, path_id);
            continue;
        }

        let handles = snapshot_handles(&paths);
        if let Some(handle) = handles.get(path_id as usize).and_then(|slot| slot.as_ref()) {
            if let Err(e) = handle.send(Frame::ack(frame.seq, frame.seq), Duration::ZERO) {
                debug!(path = path_id, "ack dropped: {e}");
            }
        }

        let completed = {
            let mut buffer = fragment_buffer.lock().expect("fragment lock");
            match buffer.insert(ENTRY_SENDER, &frame) {
                Ok(completed) => completed,
                Err(e) => {
                    warn!("dropping inconsistent fragment: {e}");
                    continue;
                }
            }
        };
        let Some(message) = completed else { continue };
        if !dedup.accept(ENTRY_SENDER, frame.group_id) {
            continue;
        }
        if server_tx.send((frame.group_id, message)).await.is_err() {
            break;
        }
    }
}

/// Serialized request/echo exchange with the upstream server. The
/// connection is dialed lazily and redialed after an IO failure; a failed
/// exchange drops the message (the entry's group TTL cleans up).
async fn server_echo_task(
    addr: String,
    mut requests: mpsc::Receiver<(u32, Bytes)>,
    responses: mpsc::Sender<(u32, Bytes)>,
) {
    let mut upstream: Option<TcpStream> = None;
    while let Some((group_id, payload)) = requests.recv().await {
        if upstream.is_none() {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    info!("connected to server {addr}");
                    upstream = Some(stream);
                }
                Err(e) => {
                    warn!("server connect failed: {e}");
                    continue;
                }
            }
        }
        let Some(stream) = upstream.as_mut() else {
            continue;
        };
        let mut response = vec![0u8; payload.len()];
        let exchange = async {
            stream.write_all(&payload).await?;
            stream.read_exact(&mut response).await?;
            Ok::<(), std::io::Error>(())
        };
        match exchange.await {
            Ok(()) => {
                if responses.send((group_id, response.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("server exchange failed: {e}");
                upstream = None;
            }
        }
    }
}

/// Echo responses go back through the full outbound pipeline under the
/// uplink group id.
async fn downlink_task(mut sender: FrameSender, mut responses: mpsc::Receiver<(u32, Bytes)>) {
    while let Some((group_id, message)) = responses.recv().await {
        if let Err(e) = sender.send_with_group(&message, group_id) {
            warn!(group_id, "downlink send failed: {e}");
        }
    }
}
