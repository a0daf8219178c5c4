//! Relay node logic
//!
//! Entry, Middle, and Exit forwarding semantics built on the tunnel, path,
//! scheduler, shaping, and strategy layers. The shared [`FrameSender`]
//! drives the outbound pipeline both at the Entry (uplink) and the Exit
//! (downlink echo): shape, wrap, schedule, enqueue.

mod entry;
mod exit;
mod middle;

pub use entry::EntryNode;
pub use exit::ExitNode;
pub use middle::{LinkEmulation, MiddleNode};

use crate::config::Config;
use crate::obfuscation::{FrameSpec, ObfuscationError, Obfuscator};
use crate::path::{PathError, PathHandle};
use crate::runlog::{RunContext, WindowRecord};
use crate::scheduler::{MultiPathScheduler, PathProbe, SchedulerError};
use crate::shaping::BehaviorShaper;
use crate::strategy::{PathObservation, StrategyEngine, StrategySnapshot};
use crate::tunnel::{flags, FragmentBuffer, TunnelError};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Relay layer errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("connect failed to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tunnel: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("obfuscation: {0}")]
    Obfuscation(#[from] ObfuscationError),

    #[error("path: {0}")]
    Path(#[from] PathError),

    #[error("scheduler: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Path slots shared between the accept loop, the sender, and the
/// background tasks. A `None` slot is a path that never connected or was
/// torn down.
pub(crate) type SharedPaths = Arc<Mutex<Vec<Option<PathHandle>>>>;

pub(crate) fn snapshot_handles(paths: &SharedPaths) -> Vec<Option<PathHandle>> {
    paths.lock().expect("paths lock").clone()
}

fn build_probes(handles: &[Option<PathHandle>]) -> Vec<PathProbe> {
    handles
        .iter()
        .map(|slot| match slot {
            Some(handle) => PathProbe {
                busy: handle.is_busy(),
                down: handle.is_down(),
                inflight: handle.inflight(),
            },
            None => PathProbe {
                busy: false,
                down: true,
                inflight: 0,
            },
        })
        .collect()
}

/// The outbound pipeline: shapes a message into fragments, wraps each in
/// the active profile, schedules paths (with redundancy), and enqueues the
/// frames with jitter deadlines. Strategy snapshots are adopted at frame
/// boundaries, never mid-message-fragment.
pub(crate) struct FrameSender {
    paths: SharedPaths,
    scheduler: MultiPathScheduler,
    shaper: BehaviorShaper,
    obfuscator: Obfuscator,
    strategy_rx: watch::Receiver<Arc<StrategySnapshot>>,
    snapshot: Arc<StrategySnapshot>,
    seq: u32,
    next_group: u32,
    unhealthy_loss: f64,
}

impl FrameSender {
    pub(crate) fn new(
        paths: SharedPaths,
        config: &Config,
        seed: u64,
        strategy_rx: watch::Receiver<Arc<StrategySnapshot>>,
    ) -> Self {
        let snapshot = strategy_rx.borrow().clone();
        let shaper = BehaviorShaper::new(snapshot.shaping.clone(), config.mode, seed);
        let scheduler = MultiPathScheduler::new(
            config.path_count().max(1),
            config.batch_size,
            config.redundancy,
            seed.wrapping_add(1),
        );
        Self {
            paths,
            scheduler,
            shaper,
            obfuscator: Obfuscator::new(seed, config.obfuscation_level),
            strategy_rx,
            snapshot,
            seq: 0,
            next_group: 0,
            unhealthy_loss: config.unhealthy_loss,
        }
    }

    /// Start group allocation at `base`, keeping ids unique per sender
    /// across sequential sessions.
    pub(crate) fn set_group_base(&mut self, base: u32) {
        self.next_group = base;
    }

    /// Emit each connected path's handshake prelude. The caller invokes
    /// this exactly once per connection set.
    pub(crate) fn send_preludes(&mut self) -> Result<(), RelayError> {
        self.adopt_if_changed();
        for slot in snapshot_handles(&self.paths) {
            let Some(handle) = slot else { continue };
            let family = self.snapshot.proto_family;
            if let Some(frame) = self.obfuscator.prelude_frame(family, handle.path_id)? {
                if let Err(e) = handle.send(frame, Duration::ZERO) {
                    debug!(path = handle.path_id, "prelude skipped: {e}");
                }
            }
        }
        Ok(())
    }

    /// Send one logical message under a fresh group id; returns the id.
    pub(crate) fn send_message(&mut self, data: &[u8]) -> Result<u32, RelayError> {
        let group_id = self.next_group;
        self.next_group = self.next_group.wrapping_add(1);
        self.send_with_group(data, group_id)?;
        Ok(group_id)
    }

    /// Send one logical message under a caller-chosen group id (the Exit
    /// echoes responses under the uplink group).
    pub(crate) fn send_with_group(&mut self, data: &[u8], group_id: u32) -> Result<(), RelayError> {
        self.adopt_if_changed();
        let handles = snapshot_handles(&self.paths);
        self.drain_unhealthy(&handles);

        let plans = self.shaper.plan(data.len());
        let frag_total = plans.len() as u16;
        let mut offset = 0;
        for (frag_id, plan) in plans.iter().enumerate() {
            let payload = Bytes::copy_from_slice(&data[offset..offset + plan.real_len]);
            offset += plan.real_len;
            let seq = self.next_seq();
            let mut probes = build_probes(&handles);
            // Late-joined slots beyond the configured path set are not
            // scheduled; they only happen after reconnect races.
            probes.truncate(self.scheduler.weights().len());
            let targets = self.scheduler.select(&probes)?;
            let primary = targets[0];
            for &path in &targets {
                let Some(handle) = &handles[path] else { continue };
                let spec = FrameSpec {
                    payload: payload.clone(),
                    pad_to: plan.target_len,
                    flags: 0,
                    seq,
                    frag_id: frag_id as u16,
                    frag_total,
                    group_id,
                    path_id: path as u8,
                    proto_id: self.snapshot.proto_family,
                    variant: self.variant_for(path),
                };
                let frame = self.obfuscator.wrap(spec)?;
                let jitter = self.shaper.sample_jitter();
                if let Err(e) = handle.send(frame, jitter) {
                    warn!(path = handle.path_id, seq, "send dropped: {e}");
                }
            }
            self.maybe_pad(&handles, primary);
        }
        Ok(())
    }

    /// Padding-only frame opportunity after a burst of data frames,
    /// spent on the primary path while the window budget allows.
    fn maybe_pad(&mut self, handles: &[Option<PathHandle>], path: usize) {
        let Some(size) = self.shaper.padding_frame() else {
            return;
        };
        let Some(handle) = handles.get(path).and_then(Option::as_ref) else {
            return;
        };
        let seq = self.next_seq();
        let spec = FrameSpec {
            payload: Bytes::new(),
            pad_to: size,
            flags: flags::PAD,
            seq,
            frag_id: 0,
            frag_total: 1,
            group_id: 0,
            path_id: path as u8,
            proto_id: self.snapshot.proto_family,
            variant: self.variant_for(path),
        };
        match self.obfuscator.wrap(spec) {
            Ok(frame) => {
                let jitter = self.shaper.sample_jitter();
                if let Err(e) = handle.send(frame, jitter) {
                    debug!(path = handle.path_id, "padding dropped: {e}");
                }
            }
            Err(e) => debug!("padding wrap failed: {e}"),
        }
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    fn variant_for(&self, path: usize) -> u8 {
        self.snapshot
            .variant_by_path
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// Adopt the latest published snapshot, if any. Called at frame
    /// boundaries so one frame is never shaped under a mixture.
    fn adopt_if_changed(&mut self) {
        if !self.strategy_rx.has_changed().unwrap_or(false) {
            return;
        }
        let snapshot = self.strategy_rx.borrow_and_update().clone();
        self.shaper.start_window(snapshot.shaping.clone());
        self.scheduler.set_weights(&snapshot.weights);
        for handle in snapshot_handles(&self.paths).into_iter().flatten() {
            handle.set_draining(false);
        }
        debug!(window = snapshot.window_id, "adopted strategy snapshot");
        self.snapshot = snapshot;
    }

    /// Mid-window failure handling: a path whose EWMA loss crossed the hard
    /// threshold is drained until the next tick.
    fn drain_unhealthy(&mut self, handles: &[Option<PathHandle>]) {
        for (path_id, slot) in handles.iter().enumerate() {
            let Some(handle) = slot else { continue };
            if handle.stats().loss >= self.unhealthy_loss {
                self.scheduler.drain_path(path_id);
                handle.set_draining(true);
            }
        }
    }
}

/// Broadcast an ACK-driven clear: the arriving path gets the RTT credit,
/// every other path just drops the seq from its outstanding map.
pub(crate) fn clear_acked(handles: &[Option<PathHandle>], acked: u32, arrived_on: u8) {
    for handle in handles.iter().flatten() {
        handle.on_ack(acked, handle.path_id == arrived_on);
    }
}

/// Window tick task: samples per-path estimators, runs the strategy
/// engine, publishes the new snapshot, and emits window records.
pub(crate) fn spawn_window_ticker(
    mut engine: StrategyEngine,
    paths: SharedPaths,
    strategy_tx: watch::Sender<Arc<StrategySnapshot>>,
    window: Duration,
    runlog: Option<Arc<RunContext>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path_count = strategy_tx.borrow().weights.len();
        let mut interval = tokio::time::interval(window);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            let handles = snapshot_handles(&paths);
            let mut stats = Vec::with_capacity(path_count);
            for path in 0..path_count {
                stats.push(
                    handles
                        .get(path)
                        .and_then(|slot| slot.as_ref())
                        .map(|handle| handle.take_window_stats())
                        .unwrap_or_default(),
                );
            }
            let observations: Vec<PathObservation> = stats
                .iter()
                .map(|s| PathObservation {
                    rtt_ms: s.rtt_ms,
                    loss: s.loss,
                    mean_frame_len: s.mean_frame_len,
                })
                .collect();
            let snapshot = engine.tick(&observations);

            for (path, stat) in stats.iter().enumerate() {
                let record = WindowRecord {
                    window_id: snapshot.window_id,
                    path_id: path as u8,
                    weight: snapshot.weights[path],
                    proto_family: snapshot.proto_family,
                    proto_variant: snapshot.variant_by_path[path],
                    padding_alpha: snapshot.shaping.padding_alpha,
                    jitter_ms: snapshot.shaping.jitter_ms,
                    padding_bytes: stat.padding_bytes,
                    real_bytes: stat.real_bytes,
                    rtt_ms: stat.rtt_ms,
                    loss: stat.loss,
                };
                match &runlog {
                    Some(ctx) => ctx.log_window(&record),
                    None => info!(
                        window = record.window_id,
                        path = record.path_id,
                        weight = record.weight,
                        family = record.proto_family,
                        rtt_ms = record.rtt_ms,
                        loss = record.loss,
                        "window tick"
                    ),
                }
            }

            if strategy_tx.send(Arc::new(snapshot)).is_err() {
                break;
            }
        }
    })
}

/// ACK reaper task: expires outstanding seqs on every path and sweeps the
/// fragment buffer for stale groups.
pub(crate) fn spawn_reaper(
    paths: SharedPaths,
    fragment_buffer: Arc<Mutex<FragmentBuffer>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(50));
        let mut sweep_countdown = 20u32;
        loop {
            interval.tick().await;
            let now = tokio::time::Instant::now();
            for handle in snapshot_handles(&paths).into_iter().flatten() {
                handle.reap(now);
            }
            sweep_countdown -= 1;
            if sweep_countdown == 0 {
                sweep_countdown = 20;
                let evicted = fragment_buffer
                    .lock()
                    .expect("fragment lock")
                    .sweep(std::time::Instant::now());
                if evicted > 0 {
                    debug!(evicted, "evicted stale fragment groups");
                }
            }
        }
    })
}
