//! Per-path framed link
//!
//! Each overlay path owns one TCP connection wrapped in a pair of tasks:
//! a writer draining a deadline-ordered send queue, and a reader decoding
//! inbound frames. The link tracks outstanding sequence numbers, folds ACK
//! round-trips into an EWMA RTT, and feeds timed-out seqs into an EWMA loss
//! estimator. Jitter deadlines are clamped so a later frame never transmits
//! before an earlier one on the same path.

use crate::tunnel::{read_frame, write_frame, Frame, MALFORMED_CLOSE_THRESHOLD};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Path link errors
#[derive(Debug, Error)]
pub enum PathError {
    #[error("path {0} is down")]
    Down(u8),

    #[error("path {0} is busy")]
    Busy(u8),

    #[error("tunnel error: {0}")]
    Tunnel(#[from] crate::tunnel::TunnelError),
}

/// Externally visible path state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Connecting,
    Ready,
    /// Outstanding set exceeds `max_inflight`
    Busy,
    /// Drained by the scheduler until the next strategy tick
    Draining,
    Down,
}

/// Estimator and backpressure tuning.
#[derive(Debug, Clone)]
pub struct PathTuning {
    /// EWMA factor for RTT samples
    pub alpha_rtt: f64,
    /// EWMA factor for loss samples
    pub alpha_loss: f64,
    /// Floor for the ACK timeout
    pub ack_timeout_floor: Duration,
    /// Outstanding frames before the path reports Busy
    pub max_inflight: usize,
}

impl Default for PathTuning {
    fn default() -> Self {
        Self {
            alpha_rtt: 0.2,
            alpha_loss: 0.1,
            ack_timeout_floor: Duration::from_millis(200),
            max_inflight: 64,
        }
    }
}

/// Read-only snapshot of a path's estimators.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathStats {
    pub rtt_ms: f64,
    pub loss: f64,
    pub inflight: usize,
    pub sent: u64,
    pub acked: u64,
    pub timed_out: u64,
    /// Receive-side seq gaps observed
    pub gaps: u64,
    /// Mean sent frame size this window, 0 if none
    pub mean_frame_len: f64,
    pub real_bytes: u64,
    pub padding_bytes: u64,
}

struct Shared {
    state: PathState,
    draining: bool,
    outstanding: HashMap<u32, Instant>,
    rtt_ms: f64,
    loss: f64,
    sent: u64,
    acked: u64,
    timed_out: u64,
    gaps: u64,
    expected_seq: u32,
    // Window accumulators, cleared at each strategy tick
    frames_sent: u64,
    frame_len_sum: u64,
    real_bytes: u64,
    padding_bytes: u64,
    tuning: PathTuning,
}

struct Command {
    frame: Frame,
    deadline: Instant,
}

/// Handle to a spawned path link.
#[derive(Clone)]
pub struct PathHandle {
    pub path_id: u8,
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Mutex<Shared>>,
}

impl PathHandle {
    /// Spawn the writer and reader tasks over a connected stream. Inbound
    /// non-decoy frames are forwarded as `(path_id, frame)` on `inbound_tx`.
    pub fn spawn<S>(
        path_id: u8,
        stream: S,
        tuning: PathTuning,
        inbound_tx: mpsc::Sender<(u8, Frame)>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(Shared {
            state: PathState::Ready,
            draining: false,
            outstanding: HashMap::new(),
            rtt_ms: 0.0,
            loss: 0.0,
            sent: 0,
            acked: 0,
            timed_out: 0,
            gaps: 0,
            expected_seq: 0,
            frames_sent: 0,
            frame_len_sum: 0,
            real_bytes: 0,
            padding_bytes: 0,
            tuning,
        }));
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (read_half, write_half) = tokio::io::split(stream);

        tokio::spawn(writer_task(path_id, write_half, cmd_rx, Arc::clone(&shared)));
        tokio::spawn(reader_task(path_id, read_half, inbound_tx, Arc::clone(&shared)));

        Self {
            path_id,
            cmd_tx,
            shared,
        }
    }

    /// Enqueue a frame for transmission after `jitter`. The writer clamps
    /// deadlines so per-path FIFO order is preserved.
    pub fn send(&self, frame: Frame, jitter: Duration) -> Result<(), PathError> {
        if self.state() == PathState::Down {
            return Err(PathError::Down(self.path_id));
        }
        let deadline = Instant::now() + jitter;
        self.cmd_tx
            .try_send(Command { frame, deadline })
            .map_err(|_| PathError::Busy(self.path_id))
    }

    /// Clear an acked seq. `credit_rtt` folds the round-trip into the
    /// estimators; redundant-path clears pass `false` so a copy on another
    /// path neither counts as delivered nor as lost here.
    pub fn on_ack(&self, acked: u32, credit_rtt: bool) {
        let mut shared = self.shared.lock().expect("path lock");
        let Some(sent_at) = shared.outstanding.remove(&acked) else {
            return;
        };
        if credit_rtt {
            let rtt = sent_at.elapsed().as_secs_f64() * 1000.0;
            let alpha = shared.tuning.alpha_rtt;
            shared.rtt_ms = if shared.rtt_ms == 0.0 {
                rtt
            } else {
                shared.rtt_ms * (1.0 - alpha) + rtt * alpha
            };
            shared.acked += 1;
            let alpha = shared.tuning.alpha_loss;
            shared.loss *= 1.0 - alpha;
        }
    }

    /// Expire outstanding seqs older than the ACK timeout, feeding the loss
    /// estimator. Returns the number expired.
    pub fn reap(&self, now: Instant) -> usize {
        let mut shared = self.shared.lock().expect("path lock");
        let timeout = ack_timeout(&shared);
        let expired: Vec<u32> = shared
            .outstanding
            .iter()
            .filter(|(_, &sent_at)| now.duration_since(sent_at) > timeout)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in &expired {
            shared.outstanding.remove(seq);
            shared.timed_out += 1;
            let alpha = shared.tuning.alpha_loss;
            shared.loss = shared.loss * (1.0 - alpha) + alpha;
        }
        if !expired.is_empty() {
            debug!(path = self.path_id, expired = expired.len(), "ack timeouts");
        }
        expired.len()
    }

    pub fn state(&self) -> PathState {
        let shared = self.shared.lock().expect("path lock");
        match shared.state {
            PathState::Down => PathState::Down,
            _ if shared.draining => PathState::Draining,
            _ if shared.outstanding.len() > shared.tuning.max_inflight => PathState::Busy,
            state => state,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.state(), PathState::Busy | PathState::Draining)
    }

    pub fn is_down(&self) -> bool {
        self.state() == PathState::Down
    }

    /// Mark or clear the drained-by-scheduler state.
    pub fn set_draining(&self, draining: bool) {
        self.shared.lock().expect("path lock").draining = draining;
    }

    pub fn inflight(&self) -> usize {
        self.shared.lock().expect("path lock").outstanding.len()
    }

    pub fn stats(&self) -> PathStats {
        let shared = self.shared.lock().expect("path lock");
        PathStats {
            rtt_ms: shared.rtt_ms,
            loss: shared.loss,
            inflight: shared.outstanding.len(),
            sent: shared.sent,
            acked: shared.acked,
            timed_out: shared.timed_out,
            gaps: shared.gaps,
            mean_frame_len: if shared.frames_sent == 0 {
                0.0
            } else {
                shared.frame_len_sum as f64 / shared.frames_sent as f64
            },
            real_bytes: shared.real_bytes,
            padding_bytes: shared.padding_bytes,
        }
    }

    /// Snapshot and reset the per-window accumulators at a strategy tick.
    pub fn take_window_stats(&self) -> PathStats {
        let stats = self.stats();
        let mut shared = self.shared.lock().expect("path lock");
        shared.frames_sent = 0;
        shared.frame_len_sum = 0;
        shared.real_bytes = 0;
        shared.padding_bytes = 0;
        stats
    }
}

fn ack_timeout(shared: &Shared) -> Duration {
    let from_rtt = Duration::from_secs_f64(shared.rtt_ms.max(0.0) * 4.0 / 1000.0);
    from_rtt.max(shared.tuning.ack_timeout_floor)
}

async fn writer_task<W>(
    path_id: u8,
    mut writer: W,
    mut cmd_rx: mpsc::Receiver<Command>,
    shared: Arc<Mutex<Shared>>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut last_deadline = Instant::now();
    while let Some(Command { frame, deadline }) = cmd_rx.recv().await {
        // A later frame never transmits before an earlier one on this path
        last_deadline = deadline.max(last_deadline);
        sleep_until(last_deadline).await;

        let wire_len = frame.encoded_len();
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!(path = path_id, "write failed: {e}");
            mark_down(&shared);
            return;
        }

        let mut state = shared.lock().expect("path lock");
        state.frames_sent += 1;
        state.frame_len_sum += wire_len as u64;
        state.real_bytes += frame.real_len as u64;
        state.padding_bytes += frame.padding_len() as u64;
        if !frame.is_ack() && !frame.is_decoy() {
            state.sent += 1;
            state.outstanding.insert(frame.seq, Instant::now());
        }
    }
    // Queue closed: propagate the FIN so downstream hops unwind
    let _ = writer.shutdown().await;
}

async fn reader_task<R>(
    path_id: u8,
    mut reader: R,
    inbound_tx: mpsc::Sender<(u8, Frame)>,
    shared: Arc<Mutex<Shared>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(8192);
    let mut malformed = 0u32;
    loop {
        let frame = match read_frame(&mut reader, &mut buf).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(path = path_id, "peer closed");
                break;
            }
            Err(e) => {
                malformed += 1;
                warn!(path = path_id, offenses = malformed, "dropping malformed frame: {e}");
                if malformed >= MALFORMED_CLOSE_THRESHOLD {
                    warn!(path = path_id, "malformed threshold reached, closing");
                    break;
                }
                continue;
            }
        };

        if frame.is_decoy() {
            continue;
        }
        if !frame.is_ack() {
            track_gaps(&shared, frame.seq);
        }
        if inbound_tx.send((path_id, frame)).await.is_err() {
            break;
        }
    }
    mark_down(&shared);
}

/// Receive-side gap accounting: reordering within the window is tolerated,
/// jumps past the expected seq are reported.
fn track_gaps(shared: &Arc<Mutex<Shared>>, seq: u32) {
    let mut state = shared.lock().expect("path lock");
    if seq >= state.expected_seq {
        let missing = (seq - state.expected_seq) as u64;
        if missing > 0 {
            state.gaps += missing;
            debug!(seq, missing, "seq gap observed");
        }
        state.expected_seq = seq + 1;
    } else {
        // Late arrival of a previously missing seq
        state.gaps = state.gaps.saturating_sub(1);
    }
}

fn mark_down(shared: &Arc<Mutex<Shared>>) {
    let mut state = shared.lock().expect("path lock");
    state.state = PathState::Down;
    // Pending sends are dropped with the queue; their fragments are not
    // rerouted automatically.
    state.outstanding.clear();
}
