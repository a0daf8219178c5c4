//! Persisted run outputs
//!
//! Every run writes under `out/<run_id>/`:
//! - `meta.json`: run id, seed, and the recorded protocol decisions
//! - `config_dump.json`: snapshot of the effective configuration
//! - `window_logs.jsonl`: one record per window per path
//! - `latency_logs.jsonl`: one record per echoed message
//! - `traces/trace_session_<s>_path_<p>_TM{1,2}.csv`: attacker-view
//!   packet length / inter-arrival records

use crate::Config;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::info;

/// Shared handle to a run's output directory and log files.
pub struct RunContext {
    pub run_id: String,
    pub out_dir: PathBuf,
    pub traces_dir: PathBuf,
    /// Seed for all randomness in this run
    pub seed: u64,
    window_log: Mutex<BufWriter<File>>,
    latency_log: Mutex<BufWriter<File>>,
}

/// One window_logs.jsonl record.
#[derive(Debug, Clone, Serialize)]
pub struct WindowRecord {
    pub window_id: u64,
    pub path_id: u8,
    pub weight: f64,
    pub proto_family: u8,
    pub proto_variant: u8,
    pub padding_alpha: f64,
    pub jitter_ms: u64,
    pub padding_bytes: u64,
    pub real_bytes: u64,
    pub rtt_ms: f64,
    pub loss: f64,
}

/// One latency_logs.jsonl record.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub session: u32,
    pub latency_ms: f64,
    pub success: bool,
}

#[derive(Serialize)]
struct Meta<'a> {
    run_id: &'a str,
    seed: u64,
    start_unix: u64,
    /// `redundancy = k` sends k total copies of each fragment
    redundancy_semantics: &'static str,
    /// An ACK clears the seq from every path's outstanding map
    ack_semantics: &'static str,
    /// The exit echoes responses under the uplink group id
    echo_group_id: &'static str,
}

impl RunContext {
    /// Create (or join) the run directory and open the log files.
    pub fn init(config: &Config) -> crate::Result<Arc<Self>> {
        let run_id = config
            .run_id
            .clone()
            .unwrap_or_else(|| format!("{:08x}", rand::random::<u32>()));
        let out_dir = config
            .out_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("out").join(&run_id));
        let traces_dir = out_dir.join("traces");
        std::fs::create_dir_all(&traces_dir)?;

        let seed = config.seed.unwrap_or_else(rand::random::<u64>);

        let meta_path = out_dir.join("meta.json");
        if !meta_path.exists() {
            let start_unix = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let meta = Meta {
                run_id: &run_id,
                seed,
                start_unix,
                redundancy_semantics: "total_copies",
                ack_semantics: "clears_all_paths",
                echo_group_id: "preserved",
            };
            let body = serde_json::to_string_pretty(&meta)
                .map_err(|e| crate::Error::Config(format!("meta serialization: {e}")))?;
            std::fs::write(&meta_path, body)?;
        }

        let dump_path = out_dir.join("config_dump.json");
        if !dump_path.exists() {
            let body = serde_json::to_string_pretty(config)
                .map_err(|e| crate::Error::Config(format!("config serialization: {e}")))?;
            std::fs::write(&dump_path, body)?;
        }

        let window_log = append_writer(out_dir.join("window_logs.jsonl"))?;
        let latency_log = append_writer(out_dir.join("latency_logs.jsonl"))?;

        info!("run {} writing to {}", run_id, out_dir.display());
        Ok(Arc::new(Self {
            run_id,
            out_dir,
            traces_dir,
            seed,
            window_log: Mutex::new(window_log),
            latency_log: Mutex::new(latency_log),
        }))
    }

    pub fn log_window(&self, record: &WindowRecord) {
        append_jsonl(&self.window_log, record);
    }

    pub fn log_latency(&self, record: &LatencyRecord) {
        append_jsonl(&self.latency_log, record);
    }

    /// Open the TM1/TM2 trace pair for one session on one path.
    pub fn trace_writer(&self, session: u64, path_id: u8) -> std::io::Result<TraceWriter> {
        TraceWriter::create(&self.traces_dir, session, path_id)
    }
}

fn append_writer(path: PathBuf) -> std::io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_jsonl<T: Serialize>(log: &Mutex<BufWriter<File>>, record: &T) {
    let line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(_) => return,
    };
    if let Ok(mut writer) = log.lock() {
        let _ = writeln!(writer, "{line}");
        let _ = writer.flush();
    }
}

/// Attacker-view trace recorder for one session on one path.
///
/// TM1 records the full on-the-wire frame length, TM2 the tunnel payload
/// length with header and extra bytes stripped. Timestamps are seconds
/// since the first observed frame of the session.
pub struct TraceWriter {
    start: Instant,
    tm1: BufWriter<File>,
    tm2: BufWriter<File>,
}

impl TraceWriter {
    fn create(traces_dir: &std::path::Path, session: u64, path_id: u8) -> std::io::Result<Self> {
        let mut tm1 = open_trace(traces_dir, session, path_id, "TM1")?;
        let mut tm2 = open_trace(traces_dir, session, path_id, "TM2")?;
        writeln!(tm1, "t,dir,len")?;
        writeln!(tm2, "t,dir,len")?;
        Ok(Self {
            start: Instant::now(),
            tm1,
            tm2,
        })
    }

    pub fn record(&mut self, dir: &str, wire_len: usize, payload_len: usize) {
        let t = self.start.elapsed().as_secs_f64();
        let _ = writeln!(self.tm1, "{t:.6},{dir},{wire_len}");
        let _ = writeln!(self.tm2, "{t:.6},{dir},{payload_len}");
        let _ = self.tm1.flush();
        let _ = self.tm2.flush();
    }
}

fn open_trace(
    dir: &std::path::Path,
    session: u64,
    path_id: u8,
    kind: &str,
) -> std::io::Result<BufWriter<File>> {
    let name = format!("trace_session_{session}_path_{path_id}_{kind}.csv");
    let file = File::create(dir.join(name))?;
    Ok(BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config() -> (Config, PathBuf) {
        let dir = std::env::temp_dir().join(format!("mirage-test-{:08x}", rand::random::<u32>()));
        let config = Config {
            run_id: Some("testrun".to_string()),
            out_dir: Some(dir.clone()),
            seed: Some(99),
            ..Config::default()
        };
        (config, dir)
    }

    #[test]
    fn init_creates_outputs() {
        let (config, dir) = temp_config();
        let ctx = RunContext::init(&config).unwrap();
        assert_eq!(ctx.seed, 99);
        assert!(dir.join("meta.json").exists());
        assert!(dir.join("config_dump.json").exists());

        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("meta.json")).unwrap()).unwrap();
        assert_eq!(meta["redundancy_semantics"], "total_copies");
        assert_eq!(meta["seed"], 99);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn window_and_latency_logs_are_jsonl() {
        let (config, dir) = temp_config();
        let ctx = RunContext::init(&config).unwrap();
        ctx.log_window(&WindowRecord {
            window_id: 1,
            path_id: 0,
            weight: 0.5,
            proto_family: 1,
            proto_variant: 0,
            padding_alpha: 0.05,
            jitter_ms: 20,
            padding_bytes: 10,
            real_bytes: 200,
            rtt_ms: 12.5,
            loss: 0.0,
        });
        ctx.log_latency(&LatencyRecord {
            session: 0,
            latency_ms: 42.0,
            success: true,
        });

        let windows = std::fs::read_to_string(dir.join("window_logs.jsonl")).unwrap();
        let record: serde_json::Value = serde_json::from_str(windows.lines().next().unwrap()).unwrap();
        assert_eq!(record["window_id"], 1);

        let latencies = std::fs::read_to_string(dir.join("latency_logs.jsonl")).unwrap();
        let record: serde_json::Value =
            serde_json::from_str(latencies.lines().next().unwrap()).unwrap();
        assert_eq!(record["success"], true);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn trace_files_have_headers() {
        let (config, dir) = temp_config();
        let ctx = RunContext::init(&config).unwrap();
        let mut writer = ctx.trace_writer(0, 1).unwrap();
        writer.record("up", 128, 96);

        let tm1 = std::fs::read_to_string(dir.join("traces/trace_session_0_path_1_TM1.csv")).unwrap();
        let mut lines = tm1.lines();
        assert_eq!(lines.next().unwrap(), "t,dir,len");
        assert!(lines.next().unwrap().ends_with(",up,128"));

        std::fs::remove_dir_all(dir).unwrap();
    }
}
