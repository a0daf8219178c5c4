//! Configuration management
//!
//! Defaults follow the loopback topology (server 9301, exit 9201, middles
//! 9101/9102, entry 9001, monitors 9103/9104). A TOML file can override the
//! defaults, recognized environment variables override the file, and clap
//! flags on the node binaries override everything.

use crate::shaping::Mode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Main configuration, shared by every node process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub entry_host: String,
    pub entry_port: u16,

    pub middle_host: String,
    pub middle_ports: Vec<u16>,

    pub exit_host: String,
    pub exit_port: u16,

    pub server_host: String,
    pub server_port: u16,

    pub monitor_ports: Vec<u16>,

    /// Strategy window length in seconds
    pub window_size_sec: u64,
    /// Ordered target payload sizes for the shaper
    pub size_bins: Vec<u16>,
    /// Window cap on padding bytes per real byte
    pub padding_alpha: f64,
    /// Upper bound of the per-frame send delay
    pub jitter_ms: u64,
    /// Fragments assigned to the same path before re-drawing
    pub batch_size: usize,
    /// Total copies of each fragment (1 = no redundancy)
    pub redundancy: usize,
    /// Outstanding unacked frames before a path reports Busy
    pub max_inflight: usize,

    /// 0 disables obfuscation, 3 enables full rotation
    pub obfuscation_level: u8,
    pub mode: Mode,
    /// Profile family rotation period, in windows
    pub proto_switch_period: u64,
    pub adaptive_paths: bool,
    pub adaptive_behavior: bool,
    pub adaptive_proto: bool,

    /// Seed for all randomness; omitted means draw from entropy
    pub seed: Option<u64>,
    pub run_id: Option<String>,
    pub out_dir: Option<PathBuf>,

    pub session_count: u32,
    pub session_duration_sec: u64,

    /// Floor for the ACK timeout, milliseconds
    pub ack_timeout_floor_ms: u64,
    /// EWMA loss at which a path is drained for the rest of the window
    pub unhealthy_loss: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entry_host: "127.0.0.1".to_string(),
            entry_port: 9001,
            middle_host: "127.0.0.1".to_string(),
            middle_ports: vec![9101, 9102],
            exit_host: "127.0.0.1".to_string(),
            exit_port: 9201,
            server_host: "127.0.0.1".to_string(),
            server_port: 9301,
            monitor_ports: vec![9103, 9104],
            window_size_sec: 10,
            size_bins: vec![64, 256, 1024],
            padding_alpha: 0.05,
            jitter_ms: 20,
            batch_size: 4,
            redundancy: 1,
            max_inflight: 64,
            obfuscation_level: 2,
            mode: Mode::Normal,
            proto_switch_period: 2,
            adaptive_paths: true,
            adaptive_behavior: true,
            adaptive_proto: true,
            seed: None,
            run_id: None,
            out_dir: None,
            session_count: 1,
            session_duration_sec: 10,
            ack_timeout_floor_ms: 200,
            unhealthy_loss: 0.5,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply the recognized environment overrides in place.
    pub fn apply_env(&mut self) {
        if let Some(count) = env_parse::<usize>("PATH_COUNT") {
            if count == 0 {
                warn!("PATH_COUNT=0 ignored, keeping {} paths", self.middle_ports.len());
            } else if count <= self.middle_ports.len() {
                self.middle_ports.truncate(count);
            } else {
                // Grow with consecutive ports after the last configured one
                let mut next = *self.middle_ports.last().unwrap_or(&9100) + 1;
                while self.middle_ports.len() < count {
                    self.middle_ports.push(next);
                    next += 1;
                }
            }
        }
        if let Some(level) = env_parse::<u8>("OBFUSCATION_LEVEL") {
            self.obfuscation_level = level.min(3);
        }
        if let Some(alpha) = env_parse::<f64>("ALPHA_PADDING") {
            self.padding_alpha = alpha.clamp(0.0, 1.0);
        }
        if let Some(mode) = env_parse::<Mode>("MODE") {
            self.mode = mode;
        }
        if let Some(period) = env_parse::<u64>("PROTO_SWITCH_PERIOD") {
            self.proto_switch_period = period.max(1);
        }
        if let Some(flag) = env_parse::<u8>("ADAPTIVE_PATHS") {
            self.adaptive_paths = flag != 0;
        }
        if let Some(flag) = env_parse::<u8>("ADAPTIVE_BEHAVIOR") {
            self.adaptive_behavior = flag != 0;
        }
        if let Some(flag) = env_parse::<u8>("ADAPTIVE_PROTO") {
            self.adaptive_proto = flag != 0;
        }
        if let Some(seed) = env_parse::<u64>("SEED") {
            self.seed = Some(seed);
        }
        if let Ok(run_id) = std::env::var("RUN_ID") {
            if !run_id.is_empty() {
                self.run_id = Some(run_id);
            }
        }
        if let Ok(out_dir) = std::env::var("OUT_DIR") {
            if !out_dir.is_empty() {
                self.out_dir = Some(PathBuf::from(out_dir));
            }
        }
        if let Some(count) = env_parse::<u32>("SESSION_COUNT") {
            self.session_count = count;
        }
        if let Some(duration) = env_parse::<u64>("SESSION_DURATION") {
            self.session_duration_sec = duration;
        }
    }

    pub fn path_count(&self) -> usize {
        self.middle_ports.len()
    }

    pub fn window_size(&self) -> Duration {
        Duration::from_secs(self.window_size_sec)
    }

    /// Fragment group TTL, at least three window periods.
    pub fn frag_ttl(&self) -> Duration {
        Duration::from_secs(self.window_size_sec * 3)
    }
}

/// Parse a comma-separated port list, e.g. `9101,9102`.
pub fn parse_port_list(raw: &str) -> Result<Vec<u16>, crate::Error> {
    let ports: Result<Vec<u16>, _> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect();
    let ports = ports.map_err(|e| crate::Error::Config(format!("bad port list {raw:?}: {e}")))?;
    if ports.is_empty() {
        return Err(crate::Error::Config(format!("empty port list {raw:?}")));
    }
    Ok(ports)
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring unparsable {name}={raw}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_topology() {
        let config = Config::default();
        assert_eq!(config.entry_port, 9001);
        assert_eq!(config.middle_ports, vec![9101, 9102]);
        assert_eq!(config.exit_port, 9201);
        assert_eq!(config.server_port, 9301);
        assert_eq!(config.frag_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn toml_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.middle_ports, config.middle_ports);
        assert_eq!(parsed.mode, config.mode);
    }

    #[test]
    fn port_list_parses() {
        assert_eq!(parse_port_list("9101,9102").unwrap(), vec![9101, 9102]);
        assert_eq!(parse_port_list(" 9103 ").unwrap(), vec![9103]);
        assert!(parse_port_list("").is_err());
        assert!(parse_port_list("abc").is_err());
    }

    #[test]
    fn mode_parses_from_str() {
        assert_eq!("normal".parse::<Mode>().unwrap(), Mode::Normal);
        assert_eq!("baseline_delay".parse::<Mode>().unwrap(), Mode::BaselineDelay);
        assert_eq!("baseline_padding".parse::<Mode>().unwrap(), Mode::BaselinePadding);
        assert!("bogus".parse::<Mode>().is_err());
    }
}
