//! # Mirage Tunnel
//!
//! A multi-hop, multi-path tunneling proxy prototype for studying traffic
//! analysis resistance. A client bytestream is fragmented, wrapped in an
//! obfuscated binary frame format, fanned out across several parallel
//! overlay paths (Entry → Middle_i → Exit → echo Server and back), and
//! reassembled at the far end.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Relay Nodes                         │
//! │        (Entry, Middle forwarders, Exit)              │
//! ├─────────────────────────────────────────────────────┤
//! │              Multi-path Scheduler                    │
//! │   (weighted selection, redundancy, receive dedup)    │
//! ├─────────────────────────────────────────────────────┤
//! │          Shaping & Obfuscation Pipeline              │
//! │    (size bucketing, padding budget, jitter,          │
//! │     protocol profiles, extra-header filler)          │
//! ├─────────────────────────────────────────────────────┤
//! │                 Tunnel Layer                         │
//! │      (frame codec, fragment reassembly)              │
//! ├─────────────────────────────────────────────────────┤
//! │                 Path Links                           │
//! │   (per-path TCP, ACK tracking, RTT/loss EWMA)        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! A per-node strategy engine ticks once per window and publishes an
//! immutable [`strategy::StrategySnapshot`] that the scheduler and shaper
//! adopt atomically at the next frame boundary.
//!
//! This is a research prototype: frames are obfuscated, not encrypted.

pub mod config;
pub mod obfuscation;
pub mod path;
pub mod relay;
pub mod runlog;
pub mod scheduler;
pub mod shaping;
pub mod strategy;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version byte
pub const WIRE_VERSION: u8 = 1;

/// Frame magic, first two bytes of every frame
pub const MAGIC: [u8; 2] = [0xA7, 0xC9];

/// Hard cap on the total encoded size of one frame (64 KiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Obfuscation error: {0}")]
    Obfuscation(#[from] obfuscation::ObfuscationError),

    #[error("Path error: {0}")]
    Path(#[from] path::PathError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] scheduler::SchedulerError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Configuration error: {0}")]
    Config(String),
}
