//! Tunnel layer
//!
//! Provides:
//! - Frame encoding/decoding over a byte stream
//! - Fragment group reassembly
//! - Stream peeking for transparent forwarders

mod fragment;
mod frame;

pub use fragment::FragmentBuffer;
pub use frame::{
    read_frame, write_frame, Frame, FrameSummary, Peek, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE,
};

use thiserror::Error;

/// Frame flag bits
pub mod flags {
    /// Handshake prelude frame
    pub const HANDSHAKE: u8 = 0x01;
    /// Member of a fragment group with more than one fragment
    pub const FRAG: u8 = 0x02;
    /// Padding-only frame, carries no application bytes
    pub const PAD: u8 = 0x04;
    /// Acknowledgment, payload is the 4-byte acked seq
    pub const ACK: u8 = 0x08;
}

/// Size of the on-the-wire profile id space; ids at or past this decode
/// as malformed
pub const PROTO_ID_SPACE: u8 = 3;

/// Number of malformed frames tolerated before a connection is closed
pub const MALFORMED_CLOSE_THRESHOLD: u32 = 8;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
