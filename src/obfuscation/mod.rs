//! Protocol obfuscation layer
//!
//! Provides:
//! - A static catalog of protocol profile templates
//! - Frame wrapping with profile-specific extra headers and preludes
//!
//! Profiles vary the extra-header size, the filler used for it, and an
//! optional handshake prelude sent once per connection, so that on-the-wire
//! features differ from path to path and rotate over time.

mod obfuscator;
mod profiles;

pub use obfuscator::{FrameSpec, Obfuscator};
pub use profiles::{FillerPolicy, ProfileCatalog, ProfileTemplate, PROFILE_COUNT};

use thiserror::Error;

/// Obfuscation layer errors
#[derive(Debug, Error)]
pub enum ObfuscationError {
    /// Receivers treat this exactly like a malformed frame.
    #[error("unknown profile id: {0}")]
    UnknownProfile(u8),

    #[error("tunnel error: {0}")]
    Tunnel(#[from] crate::tunnel::TunnelError),
}
