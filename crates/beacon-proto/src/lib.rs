// ABOUTME: Wire types and frame codec for the beacon agent/collector channel.
// ABOUTME: Single source of truth for frame bodies exchanged over one duplex connection.

#![allow(clippy::derive_partial_eq_without_eq)]

pub mod codec;
mod messages;

// Re-export message types at crate root for convenience
pub use messages::*;

pub use codec::{CodecError, FrameCodec, DEFAULT_MAX_FRAME_LENGTH};

/// Version carried in every handshake. The collector rejects any other value.
pub const PROTOCOL_VERSION: u32 = 1;
