//! `manta-rpc` is the tiny framed JSON RPC spoken between the manta control
//! plane on the host and the agent inside each guest.
//!
//! The framing is:
//!
//! ```text
//!   u32 big-endian payload length
//!   <length> bytes of UTF-8 JSON
//! ```
//!
//! A single connection carries multiple request/response pairs. Zero-length
//! frames are invalid, frames above [`MAX_MESSAGE_BYTES`] are rejected before
//! any allocation, and every JSON decode rejects unknown fields so both sides
//! fail loudly on schema drift.

#![warn(missing_docs)]

mod error;
mod frame;
mod message;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use frame::*;
pub use message::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The AF_VSOCK port the in-guest agent listens on.
pub const DEFAULT_AGENT_PORT: u32 = 7777;

/// Caps a single framed JSON payload to avoid unbounded allocation.
pub const MAX_MESSAGE_BYTES: usize = 8 << 20; // 8 MiB
