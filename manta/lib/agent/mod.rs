//! Host side of the framed RPC to the in-guest agent, carried over the
//! sandbox's Firecracker vsock unix socket.

mod client;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
