//! `manta-agent` runs as PID-adjacent plumbing inside each guest and serves
//! the control plane's framed RPC over vsock.
//!
//! Three operations:
//! - `ping` - identity and clock, doubling as the host's readiness signal
//! - `exec` - run a command with a timeout and per-stream output caps
//! - `net` - apply the per-sandbox address/gateway/DNS after boot or restore
//!
//! The agent is deliberately dumb: no sessions, no state between requests,
//! one request in flight per connection.

#![warn(missing_docs)]

mod error;
mod exec;
mod netcfg;
mod serve;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use exec::*;
pub use netcfg::*;
pub use serve::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The version string reported in ping responses.
pub const AGENT_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));
