//! Per-sandbox network provisioning.
//!
//! Every sandbox owns a `/30` keyed by its subnet index, realized as a named
//! network namespace holding a veth uplink and the tap device the VMM's
//! virtio-net backend attaches to. Slots are pre-provisioned by a warm pool
//! so the hot create path never pays netns/veth/tap construction cost; the
//! startup-only NAT rule and forwarding toggles live here too.

mod nat;
mod netns;
mod pool;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use nat::*;
pub use netns::*;
pub use pool::*;
