//! Snapshot bundles and per-sandbox disk materialization.
//!
//! The golden bundle is built once per base-rootfs lineage and shared
//! read-only across every restore; user bundles capture a running sandbox for
//! later restore. Disk materialization hands each sandbox a writable clone of
//! a bundle disk, reflinked when the filesystem supports it.

mod disk;
mod store;
mod user;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use disk::*;
pub use store::*;
pub use user::*;
