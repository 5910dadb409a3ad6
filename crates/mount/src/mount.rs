//! Helpers for interacting with mountpoints
//!
//! This covers reading the live mount table, resolving device attributes
//! such as filesystem UUIDs, and setting up and tearing down the mounts a
//! chroot sandbox needs.

mod devattr;
mod mountinfo;
mod orchestrator;
mod table;

pub use devattr::*;
pub use mountinfo::*;
pub use orchestrator::*;
pub use table::*;
