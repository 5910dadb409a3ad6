//! # Content checksums
//!
//! This crate computes the same SHA-256 content checksums as OSTree for a
//! single file, symlink or directory, and builds whole-tree manifests from
//! them for reproducibility checks.
//!
//! The checksum input is a GVariant serialization of the node's ownership,
//! mode, symlink target and extended attributes; see [`header`].

mod checksum;
mod error;
pub mod header;
mod manifest;
mod xattr;

pub use checksum::*;
pub use error::*;
pub use header::{build_dirmeta, build_file_header, file_header_variant};
pub use manifest::*;
pub use xattr::*;
