//! Serialized file headers and directory metadata.
//!
//! Integers are byte-swapped to big-endian before serialization, as OSTree
//! does, while the GVariant framing offsets stay little-endian.

use gvariant::{gv, Marker};

use crate::xattr::{sorted_pairs, Xattr};
use crate::ChecksumError;

/// The `(uuuusa(ayay))` file header: uid, gid, mode, a reserved zero,
/// the symlink target (empty for regular files) and the xattrs.
pub fn file_header_variant(
    uid: u32,
    gid: u32,
    mode: u32,
    symlink_target: &str,
    xattrs: &[Xattr],
) -> Vec<u8> {
    let xattrs = sorted_pairs(xattrs);
    gv!("(uuuusa(ayay))").serialize_to_vec(&(
        u32::to_be(uid),
        u32::to_be(gid),
        u32::to_be(mode),
        0u32,
        symlink_target,
        &xattrs,
    ))
}

/// The file header prefixed with its big-endian length and four bytes of
/// padding, which is what is hashed ahead of file content.
pub fn build_file_header(
    uid: u32,
    gid: u32,
    mode: u32,
    symlink_target: &str,
    xattrs: &[Xattr],
) -> Result<Vec<u8>, ChecksumError> {
    let variant = file_header_variant(uid, gid, mode, symlink_target, xattrs);
    let len = u32::try_from(variant.len()).map_err(|_| ChecksumError::TooLarge(variant.len()))?;
    let mut r = Vec::with_capacity(variant.len() + 8);
    r.extend_from_slice(&len.to_be_bytes());
    r.extend_from_slice(&[0; 4]);
    r.extend_from_slice(&variant);
    Ok(r)
}

/// The `(uuua(ayay))` directory metadata.
pub fn build_dirmeta(uid: u32, gid: u32, mode: u32, xattrs: &[Xattr]) -> Vec<u8> {
    let xattrs = sorted_pairs(xattrs);
    gv!("(uuua(ayay))").serialize_to_vec(&(
        u32::to_be(uid),
        u32::to_be(gid),
        u32::to_be(mode),
        &xattrs,
    ))
}
