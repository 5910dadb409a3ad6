use std::fs::{File, Metadata};
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;

use camino::Utf8Path;
use sha2::{Digest, Sha256};

use crate::header::{build_dirmeta, build_file_header};
use crate::xattr::{read_xattrs, Xattr};
use crate::ChecksumError;

/// Policy applied to a node's metadata before it is hashed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumFlags {
    /// Hash regular files and directories as owned by uid/gid 0.
    /// Symlinks always keep their real ownership.
    pub canonical_permissions: bool,
    /// Do not read extended attributes.
    pub ignore_xattrs: bool,
}

/// The kinds of node that have a checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    File,
    Dir,
    Symlink,
}

impl NodeKind {
    pub(crate) fn of(meta: &Metadata) -> Option<Self> {
        let ft = meta.file_type();
        if ft.is_file() {
            Some(NodeKind::File)
        } else if ft.is_dir() {
            Some(NodeKind::Dir)
        } else if ft.is_symlink() {
            Some(NodeKind::Symlink)
        } else {
            None
        }
    }
}

/// The ownership that enters the checksum of a node. Canonical
/// permissions zero it, except for symlinks.
pub(crate) fn hashed_owner(uid: u32, gid: u32, kind: NodeKind, flags: ChecksumFlags) -> (u32, u32) {
    if flags.canonical_permissions && kind != NodeKind::Symlink {
        (0, 0)
    } else {
        (uid, gid)
    }
}

/// Ownership, mode and xattrs of a node, as they enter the checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMeta {
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Full `st_mode`, including the file type bits.
    pub mode: u32,
    /// Extended attributes, in any order.
    pub xattrs: Vec<Xattr>,
}

fn finish(hasher: Sha256) -> String {
    hex::encode(hasher.finalize())
}

/// Checksum a regular file from its metadata and content.
pub fn checksum_file_from_parts(
    meta: &NodeMeta,
    mut content: impl Read,
) -> Result<String, ChecksumError> {
    let header = build_file_header(meta.uid, meta.gid, meta.mode, "", &meta.xattrs)?;
    let mut hasher = Sha256::new();
    hasher.update(&header);
    io::copy(&mut content, &mut hasher).map_err(ChecksumError::io("<content>"))?;
    Ok(finish(hasher))
}

fn checksum_symlink_from_parts(meta: &NodeMeta, target: &str) -> Result<String, ChecksumError> {
    let header = build_file_header(meta.uid, meta.gid, meta.mode, target, &meta.xattrs)?;
    Ok(hex::encode(Sha256::digest(&header)))
}

fn checksum_dir_from_parts(meta: &NodeMeta) -> String {
    hex::encode(Sha256::digest(build_dirmeta(
        meta.uid,
        meta.gid,
        meta.mode,
        &meta.xattrs,
    )))
}

/// Checksum `path` given its already-read `meta`.
pub(crate) fn checksum_node(
    path: &Utf8Path,
    meta: &Metadata,
    flags: ChecksumFlags,
) -> Result<String, ChecksumError> {
    let kind = NodeKind::of(meta).ok_or_else(|| ChecksumError::UnsupportedType {
        path: path.to_owned(),
    })?;
    let (uid, gid) = hashed_owner(meta.uid(), meta.gid(), kind, flags);
    let xattrs = if flags.ignore_xattrs {
        Vec::new()
    } else {
        read_xattrs(path).map_err(ChecksumError::io(path))?
    };
    let node = NodeMeta {
        uid,
        gid,
        mode: meta.mode(),
        xattrs,
    };
    let r = match kind {
        NodeKind::File => {
            let f = File::open(path).map_err(ChecksumError::io(path))?;
            checksum_file_from_parts(&node, f).map_err(|e| match e {
                ChecksumError::Io { source, .. } => ChecksumError::Io {
                    path: path.to_owned(),
                    source,
                },
                e => e,
            })?
        }
        NodeKind::Symlink => {
            let target = std::fs::read_link(path).map_err(ChecksumError::io(path))?;
            let target = target.to_str().ok_or_else(|| ChecksumError::NonUtf8Target {
                path: path.to_owned(),
            })?;
            checksum_symlink_from_parts(&node, target)?
        }
        NodeKind::Dir => checksum_dir_from_parts(&node),
    };
    tracing::trace!("{path}: {r}");
    Ok(r)
}

/// Compute the OSTree content checksum of a single file, symlink or
/// directory, without following a final symlink.
pub fn checksum_path(path: &Utf8Path, flags: ChecksumFlags) -> Result<String, ChecksumError> {
    let meta = path.symlink_metadata().map_err(ChecksumError::io(path))?;
    checksum_node(path, &meta, flags)
}
