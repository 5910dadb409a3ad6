use std::collections::BTreeMap;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::checksum::{checksum_node, hashed_owner, ChecksumFlags, NodeKind};
use crate::ChecksumError;

const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;
const S_ISVTX: u32 = 0o1000;

/// Node type of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link.
    Symlink,
}

impl From<NodeKind> for PathType {
    fn from(k: NodeKind) -> Self {
        match k {
            NodeKind::File => PathType::File,
            NodeKind::Dir => PathType::Dir,
            NodeKind::Symlink => PathType::Symlink,
        }
    }
}

/// One node of a content manifest.
///
/// Equality ignores `path`. Regular files compare by checksum, which
/// already covers their content, mode, ownership and xattrs; directories
/// and symlinks compare by their metadata fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PathInfo {
    /// Path relative to the walked root, with the root itself being `/`.
    pub path: Utf8PathBuf,
    /// Node type.
    #[serde(rename = "type")]
    pub path_type: PathType,
    /// The `0o777` permission bits.
    pub perms: u32,
    /// Set-user-ID bit.
    pub setuid: bool,
    /// Set-group-ID bit.
    pub setgid: bool,
    /// Sticky bit.
    pub sticky: bool,
    /// Owner, as hashed.
    pub uid: u32,
    /// Group, as hashed.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Target of a symlink.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Content checksum of a regular file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl PartialEq for PathInfo {
    fn eq(&self, other: &Self) -> bool {
        if self.path_type != other.path_type {
            return false;
        }
        match self.path_type {
            PathType::File => self.checksum == other.checksum,
            PathType::Dir => {
                (self.perms, self.setuid, self.setgid, self.sticky, self.uid, self.gid)
                    == (
                        other.perms,
                        other.setuid,
                        other.setgid,
                        other.sticky,
                        other.uid,
                        other.gid,
                    )
            }
            PathType::Symlink => {
                (&self.link_target, self.uid, self.gid)
                    == (&other.link_target, other.uid, other.gid)
            }
        }
    }
}

impl Eq for PathInfo {}

/// A difference between two manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ManifestDifference {
    /// Only present on the right.
    Added {
        /// The new entry.
        entry: PathInfo,
    },
    /// Only present on the left.
    Removed {
        /// The old entry.
        entry: PathInfo,
    },
    /// Present on both sides but not equal.
    Changed {
        /// Left entry.
        left: PathInfo,
        /// Right entry.
        right: PathInfo,
    },
}

impl ManifestDifference {
    /// The path this difference is about.
    pub fn path(&self) -> &Utf8Path {
        match self {
            ManifestDifference::Added { entry } | ManifestDifference::Removed { entry } => {
                &entry.path
            }
            ManifestDifference::Changed { left, .. } => &left.path,
        }
    }
}

fn manifest_path(root: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    let rel = path.strip_prefix(root).unwrap_or(path);
    Utf8Path::new("/").join(rel)
}

/// Walk `root` and describe every regular file, directory and symlink in
/// it, sorted by path component so each directory precedes its contents.
/// Symlinks are not followed, including symlinks to directories and a
/// symlinked `root`, which is listed as a single symlink entry; other
/// node types are left out.
pub fn walk_tree(root: &Utf8Path, flags: ChecksumFlags) -> Result<Vec<PathInfo>, ChecksumError> {
    let mut r = Vec::new();
    for ent in WalkDir::new(root)
        .follow_links(false)
        .follow_root_links(false) {
        let ent = ent.map_err(|e| {
            let path = e
                .path()
                .and_then(Utf8Path::from_path)
                .unwrap_or(root)
                .to_owned();
            ChecksumError::Io {
                path,
                source: e.into(),
            }
        })?;
        let path = Utf8Path::from_path(ent.path())
            .ok_or_else(|| ChecksumError::NonUtf8Path(ent.path().to_owned()))?;
        let meta = ent.metadata().map_err(|e| ChecksumError::Io {
            path: path.to_owned(),
            source: e.into(),
        })?;
        let Some(kind) = NodeKind::of(&meta) else {
            tracing::trace!("Skipping special file {path}");
            continue;
        };
        let (uid, gid) = hashed_owner(meta.uid(), meta.gid(), kind, flags);
        let mode = meta.mode();
        let link_target = match kind {
            NodeKind::Symlink => {
                let t = std::fs::read_link(path).map_err(ChecksumError::io(path))?;
                Some(String::from_utf8_lossy(t.as_os_str().as_bytes()).into_owned())
            }
            _ => None,
        };
        let checksum = match kind {
            NodeKind::File => Some(checksum_node(path, &meta, flags)?),
            _ => None,
        };
        r.push(PathInfo {
            path: manifest_path(root, path),
            path_type: kind.into(),
            perms: mode & 0o777,
            setuid: mode & S_ISUID != 0,
            setgid: mode & S_ISGID != 0,
            sticky: mode & S_ISVTX != 0,
            uid,
            gid,
            size: meta.len(),
            link_target,
            checksum,
        });
    }
    r.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!("Walked {} entries under {root}", r.len());
    Ok(r)
}

/// Compare two manifests, returning the differences sorted by path.
pub fn diff_manifests(left: &[PathInfo], right: &[PathInfo]) -> Vec<ManifestDifference> {
    let left: BTreeMap<_, _> = left.iter().map(|e| (e.path.as_path(), e)).collect();
    let right: BTreeMap<_, _> = right.iter().map(|e| (e.path.as_path(), e)).collect();
    let mut r = Vec::new();
    for (path, l) in &left {
        match right.get(path) {
            None => r.push(ManifestDifference::Removed {
                entry: (*l).clone(),
            }),
            Some(rt) if l != rt => r.push(ManifestDifference::Changed {
                left: (*l).clone(),
                right: (*rt).clone(),
            }),
            Some(_) => {}
        }
    }
    for (path, rt) in &right {
        if !left.contains_key(path) {
            r.push(ManifestDifference::Added {
                entry: (*rt).clone(),
            });
        }
    }
    r.sort_by(|a, b| a.path().cmp(b.path()));
    r
}
