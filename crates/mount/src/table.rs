use std::io;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use osimg_sysops::{HostOps, SystemOps, MOUNTINFO_PATH};

use crate::mountinfo::{parse_mountinfo, MountEntry};

/// Queries against the live mount table.
///
/// Nothing is cached; every query reads the table again, so results only
/// reflect the moment of the call.
#[derive(Debug)]
pub struct MountTable<S: SystemOps = HostOps> {
    ops: S,
    path: Utf8PathBuf,
}

impl MountTable<HostOps> {
    /// The mount table of the current process.
    pub fn host() -> Self {
        Self::new(HostOps)
    }
}

impl<S: SystemOps> MountTable<S> {
    /// Read `/proc/self/mountinfo` through `ops`.
    pub fn new(ops: S) -> Self {
        Self::with_path(ops, MOUNTINFO_PATH)
    }

    /// Read a mountinfo-format table at an alternative path, e.g.
    /// `/proc/1/mountinfo`.
    pub fn with_path(ops: S, path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            ops,
            path: path.into(),
        }
    }

    /// The system operations this table reads through.
    pub fn ops(&self) -> &S {
        &self.ops
    }

    /// All current entries, in kernel order.
    pub fn entries(&self) -> Result<Vec<MountEntry>> {
        let content = self
            .ops
            .read_to_string(&self.path)
            .with_context(|| format!("Reading {}", self.path))?;
        Ok(parse_mountinfo(&content))
    }

    /// Make `path` comparable with mountpoints, which the kernel lists
    /// absolute with symlinks resolved. Components that don't exist yet are
    /// appended to the resolved existing ancestor.
    pub fn resolve(&self, path: &Utf8Path) -> Result<Utf8PathBuf> {
        match self.ops.canonicalize(path) {
            Ok(p) => Ok(p),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                    return Err(e).with_context(|| format!("Resolving {path}"));
                };
                let parent = if parent.as_str().is_empty() {
                    Utf8Path::new(".")
                } else {
                    parent
                };
                Ok(self.resolve(parent)?.join(name))
            }
            Err(e) => Err(e).with_context(|| format!("Resolving {path}")),
        }
    }

    /// The entry mounted at exactly `target`. When several mounts are
    /// stacked there, the topmost (last listed) one is returned.
    pub fn find_by_target(&self, target: &Utf8Path) -> Result<Option<MountEntry>> {
        let target = self.resolve(target)?;
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|e| e.mountpoint == target))
    }

    /// The mount containing `path`: the one with the longest mountpoint that
    /// is a prefix of it, falling back to `/`.
    pub fn find_containing(&self, path: &Utf8Path) -> Result<Option<MountEntry>> {
        let path = self.resolve(path)?;
        let mut best: Option<MountEntry> = None;
        for e in self.entries()? {
            if !path.starts_with(&e.mountpoint) {
                continue;
            }
            let depth = e.mountpoint.components().count();
            // >= so that the later of two stacked mounts wins
            if best
                .as_ref()
                .map_or(true, |b| depth >= b.mountpoint.components().count())
            {
                best = Some(e);
            }
        }
        Ok(best)
    }

    /// All entries whose source is `source`.
    pub fn find_by_source(&self, source: &str) -> Result<Vec<MountEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.source == source)
            .collect())
    }

    /// All entries mounted at or below `prefix`, compared by path component.
    pub fn find_under(&self, prefix: &Utf8Path) -> Result<Vec<MountEntry>> {
        let prefix = self.resolve(prefix)?;
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.mountpoint.starts_with(&prefix))
            .collect())
    }

    /// Whether something is mounted at exactly `path`.
    pub fn is_mountpoint(&self, path: &Utf8Path) -> Result<bool> {
        Ok(self.find_by_target(path)?.is_some())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;
    use osimg_sysops::fake::FakeOps;
    use similar_asserts::assert_eq;

    const FIXTURE: &str = indoc! { r#"
        22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
        30 22 8:2 / /boot rw,relatime shared:2 - vfat /dev/sda2 rw
        31 22 0:40 / /mnt/image rw - ext4 /dev/loop0p2 rw
        32 31 0:41 / /mnt/image/boot rw - vfat /dev/loop0p1 rw
        33 31 0:42 / /mnt/image rw - tmpfs tmpfs rw
        34 22 0:43 / /mnt/imagery rw - tmpfs scratch rw
    "# };

    fn table() -> MountTable<FakeOps> {
        let ops = FakeOps::new();
        ops.set_file(MOUNTINFO_PATH, FIXTURE);
        MountTable::new(ops)
    }

    #[test]
    fn test_find_by_target_stacked() {
        let t = table();
        let e = t.find_by_target(Utf8Path::new("/mnt/image")).unwrap().unwrap();
        assert_eq!(e.mount_id, 33);
        assert_eq!(e.fstype, "tmpfs");
        // Trailing slashes don't matter
        let e = t.find_by_target(Utf8Path::new("/boot/")).unwrap().unwrap();
        assert_eq!(e.mount_id, 30);
        assert!(t.find_by_target(Utf8Path::new("/mnt")).unwrap().is_none());
    }

    #[test]
    fn test_find_containing() {
        let t = table();
        let id = |p: &str| {
            t.find_containing(Utf8Path::new(p))
                .unwrap()
                .map(|e| e.mount_id)
        };
        assert_eq!(id("/mnt/image/boot/efi"), Some(32));
        assert_eq!(id("/mnt/image/usr"), Some(33));
        assert_eq!(id("/mnt/imagery/x"), Some(34));
        assert_eq!(id("/etc/passwd"), Some(22));
        assert_eq!(id("/"), Some(22));
    }

    #[test]
    fn test_find_by_source() {
        let t = table();
        let found = t.find_by_source("/dev/loop0p1").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mountpoint, "/mnt/image/boot");
        assert!(t.find_by_source("/dev/nope").unwrap().is_empty());
    }

    #[test]
    fn test_find_under() {
        let t = table();
        let ids: Vec<u32> = t
            .find_under(Utf8Path::new("/mnt/image"))
            .unwrap()
            .into_iter()
            .map(|e| e.mount_id)
            .collect();
        // Not /mnt/imagery
        assert_eq!(ids, [31, 32, 33]);
    }

    #[test]
    fn test_noncanonical_queries() {
        let t = table();
        t.ops().add_symlink("/srv/link", "/mnt/image");
        let e = t.find_by_target(Utf8Path::new("/mnt/x/../image")).unwrap().unwrap();
        assert_eq!(e.mount_id, 33);
        assert!(t.is_mountpoint(Utf8Path::new("mnt/image/boot")).unwrap());
        assert!(t.is_mountpoint(Utf8Path::new("/srv/link")).unwrap());
        assert_eq!(t.find_under(Utf8Path::new("/srv/link")).unwrap().len(), 3);
        assert_eq!(
            t.find_containing(Utf8Path::new("/srv/link/boot/efi"))
                .unwrap()
                .map(|e| e.mount_id),
            Some(32)
        );
    }

    #[test]
    fn test_resolve_missing_tail() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let t = MountTable::host();
        let real = t.resolve(dir).unwrap();
        std::fs::create_dir(dir.join("d")).unwrap();
        assert_eq!(
            t.resolve(&dir.join("d/../d/not/yet")).unwrap(),
            real.join("d/not/yet")
        );
    }

    #[test]
    fn test_rereads() {
        let ops = FakeOps::new();
        let t = MountTable::new(ops.clone());
        assert!(!t.is_mountpoint(Utf8Path::new("/mnt")).unwrap());
        ops.add_mount("tmpfs", "/mnt", "tmpfs");
        assert!(t.is_mountpoint(Utf8Path::new("/mnt")).unwrap());
    }

    #[test]
    fn test_missing_table() {
        let t = MountTable::with_path(FakeOps::new(), "/proc/99/mountinfo");
        let e = t.entries().unwrap_err();
        assert!(e.to_string().contains("/proc/99/mountinfo"));
    }

    #[test]
    fn test_host_has_root() {
        let Ok(entries) = MountTable::host().entries() else {
            return;
        };
        if !entries.iter().any(|e| e.mountpoint == "/") {
            return;
        }
        assert!(MountTable::host()
            .find_containing(Utf8Path::new("/"))
            .unwrap()
            .is_some());
    }
}
