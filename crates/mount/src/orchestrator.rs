use std::ffi::OsStr;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use osimg_sysops::{
    HostOps, MountFlags, MountRequest, Propagation, SystemOps, UnmountMode,
};
use osimg_utils::format_path_list;

use crate::table::MountTable;

/// Where the distfiles cache is bound inside a rootfs.
pub const DISTFILES_SUBPATH: &str = "var/cache/distfiles";
/// Where the binary package cache is bound inside a rootfs.
pub const BINPKGS_SUBPATH: &str = "var/cache/binpkgs";

/// How many offending mountpoints to list in an error.
const MAX_LISTED_MOUNTS: usize = 20;

/// Returned when asked to mount over or unmount the host root.
#[derive(Debug, thiserror::Error)]
#[error("Refusing to operate on {path}: it is the host root filesystem")]
pub struct HostRootRefused {
    /// The path that resolved to `/`.
    pub path: Utf8PathBuf,
}

/// Mountpoints in the order they were created.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MountRecord(Vec<Utf8PathBuf>);

impl MountRecord {
    /// An empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new mount.
    pub fn push(&mut self, target: impl Into<Utf8PathBuf>) {
        self.0.push(target.into());
    }

    /// Iterate in creation order.
    pub fn iter(&self) -> std::slice::Iter<'_, Utf8PathBuf> {
        self.0.iter()
    }

    /// Number of recorded mounts.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The recorded mountpoints.
    pub fn into_inner(self) -> Vec<Utf8PathBuf> {
        self.0
    }
}

impl<'a> IntoIterator for &'a MountRecord {
    type Item = &'a Utf8PathBuf;
    type IntoIter = std::slice::Iter<'a, Utf8PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The outcome of [`MountOrchestrator::cleanup_mounts`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Unmounted normally.
    pub unmounted: Vec<Utf8PathBuf>,
    /// Not mounted at cleanup time.
    pub skipped: Vec<Utf8PathBuf>,
    /// Only released by a lazy unmount.
    pub lazy: Vec<Utf8PathBuf>,
    /// Could not be released at all.
    pub failed: Vec<Utf8PathBuf>,
}

impl CleanupReport {
    /// True if nothing was left mounted.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Build the command running `program` chrooted into `target`, in fresh
/// mount, pid, uts and ipc namespaces with a private `/proc`.
pub fn chroot_command<I, A>(target: &Utf8Path, program: &str, args: I) -> Command
where
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let mut cmd = Command::new("unshare");
    cmd.args(["--mount", "--pid", "--uts", "--ipc", "--fork"])
        .arg(format!("--mount-proc={target}/proc"))
        .arg("chroot")
        .arg(target)
        .arg(program)
        .args(args);
    cmd
}

/// Creates and removes mounts, refusing to touch the host root.
#[derive(Debug)]
pub struct MountOrchestrator<S: SystemOps = HostOps> {
    table: MountTable<S>,
}

impl MountOrchestrator<HostOps> {
    /// Operate on the running system.
    pub fn host() -> Self {
        Self::new(HostOps)
    }
}

impl<S: SystemOps> MountOrchestrator<S> {
    /// Operate through `ops`, reading `/proc/self/mountinfo`.
    pub fn new(ops: S) -> Self {
        Self::with_table(MountTable::new(ops))
    }

    /// Operate through the ops of `table`, checking mounts against it.
    pub fn with_table(table: MountTable<S>) -> Self {
        Self { table }
    }

    /// The mount table used for checks.
    pub fn table(&self) -> &MountTable<S> {
        &self.table
    }

    fn ops(&self) -> &S {
        self.table.ops()
    }

    /// Fail with [`HostRootRefused`] if `dir` is the same inode as `/`.
    pub fn ensure_not_host_root(&self, dir: &Utf8Path) -> Result<()> {
        let ops = self.ops();
        let root = ops
            .identity(Utf8Path::new("/"))
            .context("Querying /")?;
        let id = ops
            .identity(dir)
            .with_context(|| format!("Querying {dir}"))?;
        if id == root {
            return Err(HostRootRefused {
                path: dir.to_owned(),
            }
            .into());
        }
        Ok(())
    }

    /// Create `target` and return its resolved path, which must stay below
    /// `within` when given and must not be the host root.
    fn prepare_target(&self, target: &Utf8Path, within: Option<&Utf8Path>) -> Result<Utf8PathBuf> {
        self.ops()
            .create_dir_all(target)
            .with_context(|| format!("Creating {target}"))?;
        let resolved = self.table.resolve(target)?;
        if let Some(root) = within {
            anyhow::ensure!(
                resolved.starts_with(root),
                "{target} resolves to {resolved}, outside of {root}"
            );
        }
        self.ensure_not_host_root(&resolved)?;
        Ok(resolved)
    }

    fn mount_request(&self, req: MountRequest) -> Result<()> {
        tracing::debug!("Mounting {}", req.target());
        self.ops()
            .mount(&req)
            .with_context(|| format!("Mounting {}", req.target()))
    }

    fn set_slave(&self, target: &Utf8Path) -> Result<()> {
        self.mount_request(MountRequest::Propagation {
            target: target.to_owned(),
            propagation: Propagation::Slave,
            recursive: false,
        })
    }

    /// Bind `source` onto the prepared `target` and mark it slave; `target`
    /// is recorded as soon as the bind itself succeeds.
    fn bind_slave(
        &self,
        source: &Utf8Path,
        target: Utf8PathBuf,
        record: &mut MountRecord,
    ) -> Result<()> {
        self.mount_request(MountRequest::Bind {
            source: source.to_owned(),
            target: target.clone(),
            recursive: false,
        })?;
        record.push(target.clone());
        self.set_slave(&target)
    }

    fn mount_fs(
        &self,
        source: &str,
        target: Utf8PathBuf,
        fstype: &str,
        flags: MountFlags,
        data: Option<&str>,
        record: &mut MountRecord,
    ) -> Result<()> {
        self.mount_request(MountRequest::Filesystem {
            source: source.to_owned(),
            target: target.clone(),
            fstype: fstype.to_owned(),
            flags,
            data: data.map(ToOwned::to_owned),
        })?;
        record.push(target);
        Ok(())
    }

    fn impl_setup_common(&self, root: &Utf8Path, record: &mut MountRecord) -> Result<()> {
        let resolved = self.table.resolve(root)?;
        self.ensure_not_host_root(&resolved)?;
        let root = resolved.as_path();
        let host = Utf8Path::new("/");
        let under = |sub: &str| self.prepare_target(&root.join(sub), Some(root));
        self.bind_slave(&host.join("dev"), under("dev")?, record)?;
        self.bind_slave(&host.join("dev/pts"), under("dev/pts")?, record)?;
        self.mount_fs(
            "shm",
            under("dev/shm")?,
            "tmpfs",
            MountFlags::NOSUID_NODEV,
            None,
            record,
        )?;
        self.mount_fs(
            "proc",
            under("proc")?,
            "proc",
            MountFlags::NOSUID_NODEV_NOEXEC,
            None,
            record,
        )?;
        self.bind_slave(&host.join("sys"), under("sys")?, record)?;
        self.mount_fs(
            "tmpfs",
            under("run/lock")?,
            "tmpfs",
            MountFlags::NOSUID_NODEV_NOEXEC,
            Some("mode=1777,size=5M"),
            record,
        )?;
        Ok(())
    }

    /// Set up `/dev`, `/dev/pts`, `/dev/shm`, `/proc`, `/sys` and
    /// `/run/lock` under `root` for use as a chroot.
    ///
    /// The record of what was mounted is returned even on failure, so the
    /// caller can pass it to [`Self::cleanup_mounts`].
    pub fn setup_common_rootfs_mounts(&self, root: &Utf8Path) -> (MountRecord, Result<()>) {
        let mut record = MountRecord::new();
        let r = self
            .impl_setup_common(root, &mut record)
            .with_context(|| format!("Setting up mounts in {root}"));
        match &r {
            Ok(()) => tracing::info!("Set up {} mounts in {root}", record.len()),
            Err(e) => tracing::debug!("Setup in {root} stopped after {}: {e:#}", record.len()),
        }
        (record, r)
    }

    /// Unmount everything in `record`, last first.
    ///
    /// Entries that are no longer mounted are skipped. A failed unmount
    /// falls back to a sync and a lazy unmount; failures never stop the
    /// remaining entries from being processed.
    pub fn cleanup_mounts(&self, record: &MountRecord) -> CleanupReport {
        let ops = self.ops();
        let mut report = CleanupReport::default();
        for target in record.iter().rev() {
            let target = match self.table.resolve(target) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("{e:#}");
                    target.clone()
                }
            };
            let target = &target;
            if let Err(e) = self.ensure_not_host_root(target) {
                tracing::error!("Not unmounting {target}: {e:#}");
                report.failed.push(target.clone());
                continue;
            }
            match self.table.is_mountpoint(target) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!("{target} is not mounted, skipping");
                    report.skipped.push(target.clone());
                    continue;
                }
                Err(e) => tracing::warn!("Checking {target}: {e:#}; unmounting anyway"),
            }
            let err = match ops.unmount(target, UnmountMode::Normal) {
                Ok(()) => {
                    tracing::debug!("Unmounted {target}");
                    report.unmounted.push(target.clone());
                    continue;
                }
                Err(e) => e,
            };
            tracing::warn!("Unmounting {target}: {err}; trying a lazy unmount");
            if let Err(e) = ops.sync_filesystem(target) {
                tracing::warn!("Syncing {target}: {e}");
            }
            match ops.unmount(target, UnmountMode::Lazy) {
                Ok(()) => report.lazy.push(target.clone()),
                Err(e) => {
                    tracing::error!("Lazy unmount of {target}: {e}");
                    report.failed.push(target.clone());
                }
            }
        }
        report
    }

    /// Mount a filesystem, e.g. a freshly formatted partition, and record it.
    /// `options` is passed to the filesystem as-is.
    #[context("Mounting {source} on {target}")]
    pub fn mount_filesystem(
        &self,
        source: &str,
        target: &Utf8Path,
        fstype: &str,
        options: Option<&str>,
        record: &mut MountRecord,
    ) -> Result<()> {
        let target = self.prepare_target(target, None)?;
        self.mount_fs(
            source,
            target,
            fstype,
            MountFlags::default(),
            options,
            record,
        )
    }

    /// Bind `source` onto `target` with slave propagation.
    #[context("Bind mounting {source} on {target}")]
    pub fn bind_mount(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        let mut record = MountRecord::new();
        let prepared = self.prepare_target(target, None)?;
        self.bind_slave(source, prepared, &mut record)?;
        tracing::info!("Bind mounted {source} on {target}");
        Ok(())
    }

    /// Bind `source` onto `subpath` of `rootfs`, which must resolve to a
    /// path inside `rootfs`.
    #[context("Bind mounting {source} into {rootfs}")]
    fn bind_into(&self, source: &Utf8Path, rootfs: &Utf8Path, subpath: &str) -> Result<()> {
        let root = self.table.resolve(rootfs)?;
        let target = self.prepare_target(&root.join(subpath), Some(&root))?;
        let mut record = MountRecord::new();
        self.bind_slave(source, target.clone(), &mut record)?;
        tracing::info!("Bind mounted {source} on {target}");
        Ok(())
    }

    /// Undo [`Self::bind_mount`]; a target that is not mounted is left alone.
    #[context("Unmounting {target}")]
    pub fn bind_umount(&self, target: &Utf8Path) -> Result<()> {
        let resolved = self.table.resolve(target)?;
        if !self.table.is_mountpoint(&resolved)? {
            tracing::debug!("{target} is not mounted");
            return Ok(());
        }
        self.ensure_not_host_root(&resolved)?;
        self.ops()
            .unmount(&resolved, UnmountMode::Normal)
            .with_context(|| format!("Unmounting {target}"))?;
        Ok(())
    }

    /// Bind the distfiles cache `source` into `rootfs`.
    pub fn bind_distfiles(&self, source: &Utf8Path, rootfs: &Utf8Path) -> Result<()> {
        self.bind_into(source, rootfs, DISTFILES_SUBPATH)
    }

    /// Undo [`Self::bind_distfiles`].
    pub fn umount_distfiles(&self, rootfs: &Utf8Path) -> Result<()> {
        self.bind_umount(&rootfs.join(DISTFILES_SUBPATH))
    }

    /// Bind the binary package cache `source` into `rootfs`.
    pub fn bind_binpkgs(&self, source: &Utf8Path, rootfs: &Utf8Path) -> Result<()> {
        self.bind_into(source, rootfs, BINPKGS_SUBPATH)
    }

    /// Undo [`Self::bind_binpkgs`].
    pub fn umount_binpkgs(&self, rootfs: &Utf8Path) -> Result<()> {
        self.bind_umount(&rootfs.join(BINPKGS_SUBPATH))
    }

    /// Run `program` chrooted into `target`, see [`chroot_command`].
    #[context("Running {program} in {target}")]
    pub fn run_in_chroot<I, A>(&self, target: &Utf8Path, program: &str, args: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        self.ensure_not_host_root(target)?;
        self.ops().run(&mut chroot_command(target, program, args))
    }

    /// Fail if anything is mounted at or below `dir`, listing the mounts.
    /// `dir` may be relative or go through symlinks.
    pub fn ensure_no_active_mounts(&self, dir: &Utf8Path) -> Result<()> {
        let mounts = self.table.find_under(dir)?;
        if mounts.is_empty() {
            return Ok(());
        }
        let listing = format_path_list(
            mounts.iter().map(|m| m.mountpoint.as_path()),
            MAX_LISTED_MOUNTS,
        );
        anyhow::bail!(
            "Found {} active mount(s) under {dir}; unmount them first:\n{listing}",
            mounts.len()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use osimg_sysops::fake::{FakeOps, Operation, FAKE_ROOT_IDENTITY};
    use similar_asserts::assert_eq;

    const ROOT: &str = "/var/tmp/rootfs";

    fn paths(v: &[&str]) -> Vec<Utf8PathBuf> {
        v.iter().map(Utf8PathBuf::from).collect()
    }

    #[test]
    fn test_setup_common() {
        let ops = FakeOps::new();
        let o = MountOrchestrator::new(ops.clone());
        let (record, r) = o.setup_common_rootfs_mounts(Utf8Path::new(ROOT));
        r.unwrap();
        let expected = paths(&[
            "/var/tmp/rootfs/dev",
            "/var/tmp/rootfs/dev/pts",
            "/var/tmp/rootfs/dev/shm",
            "/var/tmp/rootfs/proc",
            "/var/tmp/rootfs/sys",
            "/var/tmp/rootfs/run/lock",
        ]);
        assert_eq!(record.clone().into_inner(), expected);
        assert_eq!(ops.mounted(), expected);

        let mounts: Vec<_> = ops
            .operations()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Mount(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(mounts.len(), 9);
        assert_eq!(
            mounts[1],
            MountRequest::Propagation {
                target: "/var/tmp/rootfs/dev".into(),
                propagation: Propagation::Slave,
                recursive: false
            }
        );
        assert_eq!(
            mounts[8],
            MountRequest::Filesystem {
                source: "tmpfs".into(),
                target: "/var/tmp/rootfs/run/lock".into(),
                fstype: "tmpfs".into(),
                flags: MountFlags::NOSUID_NODEV_NOEXEC,
                data: Some("mode=1777,size=5M".into()),
            }
        );

        let report = o.cleanup_mounts(&record);
        assert!(report.is_clean());
        let mut reversed = expected.clone();
        reversed.reverse();
        assert_eq!(report.unmounted, reversed);
        assert!(ops.mounted().is_empty());
    }

    #[test]
    fn test_setup_noncanonical_root() {
        let ops = FakeOps::new();
        ops.add_symlink("/srv/rootfs-link", ROOT);
        let o = MountOrchestrator::new(ops.clone());
        let (record, r) = o.setup_common_rootfs_mounts(Utf8Path::new("/var/tmp/x/../rootfs"));
        r.unwrap();
        assert_eq!(record.iter().next().map(|p| p.as_str()), Some("/var/tmp/rootfs/dev"));
        assert_eq!(ops.mounted(), record.clone().into_inner());
        for spelling in ["var/tmp/rootfs", "/var/tmp/rootfs/../rootfs/", "/srv/rootfs-link"] {
            let e = o.ensure_no_active_mounts(Utf8Path::new(spelling)).unwrap_err();
            assert!(e.to_string().starts_with("Found 6 active mount(s)"), "{spelling}");
        }
        assert!(o.cleanup_mounts(&record).is_clean());
        assert!(ops.mounted().is_empty());

        let (record, r) = o.setup_common_rootfs_mounts(Utf8Path::new("/srv/rootfs-link"));
        r.unwrap();
        assert!(record.iter().all(|p| p.starts_with(ROOT)));
        assert!(o.cleanup_mounts(&record).is_clean());
        assert!(ops.mounted().is_empty());
    }

    #[test]
    fn test_setup_refuses_escaping_target() {
        let ops = FakeOps::new();
        ops.add_symlink("/var/tmp/rootfs/run", "/run");
        let o = MountOrchestrator::new(ops.clone());
        let (record, r) = o.setup_common_rootfs_mounts(Utf8Path::new(ROOT));
        let e = r.unwrap_err();
        assert!(format!("{e:#}").contains("resolves to /run/lock, outside of /var/tmp/rootfs"));
        assert_eq!(record.len(), 5);
        assert!(!ops.mounted().iter().any(|p| p.as_str() == "/run/lock"));
        assert!(o.cleanup_mounts(&record).is_clean());
    }

    #[test]
    fn test_setup_partial() {
        let ops = FakeOps::new();
        ops.fail_mount("/var/tmp/rootfs/proc");
        let o = MountOrchestrator::new(ops.clone());
        let (record, r) = o.setup_common_rootfs_mounts(Utf8Path::new(ROOT));
        let e = r.unwrap_err();
        assert!(format!("{e:#}").contains("Mounting /var/tmp/rootfs/proc"));
        assert_eq!(
            record.clone().into_inner(),
            paths(&[
                "/var/tmp/rootfs/dev",
                "/var/tmp/rootfs/dev/pts",
                "/var/tmp/rootfs/dev/shm",
            ])
        );
        let report = o.cleanup_mounts(&record);
        assert_eq!(report.unmounted.len(), 3);
        assert!(ops.mounted().is_empty());
    }

    #[test]
    fn test_setup_refuses_host_root() {
        let ops = FakeOps::new();
        ops.set_identity("/srv/alias", FAKE_ROOT_IDENTITY);
        let o = MountOrchestrator::new(ops.clone());
        let (record, r) = o.setup_common_rootfs_mounts(Utf8Path::new("/srv/alias"));
        let e = r.unwrap_err();
        let refused = e.downcast_ref::<HostRootRefused>().unwrap();
        assert_eq!(refused.path, "/srv/alias");
        assert!(record.is_empty());
        assert!(!ops
            .operations()
            .iter()
            .any(|op| matches!(op, Operation::Mount(_))));
    }

    #[test]
    fn test_cleanup_reverse_order_continues() {
        let ops = FakeOps::new();
        let mut record = MountRecord::new();
        for p in ["/mnt/a", "/mnt/a/b", "/mnt/a/b/c"] {
            ops.add_mount("tmpfs", p, "tmpfs");
            record.push(p);
        }
        ops.fail_unmount_always("/mnt/a/b");
        let o = MountOrchestrator::new(ops.clone());
        let report = o.cleanup_mounts(&record);
        assert_eq!(
            ops.unmount_calls(),
            vec![
                ("/mnt/a/b/c".into(), UnmountMode::Normal),
                ("/mnt/a/b".into(), UnmountMode::Normal),
                ("/mnt/a/b".into(), UnmountMode::Lazy),
                ("/mnt/a".into(), UnmountMode::Normal),
            ]
        );
        assert_eq!(report.unmounted, paths(&["/mnt/a/b/c", "/mnt/a"]));
        assert_eq!(report.failed, paths(&["/mnt/a/b"]));
        assert!(!report.is_clean());
        assert!(ops
            .operations()
            .contains(&Operation::SyncFs { path: "/mnt/a/b".into() }));
    }

    #[test]
    fn test_cleanup_lazy_fallback() {
        let ops = FakeOps::new();
        let mut record = MountRecord::new();
        ops.add_mount("proc", "/mnt/proc", "proc");
        record.push("/mnt/proc");
        ops.fail_unmount("/mnt/proc");
        let report = MountOrchestrator::new(ops.clone()).cleanup_mounts(&record);
        assert_eq!(report.lazy, paths(&["/mnt/proc"]));
        assert!(report.is_clean());
        assert!(ops.mounted().is_empty());
    }

    #[test]
    fn test_cleanup_skips_unmounted() {
        let ops = FakeOps::new();
        let mut record = MountRecord::new();
        record.push("/mnt/never");
        let report = MountOrchestrator::new(ops.clone()).cleanup_mounts(&record);
        assert_eq!(report.skipped, paths(&["/mnt/never"]));
        assert!(ops.unmount_calls().is_empty());
    }

    #[test]
    fn test_mount_filesystem() {
        let ops = FakeOps::new();
        let o = MountOrchestrator::new(ops.clone());
        let mut record = MountRecord::new();
        o.mount_filesystem(
            "/dev/loop0p2",
            Utf8Path::new("/mnt/image"),
            "btrfs",
            Some("compress=zstd"),
            &mut record,
        )
        .unwrap();
        assert_eq!(record.into_inner(), paths(&["/mnt/image"]));
        assert!(ops.operations().contains(&Operation::CreateDir {
            path: "/mnt/image".into()
        }));
        let e = o
            .mount_filesystem(
                "/dev/loop0p1",
                Utf8Path::new("/"),
                "vfat",
                None,
                &mut MountRecord::new(),
            )
            .unwrap_err();
        assert!(e.downcast_ref::<HostRootRefused>().is_some());
    }

    #[test]
    fn test_bind_caches() {
        let ops = FakeOps::new();
        let o = MountOrchestrator::new(ops.clone());
        let rootfs = Utf8Path::new(ROOT);
        o.bind_distfiles(Utf8Path::new("/srv/distfiles"), rootfs)
            .unwrap();
        o.bind_binpkgs(Utf8Path::new("/srv/binpkgs"), rootfs).unwrap();
        assert_eq!(
            ops.mounted(),
            paths(&[
                "/var/tmp/rootfs/var/cache/distfiles",
                "/var/tmp/rootfs/var/cache/binpkgs",
            ])
        );
        o.umount_binpkgs(rootfs).unwrap();
        o.umount_distfiles(rootfs).unwrap();
        assert!(ops.mounted().is_empty());
        // Unmounting again is fine
        o.umount_distfiles(rootfs).unwrap();
        assert_eq!(ops.unmount_calls().len(), 2);
    }

    #[test]
    fn test_bind_caches_noncanonical() {
        let ops = FakeOps::new();
        ops.add_symlink("/srv/rootfs-link", ROOT);
        let o = MountOrchestrator::new(ops.clone());
        o.bind_distfiles(Utf8Path::new("/srv/distfiles"), Utf8Path::new("/srv/rootfs-link"))
            .unwrap();
        assert_eq!(ops.mounted(), paths(&["/var/tmp/rootfs/var/cache/distfiles"]));
        o.umount_distfiles(Utf8Path::new("/var/tmp/../tmp/rootfs")).unwrap();
        assert!(ops.mounted().is_empty());

        ops.add_symlink("/var/tmp/rootfs/var/cache", "/var/cache");
        let e = o
            .bind_distfiles(Utf8Path::new("/srv/distfiles"), Utf8Path::new(ROOT))
            .unwrap_err();
        assert!(format!("{e:#}").contains("outside of /var/tmp/rootfs"));
        assert!(ops.mounted().is_empty());
    }

    #[test]
    fn test_chroot_command() {
        let cmd = chroot_command(Utf8Path::new("/mnt/root"), "emerge", ["--sync"]);
        assert_eq!(cmd.get_program(), "unshare");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            [
                "--mount",
                "--pid",
                "--uts",
                "--ipc",
                "--fork",
                "--mount-proc=/mnt/root/proc",
                "chroot",
                "/mnt/root",
                "emerge",
                "--sync"
            ]
        );
    }

    #[test]
    fn test_run_in_chroot() {
        let ops = FakeOps::new();
        let o = MountOrchestrator::new(ops.clone());
        o.run_in_chroot(Utf8Path::new(ROOT), "true", std::iter::empty::<&str>())
            .unwrap();
        let Some(Operation::Run { program, args }) = ops.operations().pop() else {
            panic!("expected a run");
        };
        assert_eq!(program, "unshare");
        assert_eq!(args.last().map(String::as_str), Some("true"));
        ops.fail_run();
        assert!(o
            .run_in_chroot(Utf8Path::new(ROOT), "false", std::iter::empty::<&str>())
            .is_err());
    }

    #[test]
    fn test_ensure_no_active_mounts() {
        let ops = FakeOps::new();
        let o = MountOrchestrator::new(ops.clone());
        o.ensure_no_active_mounts(Utf8Path::new(ROOT)).unwrap();
        ops.add_mount("proc", "/var/tmp/rootfs/proc", "proc");
        ops.add_mount("tmpfs", "/var/tmp/rootfs/my dir", "tmpfs");
        ops.add_mount("tmpfs", "/var/tmp/rootfs2", "tmpfs");
        let e = o.ensure_no_active_mounts(Utf8Path::new(ROOT)).unwrap_err();
        assert_eq!(
            e.to_string(),
            "Found 2 active mount(s) under /var/tmp/rootfs; unmount them first:\n  /var/tmp/rootfs/proc\n  '/var/tmp/rootfs/my dir'\n"
        );
    }

    #[test]
    fn test_ensure_no_active_mounts_host() {
        let o = MountOrchestrator::host();
        if !o.table().is_mountpoint(Utf8Path::new("/proc")).unwrap_or(false) {
            return;
        }
        assert!(o.ensure_no_active_mounts(Utf8Path::new("/proc")).is_err());
        assert!(o.ensure_no_active_mounts(Utf8Path::new("/proc/../proc")).is_err());
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        o.ensure_no_active_mounts(dir).unwrap();
        o.ensure_no_active_mounts(&dir.join("missing")).unwrap();
    }
}
