//! In-memory [`SystemOps`] implementation for testing.
//!
//! This implementation records all operations without executing them,
//! allowing for CI-safe testing without root privileges or real devices.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use rustix::io::Errno;

use crate::{
    FileIdentity, MountRequest, OpenMode, SystemOps, UnmountMode, MOUNTINFO_PATH,
};

/// Identity handed out for `/`.
pub const FAKE_ROOT_IDENTITY: FileIdentity = FileIdentity { dev: 1, ino: 2 };

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A path was opened.
    Open {
        /// The path.
        path: Utf8PathBuf,
        /// The mode.
        mode: OpenMode,
    },
    /// A free loop minor was requested.
    LoopGetFree {
        /// The minor handed out.
        minor: u32,
    },
    /// A backing file was associated.
    LoopSetFd {
        /// Loop device node.
        device: Utf8PathBuf,
        /// Backing file.
        backing: Utf8PathBuf,
    },
    /// Status flags were set.
    LoopSetStatus {
        /// Loop device node.
        device: Utf8PathBuf,
        /// `lo_flags`
        flags: u32,
    },
    /// The backing file association was cleared.
    LoopClearFd {
        /// Loop device node.
        device: Utf8PathBuf,
    },
    /// A directory tree was created.
    CreateDir {
        /// The path.
        path: Utf8PathBuf,
    },
    /// A mount request.
    Mount(MountRequest),
    /// An unmount.
    Unmount {
        /// Mountpoint.
        target: Utf8PathBuf,
        /// Mode.
        mode: UnmountMode,
    },
    /// A filesystem flush.
    SyncFs {
        /// Path on the filesystem.
        path: Utf8PathBuf,
    },
    /// A command was executed.
    Run {
        /// Program name.
        program: String,
        /// Arguments.
        args: Vec<String>,
    },
}

/// A handle returned by [`FakeOps::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFile {
    /// The opened path.
    pub path: Utf8PathBuf,
    /// The mode it was opened with.
    pub mode: OpenMode,
}

#[derive(Debug, Clone)]
struct FakeMount {
    source: String,
    target: Utf8PathBuf,
    fstype: String,
}

#[derive(Debug, Default)]
struct FakeState {
    operations: Vec<Operation>,
    mounts: Vec<FakeMount>,
    files: HashMap<Utf8PathBuf, String>,
    identities: HashMap<Utf8PathBuf, FileIdentity>,
    symlinks: HashMap<Utf8PathBuf, Utf8PathBuf>,
    next_ino: u64,
    next_minor: u32,
    fail_set_status: usize,
    fail_open: HashSet<Utf8PathBuf>,
    fail_mount: HashSet<Utf8PathBuf>,
    fail_unmount: HashSet<Utf8PathBuf>,
    fail_lazy_unmount: HashSet<Utf8PathBuf>,
    fail_run: bool,
}

impl FakeState {
    fn record(&mut self, op: Operation) {
        self.operations.push(op);
    }

    /// Render the tracked mounts in mountinfo format, with a root entry first.
    fn render_mountinfo(&self) -> String {
        let mut out = String::from("1 0 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n");
        for (i, m) in self.mounts.iter().enumerate() {
            let id = i + 2;
            let _ = writeln!(
                out,
                "{id} 1 0:{id} / {} rw,relatime - {} {} rw",
                escape_mount_path(m.target.as_str()),
                m.fstype,
                m.source
            );
        }
        out
    }
}

/// Upper bound on symlink hops, as with `MAXSYMLINKS`.
const MAX_SYMLINK_HOPS: usize = 40;

fn push_components(stack: &mut Vec<String>, path: &Utf8Path) {
    for c in path.components().rev() {
        match c {
            Utf8Component::Normal(n) => stack.push(n.to_owned()),
            Utf8Component::ParentDir => stack.push("..".to_owned()),
            Utf8Component::CurDir | Utf8Component::RootDir | Utf8Component::Prefix(_) => {}
        }
    }
}

impl FakeState {
    /// Resolve `path` against the fake symlink table. Relative paths are
    /// taken relative to `/`; nothing is required to exist.
    fn resolve(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        let mut out = Utf8PathBuf::from("/");
        let mut pending = Vec::new();
        push_components(&mut pending, path);
        let mut hops = 0;
        while let Some(name) = pending.pop() {
            if name == ".." {
                out.pop();
                continue;
            }
            let next = out.join(&name);
            let Some(target) = self.symlinks.get(&next) else {
                out = next;
                continue;
            };
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(Errno::LOOP.into());
            }
            if target.is_absolute() {
                out = Utf8PathBuf::from("/");
            }
            push_components(&mut pending, target);
        }
        Ok(out)
    }
}

fn escape_mount_path(p: &str) -> String {
    let mut r = String::with_capacity(p.len());
    for c in p.chars() {
        match c {
            ' ' => r.push_str("\\040"),
            '\t' => r.push_str("\\011"),
            '\n' => r.push_str("\\012"),
            '\\' => r.push_str("\\134"),
            c => r.push(c),
        }
    }
    r
}

fn loop_name(device: &Utf8Path) -> &str {
    device.file_name().unwrap_or_default()
}

fn backing_file_attr(device: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("/sys/block/{}/loop/backing_file", loop_name(device)))
}

/// Fake [`SystemOps`] that records operations without executing them.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeOps {
    state: Arc<Mutex<FakeState>>,
}

impl FakeOps {
    /// Create a new fake with no mounts beyond `/`.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        // A panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.clone()
    }

    /// Targets of all unmount calls, in call order.
    pub fn unmount_calls(&self) -> Vec<(Utf8PathBuf, UnmountMode)> {
        self.state()
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Unmount { target, mode } => Some((target.clone(), *mode)),
                _ => None,
            })
            .collect()
    }

    /// Currently mounted targets, oldest first.
    pub fn mounted(&self) -> Vec<Utf8PathBuf> {
        self.state().mounts.iter().map(|m| m.target.clone()).collect()
    }

    /// Pretend something is already mounted.
    pub fn add_mount(&self, source: &str, target: impl Into<Utf8PathBuf>, fstype: &str) {
        self.state().mounts.push(FakeMount {
            source: source.to_owned(),
            target: target.into(),
            fstype: fstype.to_owned(),
        });
    }

    /// Serve `contents` for reads of `path`.
    pub fn set_file(&self, path: impl Into<Utf8PathBuf>, contents: impl Into<String>) {
        self.state().files.insert(path.into(), contents.into());
    }

    /// Use a fixed identity for `path`.
    pub fn set_identity(&self, path: impl Into<Utf8PathBuf>, id: FileIdentity) {
        self.state().identities.insert(path.into(), id);
    }

    /// Make `link` a symlink to `target` for [`SystemOps::canonicalize`].
    /// A relative `target` is taken relative to the link's directory.
    pub fn add_symlink(&self, link: impl Into<Utf8PathBuf>, target: impl Into<Utf8PathBuf>) {
        self.state().symlinks.insert(link.into(), target.into());
    }

    /// The lowest minor `LOOP_CTL_GET_FREE` considers; minors with a
    /// backing file are skipped.
    pub fn set_next_loop_minor(&self, minor: u32) {
        self.state().next_minor = minor;
    }

    /// Fail the next `n` status updates.
    pub fn fail_next_set_status(&self, n: usize) {
        self.state().fail_set_status = n;
    }

    /// Fail opening `path`.
    pub fn fail_open(&self, path: impl Into<Utf8PathBuf>) {
        self.state().fail_open.insert(path.into());
    }

    /// Fail mount requests targeting `target`.
    pub fn fail_mount(&self, target: impl Into<Utf8PathBuf>) {
        self.state().fail_mount.insert(target.into());
    }

    /// Fail normal unmounts of `target` with `EBUSY`; lazy unmounts still work.
    pub fn fail_unmount(&self, target: impl Into<Utf8PathBuf>) {
        self.state().fail_unmount.insert(target.into());
    }

    /// Fail both normal and lazy unmounts of `target`.
    pub fn fail_unmount_always(&self, target: impl Into<Utf8PathBuf>) {
        let target = target.into();
        let mut st = self.state();
        st.fail_unmount.insert(target.clone());
        st.fail_lazy_unmount.insert(target);
    }

    /// Make every executed command fail.
    pub fn fail_run(&self) {
        self.state().fail_run = true;
    }
}

impl SystemOps for FakeOps {
    type File = FakeFile;

    fn open(&self, path: &Utf8Path, mode: OpenMode) -> io::Result<FakeFile> {
        let mut st = self.state();
        st.record(Operation::Open {
            path: path.to_owned(),
            mode,
        });
        if st.fail_open.contains(path) {
            return Err(Errno::NOENT.into());
        }
        Ok(FakeFile {
            path: path.to_owned(),
            mode,
        })
    }

    fn loop_ctl_get_free(&self, _control: &FakeFile) -> io::Result<u32> {
        let mut st = self.state();
        let mut minor = st.next_minor;
        while st.files.contains_key(&backing_file_attr(Utf8Path::new(&format!("loop{minor}")))) {
            minor += 1;
        }
        st.record(Operation::LoopGetFree { minor });
        Ok(minor)
    }

    fn loop_set_fd(&self, dev: &FakeFile, backing: &FakeFile) -> io::Result<()> {
        let mut st = self.state();
        st.record(Operation::LoopSetFd {
            device: dev.path.clone(),
            backing: backing.path.clone(),
        });
        let attr = backing_file_attr(&dev.path);
        if st.files.contains_key(&attr) {
            return Err(Errno::BUSY.into());
        }
        st.files.insert(attr, format!("{}\n", backing.path));
        Ok(())
    }

    fn loop_set_status_flags(&self, dev: &FakeFile, flags: u32) -> io::Result<()> {
        let mut st = self.state();
        st.record(Operation::LoopSetStatus {
            device: dev.path.clone(),
            flags,
        });
        if st.fail_set_status > 0 {
            st.fail_set_status -= 1;
            return Err(Errno::INVAL.into());
        }
        Ok(())
    }

    fn loop_clr_fd(&self, dev: &FakeFile) -> io::Result<()> {
        let mut st = self.state();
        st.record(Operation::LoopClearFd {
            device: dev.path.clone(),
        });
        match st.files.remove(&backing_file_attr(&dev.path)) {
            Some(_) => Ok(()),
            None => Err(Errno::NXIO.into()),
        }
    }

    fn read_to_string(&self, path: &Utf8Path) -> io::Result<String> {
        let st = self.state();
        if let Some(c) = st.files.get(path) {
            return Ok(c.clone());
        }
        if path.as_str() == MOUNTINFO_PATH {
            return Ok(st.render_mountinfo());
        }
        Err(Errno::NOENT.into())
    }

    fn read_dir_names(&self, path: &Utf8Path) -> io::Result<Vec<String>> {
        let st = self.state();
        let mut names: Vec<String> = st
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(path).ok())
            .filter_map(|rel| rel.components().next())
            .map(|c| c.as_str().to_owned())
            .collect();
        if names.is_empty() {
            return Err(Errno::NOENT.into());
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()> {
        self.state().record(Operation::CreateDir {
            path: path.to_owned(),
        });
        Ok(())
    }

    fn mount(&self, req: &MountRequest) -> io::Result<()> {
        let mut st = self.state();
        st.record(Operation::Mount(req.clone()));
        if st.fail_mount.contains(req.target()) {
            return Err(Errno::PERM.into());
        }
        let m = match req {
            MountRequest::Bind { source, target, .. } => FakeMount {
                source: source.to_string(),
                target: target.clone(),
                fstype: "none".into(),
            },
            MountRequest::Filesystem {
                source,
                target,
                fstype,
                ..
            } => FakeMount {
                source: source.clone(),
                target: target.clone(),
                fstype: fstype.clone(),
            },
            MountRequest::Propagation { target, .. } => {
                if !st.mounts.iter().any(|m| m.target == *target) {
                    return Err(Errno::INVAL.into());
                }
                return Ok(());
            }
        };
        st.mounts.push(m);
        Ok(())
    }

    fn unmount(&self, target: &Utf8Path, mode: UnmountMode) -> io::Result<()> {
        let mut st = self.state();
        st.record(Operation::Unmount {
            target: target.to_owned(),
            mode,
        });
        let failing = match mode {
            UnmountMode::Normal => &st.fail_unmount,
            UnmountMode::Lazy => &st.fail_lazy_unmount,
        };
        if failing.contains(target) {
            return Err(Errno::BUSY.into());
        }
        let Some(idx) = st.mounts.iter().rposition(|m| m.target.as_path() == target) else {
            return Err(Errno::INVAL.into());
        };
        st.mounts.remove(idx);
        Ok(())
    }

    fn sync_filesystem(&self, path: &Utf8Path) -> io::Result<()> {
        self.state().record(Operation::SyncFs {
            path: path.to_owned(),
        });
        Ok(())
    }

    fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        self.state().resolve(path)
    }

    fn identity(&self, path: &Utf8Path) -> io::Result<FileIdentity> {
        let mut st = self.state();
        if path.as_str() == "/" {
            return Ok(FAKE_ROOT_IDENTITY);
        }
        if let Some(id) = st.identities.get(path) {
            return Ok(*id);
        }
        st.next_ino += 1;
        let id = FileIdentity {
            dev: FAKE_ROOT_IDENTITY.dev + 1,
            ino: st.next_ino,
        };
        st.identities.insert(path.to_owned(), id);
        Ok(id)
    }

    fn run(&self, cmd: &mut Command) -> anyhow::Result<()> {
        let mut st = self.state();
        let program = cmd.get_program().to_string_lossy().into_owned();
        st.record(Operation::Run {
            program: program.clone(),
            args: cmd
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
        });
        if st.fail_run {
            anyhow::bail!("{program} failed: exit status: 1");
        }
        Ok(())
    }
}
