//! # Kernel-facing operations
//!
//! Everything in osimg that opens device nodes, issues loop ioctls,
//! mounts, unmounts or execs goes through the [`SystemOps`] trait.
//! [`HostOps`] talks to the running kernel; [`fake::FakeOps`] records
//! calls in memory so callers can be tested without root.
//!
//! All unsafe code lives in the private `sys` module of this crate.

use std::fmt::Debug;
use std::io;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};

pub mod fake;
mod host;
mod sys;

pub use host::HostOps;

/// The live mount table of the calling process.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Flags for `lo_flags` in the loop status block.
pub mod loop_flags {
    /// Read-only loop device.
    pub const LO_FLAGS_READ_ONLY: u32 = 1;
    /// Automatically detach on last close.
    pub const LO_FLAGS_AUTOCLEAR: u32 = 4;
    /// Scan the backing file for partitions.
    pub const LO_FLAGS_PARTSCAN: u32 = 8;
}

/// How a path should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `O_RDONLY`
    ReadOnly,
    /// `O_RDWR`
    ReadWrite,
}

/// Identity of a filesystem object: device and inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// `st_dev`
    pub dev: u64,
    /// `st_ino`
    pub ino: u64,
}

/// Mount propagation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Events propagate in from the master, but not back out.
    Slave,
    /// No propagation in either direction.
    Private,
    /// Events propagate in both directions.
    Shared,
}

/// The subset of `MS_*` flags we pass for filesystem mounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountFlags {
    /// `MS_NOSUID`
    pub nosuid: bool,
    /// `MS_NODEV`
    pub nodev: bool,
    /// `MS_NOEXEC`
    pub noexec: bool,
}

impl MountFlags {
    /// nosuid,nodev
    pub const NOSUID_NODEV: Self = Self {
        nosuid: true,
        nodev: true,
        noexec: false,
    };
    /// nosuid,nodev,noexec
    pub const NOSUID_NODEV_NOEXEC: Self = Self {
        nosuid: true,
        nodev: true,
        noexec: true,
    };
}

/// A single mount(2) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountRequest {
    /// Expose `source` at `target`.
    Bind {
        /// Existing directory.
        source: Utf8PathBuf,
        /// Mountpoint.
        target: Utf8PathBuf,
        /// Also bind submounts (`MS_REC`).
        recursive: bool,
    },
    /// Change the propagation type of an existing mount.
    Propagation {
        /// Mountpoint.
        target: Utf8PathBuf,
        /// New propagation type.
        propagation: Propagation,
        /// Apply to submounts too (`MS_REC`).
        recursive: bool,
    },
    /// Mount a filesystem of the given type.
    Filesystem {
        /// Device path or a pseudo source name such as `tmpfs`.
        source: String,
        /// Mountpoint.
        target: Utf8PathBuf,
        /// Filesystem type.
        fstype: String,
        /// Generic mount flags.
        flags: MountFlags,
        /// Filesystem-specific options, e.g. `mode=1777,size=5M`.
        data: Option<String>,
    },
}

impl MountRequest {
    /// The mountpoint this request operates on.
    pub fn target(&self) -> &Utf8Path {
        match self {
            MountRequest::Bind { target, .. }
            | MountRequest::Propagation { target, .. }
            | MountRequest::Filesystem { target, .. } => target,
        }
    }
}

/// How to unmount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    /// Plain umount(2); fails if busy.
    Normal,
    /// `MNT_DETACH`: detach now, clean up when no longer busy.
    Lazy,
}

/// The capability bundle for kernel-facing operations.
///
/// Components take an implementation of this at construction time rather
/// than calling the kernel directly.
pub trait SystemOps: Send + Sync {
    /// An open file or device handle.
    type File: Debug + Send;

    /// Open a path.
    fn open(&self, path: &Utf8Path, mode: OpenMode) -> io::Result<Self::File>;

    /// `LOOP_CTL_GET_FREE` on an open `/dev/loop-control`; returns the minor number.
    fn loop_ctl_get_free(&self, control: &Self::File) -> io::Result<u32>;

    /// `LOOP_SET_FD`: associate `backing` with the loop device `dev`.
    fn loop_set_fd(&self, dev: &Self::File, backing: &Self::File) -> io::Result<()>;

    /// `LOOP_SET_STATUS64` with the given `lo_flags`.
    fn loop_set_status_flags(&self, dev: &Self::File, flags: u32) -> io::Result<()>;

    /// `LOOP_CLR_FD`: drop the backing file association.
    fn loop_clr_fd(&self, dev: &Self::File) -> io::Result<()>;

    /// Read a whole (usually pseudo-) file.
    fn read_to_string(&self, path: &Utf8Path) -> io::Result<String>;

    /// Names of the entries in a directory, in no particular order.
    fn read_dir_names(&self, path: &Utf8Path) -> io::Result<Vec<String>>;

    /// `mkdir -p`
    fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()>;

    /// Perform a mount request.
    fn mount(&self, req: &MountRequest) -> io::Result<()>;

    /// Unmount a target.
    fn unmount(&self, target: &Utf8Path, mode: UnmountMode) -> io::Result<()>;

    /// Flush the filesystem containing `path` (syncfs(2)).
    fn sync_filesystem(&self, path: &Utf8Path) -> io::Result<()>;

    /// The absolute path of `path` with symlinks and `.`/`..` resolved.
    /// Fails if the path does not exist.
    fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf>;

    /// Device and inode of `path`, following symlinks.
    fn identity(&self, path: &Utf8Path) -> io::Result<FileIdentity>;

    /// Execute a command to completion; a non-zero exit is an error.
    fn run(&self, cmd: &mut Command) -> anyhow::Result<()>;
}
