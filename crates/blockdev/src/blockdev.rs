//! Loop device lifecycle.
//!
//! A [`LoopDevice`] attaches a disk image to a free `/dev/loopN` using the
//! loop ioctls directly (no `losetup`), and detaches it again.

use std::fmt;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use osimg_sysops::loop_flags::LO_FLAGS_PARTSCAN;
use osimg_sysops::{HostOps, OpenMode, SystemOps};

/// The loop control device.
pub const LOOP_CONTROL: &str = "/dev/loop-control";

const SYS_BLOCK: &str = "/sys/block";

/// The step of attaching or detaching that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStep {
    /// Opening loop-control or `LOOP_CTL_GET_FREE`.
    GetFree,
    /// Opening the backing image.
    OpenImage,
    /// Opening the allocated `/dev/loopN`.
    OpenDevice,
    /// `LOOP_SET_FD`
    SetFd,
    /// `LOOP_SET_STATUS64`
    SetStatus,
    /// Opening the device in order to detach it.
    OpenForDetach,
    /// `LOOP_CLR_FD`
    ClearFd,
}

impl fmt::Display for LoopStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopStep::GetFree => "allocating free loop device",
            LoopStep::OpenImage => "opening backing image",
            LoopStep::OpenDevice => "opening loop device",
            LoopStep::SetFd => "setting backing file",
            LoopStep::SetStatus => "setting partition scan flag",
            LoopStep::OpenForDetach => "opening loop device for detach",
            LoopStep::ClearFd => "clearing backing file",
        };
        f.write_str(s)
    }
}

/// Errors from [`LoopDevice`] operations.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// Attach was called on an attached device.
    #[error("loop device is already attached")]
    AlreadyAttached,
    /// Detach (or a device query) was called on a detached device.
    #[error("loop device is not attached")]
    NotAttached,
    /// Attach was called without a backing image.
    #[error("no backing image path")]
    MissingImagePath,
    /// A kernel call failed.
    #[error("{op} {path}: {source}")]
    Os {
        /// Failing step.
        op: LoopStep,
        /// The path the step operated on.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

fn os_err(op: LoopStep, path: &Utf8Path) -> impl FnOnce(io::Error) -> LoopError + '_ {
    move |source| LoopError::Os {
        op,
        path: path.to_owned(),
        source,
    }
}

/// Whether a [`LoopDevice`] is currently associated with a kernel device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    /// Not attached.
    Detached {
        /// Image to attach, if known.
        image: Option<Utf8PathBuf>,
    },
    /// Attached to `device`.
    Attached {
        /// The `/dev/loopN` path.
        device: Utf8PathBuf,
        /// The backing image, if this handle attached it.
        image: Option<Utf8PathBuf>,
    },
}

/// A loop device and the image backing it.
#[derive(Debug)]
pub struct LoopDevice<S: SystemOps = HostOps> {
    ops: S,
    state: Mutex<LoopState>,
}

impl LoopDevice<HostOps> {
    /// A not yet attached device for `image`.
    pub fn new(image: impl Into<Utf8PathBuf>) -> Self {
        Self::for_image(HostOps, image)
    }

    /// A handle on an already attached `device`.
    pub fn existing(device: impl Into<Utf8PathBuf>) -> Self {
        Self::from_device(HostOps, device)
    }
}

fn sysfs_backing_file(device: &Utf8Path) -> Option<Utf8PathBuf> {
    let name = device.file_name()?;
    Some(Utf8PathBuf::from(format!(
        "{SYS_BLOCK}/{name}/loop/backing_file"
    )))
}

/// Read the backing file of `device` from sysfs; empty when unknown.
fn read_backing_file<S: SystemOps>(ops: &S, device: &Utf8Path) -> String {
    let Some(attr) = sysfs_backing_file(device) else {
        return String::new();
    };
    match ops.read_to_string(&attr) {
        Ok(s) => s.trim().to_owned(),
        Err(e) => {
            tracing::debug!("Reading {attr}: {e}");
            String::new()
        }
    }
}

impl<S: SystemOps> LoopDevice<S> {
    /// A not yet attached device for `image`.
    pub fn for_image(ops: S, image: impl Into<Utf8PathBuf>) -> Self {
        Self {
            ops,
            state: Mutex::new(LoopState::Detached {
                image: Some(image.into()),
            }),
        }
    }

    /// A handle on an already attached `device`, for inspection or detach.
    pub fn from_device(ops: S, device: impl Into<Utf8PathBuf>) -> Self {
        Self {
            ops,
            state: Mutex::new(LoopState::Attached {
                device: device.into(),
                image: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> LoopState {
        self.lock().clone()
    }

    /// Whether a kernel device is associated.
    pub fn is_attached(&self) -> bool {
        matches!(*self.lock(), LoopState::Attached { .. })
    }

    /// The `/dev/loopN` path when attached.
    pub fn device_path(&self) -> Option<Utf8PathBuf> {
        match &*self.lock() {
            LoopState::Attached { device, .. } => Some(device.clone()),
            LoopState::Detached { .. } => None,
        }
    }

    /// The backing image, if known.
    pub fn image_path(&self) -> Option<Utf8PathBuf> {
        match &*self.lock() {
            LoopState::Attached { image, .. } | LoopState::Detached { image } => image.clone(),
        }
    }

    /// Attach the image to a free loop device with partition scanning
    /// enabled, returning the device path.
    pub fn attach(&self) -> Result<Utf8PathBuf, LoopError> {
        let mut state = self.lock();
        let image = match &*state {
            LoopState::Attached { .. } => return Err(LoopError::AlreadyAttached),
            LoopState::Detached { image: None } => return Err(LoopError::MissingImagePath),
            LoopState::Detached { image: Some(image) } => image.clone(),
        };
        let ops = &self.ops;

        let control_path = Utf8Path::new(LOOP_CONTROL);
        let control = ops
            .open(control_path, OpenMode::ReadWrite)
            .map_err(os_err(LoopStep::GetFree, control_path))?;
        let minor = ops
            .loop_ctl_get_free(&control)
            .map_err(os_err(LoopStep::GetFree, control_path))?;
        drop(control);
        let device = Utf8PathBuf::from(format!("/dev/loop{minor}"));
        tracing::debug!("Allocated {device}");

        let backing = ops
            .open(&image, OpenMode::ReadWrite)
            .map_err(os_err(LoopStep::OpenImage, &image))?;
        let dev = ops
            .open(&device, OpenMode::ReadWrite)
            .map_err(os_err(LoopStep::OpenDevice, &device))?;
        ops.loop_set_fd(&dev, &backing)
            .map_err(os_err(LoopStep::SetFd, &device))?;
        tracing::debug!("Associated {image} with {device}");

        if let Err(e) = ops.loop_set_status_flags(&dev, LO_FLAGS_PARTSCAN) {
            // Don't leave a half-configured device behind
            if let Err(clear_err) = ops.loop_clr_fd(&dev) {
                tracing::warn!("Failed to clear {device} after status failure: {clear_err}");
            }
            return Err(os_err(LoopStep::SetStatus, &device)(e));
        }

        tracing::info!("Attached {image} to {device}");
        *state = LoopState::Attached {
            device: device.clone(),
            image: Some(image),
        };
        Ok(device)
    }

    /// Clear the backing file association.
    ///
    /// Detaching a detached device is an error.
    pub fn detach(&self) -> Result<(), LoopError> {
        let mut state = self.lock();
        let LoopState::Attached { device, image } = &*state else {
            return Err(LoopError::NotAttached);
        };
        let dev = self
            .ops
            .open(device, OpenMode::ReadOnly)
            .map_err(os_err(LoopStep::OpenForDetach, device))?;
        self.ops
            .loop_clr_fd(&dev)
            .map_err(os_err(LoopStep::ClearFd, device))?;
        tracing::info!("Detached {device}");
        let image = image.clone();
        *state = LoopState::Detached { image };
        Ok(())
    }

    /// The kernel-reported backing file, or an empty string when detached
    /// or when the kernel has nothing to report.
    pub fn backing_file(&self) -> String {
        match self.device_path() {
            Some(device) => read_backing_file(&self.ops, &device),
            None => String::new(),
        }
    }

    /// The node for partition `n` of the attached device, e.g. `/dev/loop0p1`.
    pub fn partition_path(&self, n: u32) -> Result<Utf8PathBuf, LoopError> {
        let device = self.device_path().ok_or(LoopError::NotAttached)?;
        Ok(Utf8PathBuf::from(format!("{device}p{n}")))
    }
}

impl<S: SystemOps + Clone> LoopDevice<S> {
    /// Find a loop device already backed by `image`.
    ///
    /// `image` is compared against what the kernel reports, which is an
    /// absolute path. An empty `image` is rejected, since unbacked devices
    /// report an empty backing file.
    #[context("Scanning loop devices for {image}")]
    pub fn find_by_backing_file(ops: &S, image: &Utf8Path) -> Result<Option<Self>> {
        anyhow::ensure!(!image.as_str().is_empty(), "No image path given");
        let mut names = ops.read_dir_names(Utf8Path::new(SYS_BLOCK))?;
        names.retain(|n| n.starts_with("loop"));
        names.sort();
        for name in names {
            let device = Utf8PathBuf::from(format!("/dev/{name}"));
            if read_backing_file(ops, &device) == image.as_str() {
                tracing::debug!("Found {image} on {device}");
                return Ok(Some(Self {
                    ops: ops.clone(),
                    state: Mutex::new(LoopState::Attached {
                        device,
                        image: Some(image.to_owned()),
                    }),
                }));
            }
        }
        Ok(None)
    }
}
