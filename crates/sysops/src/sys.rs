//! Raw loop ioctls and mount(2).

#![allow(unsafe_code)]

use std::ffi::{c_void, CString};
use std::io;
use std::os::fd::{AsFd, AsRawFd};

use rustix::ioctl::{ioctl, opcode, Ioctl, IoctlOutput, Opcode, Setter};

use crate::{MountFlags, MountRequest, Propagation};

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

const LOOP_SET_FD: Opcode = opcode::none(0x4C, 0x00);
const LOOP_CLR_FD: Opcode = opcode::none(0x4C, 0x01);
const LOOP_SET_STATUS64: Opcode = opcode::none(0x4C, 0x04);
const LOOP_CTL_GET_FREE: Opcode = opcode::none(0x4C, 0x82);

// Only ever handed to the kernel
#[allow(dead_code)]
#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn with_flags(lo_flags: u32) -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

/// An ioctl whose argument is passed by value and whose result is the
/// syscall return value. Rustix seems to lack a built-in pattern for
/// this, so bake our own.
struct ByValue<const OPCODE: Opcode> {
    arg: usize,
}

unsafe impl<const OPCODE: Opcode> Ioctl for ByValue<OPCODE> {
    type Output = std::ffi::c_int;

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> Opcode {
        OPCODE
    }

    fn as_ptr(&mut self) -> *mut c_void {
        self.arg as *mut c_void
    }

    unsafe fn output_from_ptr(
        out: IoctlOutput,
        _ptr: *mut c_void,
    ) -> rustix::io::Result<std::ffi::c_int> {
        Ok(out)
    }
}

pub(crate) fn loop_ctl_get_free(control: impl AsFd) -> io::Result<u32> {
    let free = unsafe { ioctl(control, ByValue::<LOOP_CTL_GET_FREE> { arg: 0 }) }?;
    u32::try_from(free).map_err(|_| io::Error::other("no free loop device"))
}

pub(crate) fn loop_set_fd(dev: impl AsFd, backing: impl AsFd) -> io::Result<()> {
    let arg = backing.as_fd().as_raw_fd() as usize;
    unsafe { ioctl(dev, ByValue::<LOOP_SET_FD> { arg }) }?;
    Ok(())
}

pub(crate) fn loop_clr_fd(dev: impl AsFd) -> io::Result<()> {
    unsafe { ioctl(dev, ByValue::<LOOP_CLR_FD> { arg: 0 }) }?;
    Ok(())
}

pub(crate) fn loop_set_status_flags(dev: impl AsFd, lo_flags: u32) -> io::Result<()> {
    let info = LoopInfo64::with_flags(lo_flags);
    unsafe {
        ioctl(
            dev,
            Setter::<{ LOOP_SET_STATUS64 }, LoopInfo64>::new(info),
        )?;
    }
    Ok(())
}

fn fs_flags(flags: &MountFlags) -> libc::c_ulong {
    let mut r = 0;
    if flags.nosuid {
        r |= libc::MS_NOSUID;
    }
    if flags.nodev {
        r |= libc::MS_NODEV;
    }
    if flags.noexec {
        r |= libc::MS_NOEXEC;
    }
    r
}

fn rec(recursive: bool) -> libc::c_ulong {
    if recursive {
        libc::MS_REC
    } else {
        0
    }
}

fn cstr(s: &str) -> io::Result<CString> {
    Ok(CString::new(s)?)
}

pub(crate) fn mount(req: &MountRequest) -> io::Result<()> {
    let (source, fstype, flags, data) = match req {
        MountRequest::Bind {
            source, recursive, ..
        } => (
            Some(cstr(source.as_str())?),
            None,
            libc::MS_BIND | rec(*recursive),
            None,
        ),
        MountRequest::Propagation {
            propagation,
            recursive,
            ..
        } => {
            let p = match propagation {
                Propagation::Slave => libc::MS_SLAVE,
                Propagation::Private => libc::MS_PRIVATE,
                Propagation::Shared => libc::MS_SHARED,
            };
            (None, None, p | rec(*recursive), None)
        }
        MountRequest::Filesystem {
            source,
            fstype,
            flags,
            data,
            ..
        } => (
            Some(cstr(source)?),
            Some(cstr(fstype)?),
            fs_flags(flags),
            data.as_deref().map(cstr).transpose()?,
        ),
    };
    let target = cstr(req.target().as_str())?;
    let r = unsafe {
        libc::mount(
            source.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            target.as_ptr(),
            fstype.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            data.as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr() as *const c_void),
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
