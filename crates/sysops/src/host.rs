use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use osimg_utils::CommandRunExt;
use rustix::mount::UnmountFlags;

use crate::{sys, FileIdentity, MountRequest, OpenMode, SystemOps, UnmountMode};

/// [`SystemOps`] backed by the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostOps;

impl SystemOps for HostOps {
    type File = File;

    fn open(&self, path: &Utf8Path, mode: OpenMode) -> io::Result<File> {
        let write = mode == OpenMode::ReadWrite;
        OpenOptions::new().read(true).write(write).open(path)
    }

    fn loop_ctl_get_free(&self, control: &File) -> io::Result<u32> {
        sys::loop_ctl_get_free(control)
    }

    fn loop_set_fd(&self, dev: &File, backing: &File) -> io::Result<()> {
        sys::loop_set_fd(dev, backing)
    }

    fn loop_set_status_flags(&self, dev: &File, flags: u32) -> io::Result<()> {
        sys::loop_set_status_flags(dev, flags)
    }

    fn loop_clr_fd(&self, dev: &File) -> io::Result<()> {
        sys::loop_clr_fd(dev)
    }

    fn read_to_string(&self, path: &Utf8Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn read_dir_names(&self, path: &Utf8Path) -> io::Result<Vec<String>> {
        let mut r = Vec::new();
        for ent in path.read_dir_utf8()? {
            r.push(ent?.file_name().to_owned());
        }
        Ok(r)
    }

    fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn mount(&self, req: &MountRequest) -> io::Result<()> {
        tracing::trace!("mount: {req:?}");
        sys::mount(req)
    }

    fn unmount(&self, target: &Utf8Path, mode: UnmountMode) -> io::Result<()> {
        let flags = match mode {
            UnmountMode::Normal => UnmountFlags::empty(),
            UnmountMode::Lazy => UnmountFlags::DETACH,
        };
        rustix::mount::unmount(target.as_std_path(), flags)?;
        Ok(())
    }

    fn sync_filesystem(&self, path: &Utf8Path) -> io::Result<()> {
        let f = File::open(path)?;
        rustix::fs::syncfs(&f)?;
        Ok(())
    }

    fn canonicalize(&self, path: &Utf8Path) -> io::Result<Utf8PathBuf> {
        path.canonicalize_utf8()
    }

    fn identity(&self, path: &Utf8Path) -> io::Result<FileIdentity> {
        let m = std::fs::metadata(path)?;
        Ok(FileIdentity {
            dev: m.dev(),
            ino: m.ino(),
        })
    }

    fn run(&self, cmd: &mut Command) -> anyhow::Result<()> {
        cmd.log_debug().run_capture_stderr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_root() {
        let a = HostOps.identity(Utf8Path::new("/")).unwrap();
        let b = HostOps.identity(Utf8Path::new("/.")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_differs() {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8Path::from_path(td.path()).unwrap();
        let root = HostOps.identity(Utf8Path::new("/")).unwrap();
        assert_ne!(HostOps.identity(p).unwrap(), root);
    }

    #[test]
    fn test_canonicalize() {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8Path::from_path(td.path()).unwrap();
        let real = HostOps.canonicalize(p).unwrap();
        std::fs::create_dir(p.join("d")).unwrap();
        std::os::unix::fs::symlink(p.join("d"), p.join("link")).unwrap();
        assert_eq!(HostOps.canonicalize(&p.join("link/../d/.")).unwrap(), real.join("d"));
        assert!(HostOps.canonicalize(&p.join("missing")).is_err());
    }

    #[test]
    fn test_read_dir_names() {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8Path::from_path(td.path()).unwrap();
        std::fs::write(p.join("a"), "").unwrap();
        std::fs::create_dir(p.join("b")).unwrap();
        let mut names = HostOps.read_dir_names(p).unwrap();
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_run() {
        HostOps.run(Command::new("true").arg("ignored")).unwrap();
        assert!(HostOps.run(&mut Command::new("false")).is_err());
    }

    #[test]
    fn test_loop_control_not_root() {
        if rustix::process::getuid().is_root() {
            return;
        }
        // Without root we can't open loop-control read-write
        let r = HostOps.open(Utf8Path::new("/dev/loop-control"), OpenMode::ReadWrite);
        assert!(r.is_err());
    }

    #[test]
    fn test_loop_get_free_root() {
        if !rustix::process::getuid().is_root() {
            return;
        }
        let Ok(control) = HostOps.open(Utf8Path::new("/dev/loop-control"), OpenMode::ReadWrite)
        else {
            // No loop driver, e.g. in an unprivileged container
            return;
        };
        let minor = HostOps.loop_ctl_get_free(&control).unwrap();
        let attr = format!("/sys/block/loop{minor}/loop/backing_file");
        assert!(HostOps.read_to_string(Utf8Path::new(&attr)).is_err());
    }
}
