use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

/// Symlinks named by filesystem UUID.
pub const DISK_BY_UUID: &str = "/dev/disk/by-uuid";
/// Symlinks named by partition UUID.
pub const DISK_BY_PARTUUID: &str = "/dev/disk/by-partuuid";

/// Find the entry of `attr_dir` (a directory of udev symlinks such as
/// [`DISK_BY_UUID`]) that resolves to the same node as `device`, and return
/// its name.
#[context("Resolving {device} in {attr_dir}")]
pub fn resolve_device_attribute(device: &Utf8Path, attr_dir: &Utf8Path) -> Result<String> {
    let target = device
        .canonicalize_utf8()
        .with_context(|| format!("Canonicalizing {device}"))?;
    for ent in attr_dir.read_dir_utf8()? {
        let ent = ent?;
        let resolved = match ent.path().canonicalize_utf8() {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!("Skipping {}: {e}", ent.path());
                continue;
            }
        };
        if resolved == target {
            return Ok(ent.file_name().to_owned());
        }
    }
    anyhow::bail!("No entry resolves to {target}")
}

/// The filesystem UUID of `device`.
pub fn device_uuid(device: &Utf8Path) -> Result<String> {
    resolve_device_attribute(device, Utf8Path::new(DISK_BY_UUID))
}

/// The partition UUID of `device`.
pub fn device_partuuid(device: &Utf8Path) -> Result<String> {
    resolve_device_attribute(device, Utf8Path::new(DISK_BY_PARTUUID))
}

#[cfg(test)]
mod test {
    use super::*;
    use camino::Utf8PathBuf;
    use similar_asserts::assert_eq;
    use std::os::unix::fs::symlink;

    fn setup() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_owned()).unwrap();
        std::fs::write(root.join("sda1"), "").unwrap();
        std::fs::write(root.join("sda2"), "").unwrap();
        let by_uuid = root.join("by-uuid");
        std::fs::create_dir(&by_uuid).unwrap();
        symlink("../sda2", by_uuid.join("2222-BBBB")).unwrap();
        symlink("../sda1", by_uuid.join("1111-aaaa")).unwrap();
        symlink("../gone", by_uuid.join("dangling")).unwrap();
        (td, root)
    }

    #[test]
    fn test_resolve() {
        let (_td, root) = setup();
        let by_uuid = root.join("by-uuid");
        assert_eq!(
            resolve_device_attribute(&root.join("sda1"), &by_uuid).unwrap(),
            "1111-aaaa"
        );
        // The device itself may be a symlink too
        symlink(root.join("sda2"), root.join("alias")).unwrap();
        assert_eq!(
            resolve_device_attribute(&root.join("alias"), &by_uuid).unwrap(),
            "2222-BBBB"
        );
    }

    #[test]
    fn test_resolve_no_match() {
        let (_td, root) = setup();
        std::fs::write(root.join("sdb"), "").unwrap();
        let e = resolve_device_attribute(&root.join("sdb"), &root.join("by-uuid")).unwrap_err();
        assert!(format!("{e:#}").contains("No entry resolves to"));
    }

    #[test]
    fn test_resolve_missing_device() {
        let (_td, root) = setup();
        assert!(resolve_device_attribute(&root.join("nope"), &root.join("by-uuid")).is_err());
    }

    #[test]
    fn test_wrappers_use_udev_dirs() {
        let dev = Utf8Path::new("/nonexistent/sdz1");
        let e = device_uuid(dev).unwrap_err();
        assert!(format!("{e:#}").contains("in /dev/disk/by-uuid"));
        let e = device_partuuid(dev).unwrap_err();
        assert!(format!("{e:#}").contains("in /dev/disk/by-partuuid"));
    }

    #[test]
    fn test_device_uuid_host() {
        let Ok(mut entries) = Utf8Path::new(DISK_BY_UUID).read_dir_utf8() else {
            return;
        };
        let Some(Ok(ent)) = entries.next() else {
            return;
        };
        let Ok(dev) = ent.path().canonicalize_utf8() else {
            return;
        };
        // Several names may resolve to one node, so check the one we got
        let uuid = device_uuid(&dev).unwrap();
        assert_eq!(
            Utf8Path::new(DISK_BY_UUID).join(uuid).canonicalize_utf8().unwrap(),
            dev
        );
    }
}
