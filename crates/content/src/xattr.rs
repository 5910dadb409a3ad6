use std::ffi::CStr;
use std::io;

use camino::Utf8Path;
use gvariant::{gv, Marker};
use rustix::buffer::spare_capacity;
use rustix::io::Errno;

/// Upper bound of both the name list and a single value (XATTR_SIZE_MAX).
const XATTR_BUF_SIZE: usize = 65536;

/// An extended attribute as it enters the checksum.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Xattr {
    /// Attribute name including the trailing NUL.
    pub name: Vec<u8>,
    /// Raw value.
    pub value: Vec<u8>,
}

impl Xattr {
    /// Create an attribute, NUL-terminating `name` if needed.
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        let mut name = name.into();
        if name.last() != Some(&0) {
            name.push(0);
        }
        Self {
            name,
            value: value.into(),
        }
    }
}

/// Name/value pairs sorted by name, the order they are serialized in.
pub(crate) fn sorted_pairs(xattrs: &[Xattr]) -> Vec<(&[u8], &[u8])> {
    let mut r: Vec<_> = xattrs
        .iter()
        .map(|x| (x.name.as_slice(), x.value.as_slice()))
        .collect();
    r.sort();
    r
}

/// Serialize attributes as `a(ayay)`, sorted by name so the result does not
/// depend on the order they were listed in.
pub fn serialize_xattrs(xattrs: &[Xattr]) -> Vec<u8> {
    let pairs = sorted_pairs(xattrs);
    gv!("a(ayay)").serialize_to_vec(&pairs)
}

/// Read the extended attributes of `path` without following a final
/// symlink. Filesystems without xattr support yield none.
pub fn read_xattrs(path: &Utf8Path) -> io::Result<Vec<Xattr>> {
    let path = path.as_std_path();
    let mut names: Vec<u8> = Vec::with_capacity(XATTR_BUF_SIZE);
    match rustix::fs::llistxattr(path, spare_capacity(&mut names)) {
        Ok(_) => {}
        Err(Errno::NOTSUP) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    let mut r = Vec::new();
    for name in names.split_inclusive(|c| *c == 0) {
        let Ok(cname) = CStr::from_bytes_with_nul(name) else {
            continue;
        };
        let mut value = Vec::with_capacity(XATTR_BUF_SIZE);
        match rustix::fs::lgetxattr(path, cname, spare_capacity(&mut value)) {
            Ok(_) => {}
            // Removed since we listed it
            Err(Errno::NODATA) => continue,
            Err(e) => return Err(e.into()),
        }
        r.push(Xattr {
            name: name.to_vec(),
            value,
        });
    }
    Ok(r)
}
