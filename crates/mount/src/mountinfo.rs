//! Parsing of the kernel's `mountinfo` format, see proc(5).

use camino::Utf8PathBuf;
use serde::Serialize;

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountEntry {
    /// Unique id of the mount.
    pub mount_id: u32,
    /// Id of the parent mount.
    pub parent_id: u32,
    /// `st_dev` major of the filesystem.
    pub major: u32,
    /// `st_dev` minor of the filesystem.
    pub minor: u32,
    /// Path within the filesystem that forms the root of this mount.
    pub root: Utf8PathBuf,
    /// Mountpoint relative to the process root.
    pub mountpoint: Utf8PathBuf,
    /// Per-mount options.
    pub options: String,
    /// Propagation fields such as `shared:1` or `master:3`.
    pub optional_fields: Vec<String>,
    /// Filesystem type.
    pub fstype: String,
    /// Filesystem-specific source, or `none`.
    pub source: String,
    /// Per-superblock options.
    pub super_options: String,
}

impl MountEntry {
    /// The `shared:N` peer group, if any.
    pub fn shared_peer_group(&self) -> Option<u32> {
        self.optional_fields
            .iter()
            .find_map(|f| f.strip_prefix("shared:"))
            .and_then(|v| v.parse().ok())
    }
}

/// Decode `\NNN` octal escapes as the kernel writes them for space, tab,
/// newline and backslash. Anything that is not a complete three digit octal
/// escape of a byte value is passed through unchanged.
pub fn unescape_octal(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(v) = bytes.get(i + 1..i + 4).and_then(octal_byte) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    match String::from_utf8(out) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

fn octal_byte(digits: &[u8]) -> Option<u8> {
    let mut v: u32 = 0;
    for &d in digits {
        if !(b'0'..=b'7').contains(&d) {
            return None;
        }
        v = v * 8 + u32::from(d - b'0');
    }
    u8::try_from(v).ok()
}

/// Parse a single mountinfo line; `None` if it is malformed.
pub fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let (left, right) = line.split_once(" - ")?;
    let left: Vec<&str> = left.split_whitespace().collect();
    let right: Vec<&str> = right.split_whitespace().collect();
    if left.len() < 6 || right.len() < 2 {
        return None;
    }
    let (major, minor) = left[2].split_once(':')?;
    Some(MountEntry {
        mount_id: left[0].parse().ok()?,
        parent_id: left[1].parse().ok()?,
        major: major.parse().ok()?,
        minor: minor.parse().ok()?,
        root: unescape_octal(left[3]).into(),
        mountpoint: unescape_octal(left[4]).into(),
        options: left[5].to_owned(),
        optional_fields: left[6..].iter().map(|s| (*s).to_owned()).collect(),
        fstype: right[0].to_owned(),
        source: unescape_octal(right[1]),
        super_options: right.get(2).copied().unwrap_or_default().to_owned(),
    })
}

/// Parse a whole mount table, skipping malformed lines.
pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let r = parse_mountinfo_line(line);
            if r.is_none() {
                tracing::trace!("Skipping malformed mountinfo line: {line:?}");
            }
            r
        })
        .collect()
}
