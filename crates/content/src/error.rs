use std::io;

use camino::Utf8PathBuf;

/// Errors computing a checksum or manifest.
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    /// Reading the node failed.
    #[error("{path}: {source}")]
    Io {
        /// The node being read.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The node is not a regular file, symlink or directory.
    #[error("{path}: unsupported file type")]
    UnsupportedType {
        /// The node.
        path: Utf8PathBuf,
    },
    /// A path that is not valid UTF-8 was found while walking a tree.
    #[error("non UTF-8 path: {0:?}")]
    NonUtf8Path(std::path::PathBuf),
    /// A symlink target that is not valid UTF-8, which the header's
    /// string field cannot hold.
    #[error("{path}: symlink target is not valid UTF-8")]
    NonUtf8Target {
        /// The symlink.
        path: Utf8PathBuf,
    },
    /// A serialized header does not fit in the format's length field.
    #[error("serialized header of {0} bytes is too large")]
    TooLarge(usize),
}

impl ChecksumError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| ChecksumError::Io { path, source }
    }
}
