use core::fmt;

/// Recoverable failures of filesystem operations.
///
/// Structural corruption (double frees, locking a freed inode, short
/// dirent transfers) is not represented here; it panics instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Offset past end of file, or a length that overflows
    BadOffset,
    /// A data block no longer matches its stored Adler-32
    ChecksumMismatch {
        /// Logical block index within the file
        block: u32,
    },
    /// Directory entry name already present
    Exists,
    /// Device file with an out-of-range or unregistered major number
    BadMajor,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadOffset => write!(f, "offset out of range"),
            Self::ChecksumMismatch { block } => {
                write!(f, "checksum mismatch, block {block}")
            }
            Self::Exists => write!(f, "name already exists"),
            Self::BadMajor => write!(f, "bad device major"),
        }
    }
}
