use thiserror::Error;

/// Volume-unique object identifier, nonzero. 1..=4 are the pseudo-directories.
pub type ObjectId = u32;

/// Logical chunk position within a file, 0-based. On flash it is stored +1 so
/// that 0 can mean "object header".
pub type ChunkId = u32;

/// Flat physical chunk index: block * chunks_per_block + offset.
pub type PhysChunk = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// On-flash layout generation.
///
/// V1 keeps a deletion marker in the tags and mounts with a forward
/// (oldest-first) scan; V2 has no in-place markers at all and mounts with a
/// backward scan ordered by block sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashVersion {
    V1,
    #[default]
    V2,
}

/// Mount/format-time configuration, handed to [`crate::Lffs::new`].
#[derive(Debug, Clone)]
pub struct LffsOptions {
    /// Blocks kept erased so that GC always has somewhere to copy to.
    pub n_reserved_blocks: usize,
    /// Slots in the write-back chunk cache.
    pub n_caches: usize,
    pub version: FlashVersion,
    /// Tags ride in the tail of the data area instead of the spare area.
    pub inband_tags: bool,
    /// Whole-chunk aligned writes may skip the cache.
    pub cache_bypass_aligned: bool,
    /// Directory name matching folds case.
    pub case_insensitive: bool,
    /// Write retry budget; 0 means "try hard" and is clamped to
    /// WR_ATTEMPTS_CAP rather than looping forever.
    pub wr_attempts: usize,
    pub endian: Endianness,
    /// Bits per index-tree leaf slot; widened automatically at format time
    /// until a chunk-group base fits.
    pub tnode_width: u32,
    /// Read every chunk back after programming it.
    pub verify_writes: bool,
}

impl Default for LffsOptions {
    fn default() -> Self {
        Self {
            n_reserved_blocks: 5,
            n_caches: 10,
            version: FlashVersion::V2,
            inband_tags: false,
            cache_bypass_aligned: true,
            case_insensitive: false,
            wr_attempts: 8,
            endian: Endianness::Little,
            tnode_width: 16,
            verify_writes: true,
        }
    }
}

/// Error kinds surfaced by every core operation. Each maps onto the POSIX
/// code the caller-facing layer hands out.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("bad object handle")]
    BadHandle,
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("name exists")]
    Exists,
    #[error("name too long")]
    NameTooLong,
    #[error("too many levels of symbolic links")]
    Loop,
    #[error("no space left on device")]
    NoSpace,
    #[error("out of memory")]
    NoMemory,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("cross-device link")]
    CrossDevice,
    #[error("device busy")]
    Busy,
    #[error("argument out of range")]
    Range,
    #[error("no such attribute")]
    NoData,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("internal invariant violated: {0}")]
    Fatal(String),
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::BadHandle => libc::EBADF,
            FsError::NotFound => libc::ENOENT,
            FsError::NotDir => libc::ENOTDIR,
            FsError::IsDir => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Exists => libc::EEXIST,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::Loop => libc::ELOOP,
            FsError::NoSpace => libc::ENOSPC,
            FsError::NoMemory => libc::ENOMEM,
            FsError::ReadOnly => libc::EROFS,
            FsError::CrossDevice => libc::EXDEV,
            FsError::Busy => libc::EBUSY,
            FsError::Range => libc::ERANGE,
            FsError::NoData => libc::ENODATA,
            FsError::Io(_) => libc::EIO,
            FsError::Fatal(_) => libc::EIO,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::Loop.errno(), libc::ELOOP);
        assert_eq!(FsError::NoData.errno(), libc::ENODATA);
    }
}
