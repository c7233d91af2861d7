#![forbid(unsafe_code)]
//! Error types for the HFS engine.
//!
//! # Error Taxonomy
//!
//! The engine uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `hfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `HfsError` | `hfs-error` (this crate) | User-facing errors for API consumers |
//!
//! ## Mapping Policy: ParseError → HfsError
//!
//! `hfs-error` does not depend on `hfs-types`. The conversion from
//! `ParseError` happens in the crates that know which block was being read:
//!
//! | ParseError Variant | HfsError Variant | Rationale |
//! |--------------------|------------------|-----------|
//! | `InsufficientData` | `Corruption { block, detail }` | Truncated node or record |
//! | `InvalidMagic` | `Format(detail)` | Not an HFS volume at all |
//! | `InvalidField` | `Format` at mount, `Corruption` afterwards | Context decides |
//! | `IntegerConversion` | `Corruption { block, detail }` | Out-of-range counters |
//!
//! ## Fatal vs. recoverable
//!
//! `NotFound`, `Exists`, `InvalidArgument`, `NoSpace` and friends are
//! ordinary per-call outcomes. `Corruption`, `Io` and `Poisoned` are fatal
//! (see [`HfsError::is_fatal`]): once a mutating call on a volume returns one
//! of them, every later mutation on that volume fails with `Poisoned` until
//! the volume is unmounted and mounted again.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`HfsError::to_errno`].
//! The match is exhaustive so a new variant cannot ship without one.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | `EIO` (or the wrapped OS error) |
//! | `Corruption` | `EIO` |
//! | `Poisoned` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `Exists` | `EEXIST` |
//! | `ReadOnly` | `EROFS` |
//! | `Locked` | `EPERM` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Busy` | `EBUSY` |
//! | `BadHandle` | `EBADF` |
//! | `NeedsCheck` | `EINVAL` |

use thiserror::Error;

/// Unified error type for all HFS engine operations.
#[derive(Debug, Error)]
pub enum HfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known logical block.
    ///
    /// For B-tree failures `block` is the node index inside the tree file.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (bad signature, impossible geometry).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Malformed path, bad seek target, out-of-range fork selector.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The allocation bitmap or a tree file cannot satisfy the request.
    #[error("no space left on device")]
    NoSpace,

    /// Missing path, catalog key, CNID or extent record.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate catalog or extents key.
    #[error("already exists: {0}")]
    Exists(String),

    /// Volume is mounted read-only and a mutation was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The file or volume carries a lock flag.
    #[error("object is locked")]
    Locked,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Name exceeds 31 bytes (27 for volume names) or is empty.
    #[error("name too long")]
    NameTooLong,

    /// The object is in use (open file deleted, second writer).
    #[error("resource busy: {0}")]
    Busy(String),

    /// A volume, directory or file handle that is closed or never existed.
    #[error("bad handle")]
    BadHandle,

    /// The volume was not cleanly unmounted and cannot be mounted read-write.
    #[error("volume needs consistency check: {0}")]
    NeedsCheck(String),

    /// A previous fatal error disabled mutations on this volume.
    #[error("volume disabled after fatal error: {0}")]
    Poisoned(String),
}

impl HfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive. `Io` keeps the OS error when one is present.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Poisoned(_) => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidArgument(_)
            | Self::NeedsCheck(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists(_) => libc::EEXIST,
            Self::ReadOnly => libc::EROFS,
            Self::Locked => libc::EPERM,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Busy(_) => libc::EBUSY,
            Self::BadHandle => libc::EBADF,
        }
    }

    /// Whether this error must disable further mutations on the volume.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Corruption { .. } | Self::Poisoned(_)
        )
    }
}

/// Result alias using `HfsError`.
pub type Result<T> = std::result::Result<T, HfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(HfsError, libc::c_int)> = vec![
            (HfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                HfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (HfsError::Format("test".into()), libc::EINVAL),
            (HfsError::Parse("test".into()), libc::EINVAL),
            (HfsError::InvalidArgument("seek".into()), libc::EINVAL),
            (HfsError::NoSpace, libc::ENOSPC),
            (HfsError::NotFound("test".into()), libc::ENOENT),
            (HfsError::Exists("test".into()), libc::EEXIST),
            (HfsError::ReadOnly, libc::EROFS),
            (HfsError::Locked, libc::EPERM),
            (HfsError::NotDirectory, libc::ENOTDIR),
            (HfsError::IsDirectory, libc::EISDIR),
            (HfsError::NotEmpty, libc::ENOTEMPTY),
            (HfsError::NameTooLong, libc::ENAMETOOLONG),
            (HfsError::Busy("open file".into()), libc::EBUSY),
            (HfsError::BadHandle, libc::EBADF),
            (HfsError::NeedsCheck("dirty".into()), libc::EINVAL),
            (HfsError::Poisoned("earlier I/O error".into()), libc::EIO),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = HfsError::Io(raw);
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = HfsError::Corruption {
            block: 42,
            detail: "record offsets not ascending".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: record offsets not ascending"
        );
        assert_eq!(HfsError::ReadOnly.to_string(), "read-only filesystem");
        assert_eq!(
            HfsError::NotFound("Macintosh HD:System".into()).to_string(),
            "not found: Macintosh HD:System"
        );
    }

    #[test]
    fn only_corruption_io_and_poison_are_fatal() {
        assert!(HfsError::Io(std::io::Error::other("x")).is_fatal());
        assert!(
            HfsError::Corruption {
                block: 1,
                detail: "x".into()
            }
            .is_fatal()
        );
        assert!(HfsError::Poisoned("x".into()).is_fatal());
        assert!(!HfsError::NoSpace.is_fatal());
        assert!(!HfsError::NotFound("x".into()).is_fatal());
        assert!(!HfsError::Exists("x".into()).is_fatal());
    }
}
