#![forbid(unsafe_code)]
//! Error types for SliceFS.
//!
//! `SliceError` is the single user-facing error type returned by the window
//! layer, the partition resolver, and the FUSE adapter. Every variant maps to
//! exactly one POSIX errno via [`SliceError::to_errno`]; the mapping is
//! exhaustive (no wildcard arms) so adding a variant is a compile error until
//! its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS code, else `EIO` |
//! | `InvalidArgument` | `EINVAL` |
//! | `PermissionDenied` | `EACCES` |
//! | `ReadOnly` | `EROFS` |
//! | `NotOwner` | `EPERM` |
//! | `NotFound` | `ENOENT` |
//! | `WriteBeyondWindow` | `EIO` |
//! | `TableUnavailable` | `EINVAL` |
//! | `MissingPartition` | `ENOENT` |
//! | `CorruptPartition` | `EIO` |
//! | `AllocationFailure` | `ENOMEM` |
//!
//! Per-request errors are never fatal: the FUSE adapter turns them into a
//! negative errno reply for the one caller that issued the request.
//! Configuration-time errors (bad flags, unresolvable partition, window past
//! end-of-file) are carried up to the CLI's single exit path instead.

use thiserror::Error;

/// Unified error type for all SliceFS operations.
#[derive(Debug, Error)]
pub enum SliceError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed numeric option, empty required path, or overflow in
    /// offset + length arithmetic.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Write-intent open or access probe denied by the window's mode.
    #[error("permission denied")]
    PermissionDenied,

    /// The window is read-only and a mutating operation was attempted.
    #[error("read-only virtual file")]
    ReadOnly,

    /// Ownership of the virtual file cannot be changed independently of the
    /// backing file's owner.
    #[error("ownership change not permitted")]
    NotOwner,

    /// Name lookup missed; the virtual tree holds a single file.
    #[error("not found: {0}")]
    NotFound(String),

    /// A write starting at or past the window's capacity ceiling.
    ///
    /// Distinct from a *crossing* write, which is clamped and succeeds with
    /// a short count.
    #[error("write at offset {at} starts beyond window capacity {capacity}")]
    WriteBeyondWindow { at: u64, capacity: u64 },

    /// The source carries no recognizable partition table, or the table
    /// region cannot be read.
    #[error("no usable partition table: {0}")]
    TableUnavailable(String),

    /// Partition index past the end of the table.
    #[error("partition {index} not found (table has {count} entries)")]
    MissingPartition { index: usize, count: usize },

    /// A table entry lacks a defined start or size, or its descriptor cannot
    /// be decoded.
    #[error("corrupt partition entry {index}: {detail}")]
    CorruptPartition { index: usize, detail: String },

    /// Memory exhaustion while reserving entry buffers.
    #[error("allocation failure")]
    AllocationFailure,
}

impl SliceError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// Policy notes:
    /// - `Io` preserves the underlying OS code when one exists; seek/read/
    ///   write/stat failures surface the real errno to the caller.
    /// - `WriteBeyondWindow` → `EIO`: a write starting past the hard ceiling
    ///   is an I/O error, matching ordinary device-full-file semantics.
    /// - `TableUnavailable` → `EINVAL`: the source is structurally not a
    ///   partitioned image.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) | Self::TableUnavailable(_) => libc::EINVAL,
            Self::PermissionDenied => libc::EACCES,
            Self::ReadOnly => libc::EROFS,
            Self::NotOwner => libc::EPERM,
            Self::NotFound(_) | Self::MissingPartition { .. } => libc::ENOENT,
            Self::WriteBeyondWindow { .. } | Self::CorruptPartition { .. } => libc::EIO,
            Self::AllocationFailure => libc::ENOMEM,
        }
    }

    /// Shorthand for an `Io` error carrying a specific raw errno.
    #[must_use]
    pub fn from_errno(errno: libc::c_int) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(errno))
    }
}

/// Result alias using `SliceError`.
pub type Result<T> = std::result::Result<T, SliceError>;
