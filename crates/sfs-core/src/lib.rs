#![forbid(unsafe_code)]
//! Windowed-file core for SliceFS.
//!
//! A [`WindowedFile`] presents the byte range `[base_offset,
//! base_offset + capacity)` of a real file as a complete virtual file:
//! attribute queries, reads, writes, truncation, and sync are translated
//! into range-clamped operations on the backing descriptor.
//!
//! # Concurrency
//!
//! All data paths use positioned I/O (`read_at`/`write_all_at`), so the
//! backing descriptor's seek cursor is never touched and concurrent
//! operations need no serialization. The only mutable state is the virtual
//! file's current length, a single `AtomicU64`:
//!
//! - readers (`attributes`, `read_at`) `load(Acquire)`;
//! - `write_at` grows it with `fetch_max(AcqRel)` *after* the data write
//!   completes, so an attribute query never observes a size larger than
//!   what has been committed, and concurrent growers never lose an update;
//! - `set_len` stores the clamped value with `Release`.

use sfs_error::{Result, SliceError};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

mod size;
pub use size::parse_byte_size;

/// Synthesized attributes of the virtual file.
///
/// The file type is always regular; timestamps track a live stat of the
/// backing file so the virtual file ages with the real one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    /// Current length of the virtual file in bytes.
    pub size: u64,
    /// Number of 512-byte blocks covering `size`.
    pub blocks: u64,
    /// Last access time of the backing file.
    pub atime: SystemTime,
    /// Last modification time of the backing file.
    pub mtime: SystemTime,
    /// Last status change time of the backing file.
    pub ctime: SystemTime,
    /// POSIX permission bits; write bits cleared for read-only windows.
    pub perm: u16,
    /// Always 1.
    pub nlink: u32,
    /// Effective user ID of this process.
    pub uid: u32,
    /// Effective group ID of this process.
    pub gid: u32,
    /// Preferred I/O block size of the backing file.
    pub blksize: u32,
}

/// Parameters for [`WindowedFile::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowOptions {
    /// Byte offset into the backing file where the window begins.
    pub offset: u64,
    /// Hard ceiling on the window size; `None` means "to end of file".
    pub size_limit: Option<u64>,
    /// Reject every mutating operation and open the backing file read-only.
    pub read_only: bool,
}

/// A contiguous byte range of a backing file, exposed as a virtual file.
///
/// Immutable after construction except for the current length. The backing
/// descriptor is owned exclusively by this instance and closed exactly once
/// when it is dropped.
pub struct WindowedFile {
    file: File,
    base_offset: u64,
    capacity: u64,
    len: AtomicU64,
    read_only: bool,
    source_mode: u32,
}

impl std::fmt::Debug for WindowedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowedFile")
            .field("base_offset", &self.base_offset)
            .field("capacity", &self.capacity)
            .field("len", &self.len.load(Ordering::Acquire))
            .field("read_only", &self.read_only)
            .field("source_mode", &format_args!("{:#o}", self.source_mode))
            .finish_non_exhaustive()
    }
}

impl WindowedFile {
    /// Wrap an already-validated window.
    ///
    /// The caller must have checked that `base_offset + capacity` neither
    /// overflows nor exceeds the backing file's size; construction does not
    /// re-stat. The current length starts at `capacity`.
    #[must_use]
    pub fn new(
        file: File,
        base_offset: u64,
        capacity: u64,
        read_only: bool,
        source_mode: u32,
    ) -> Self {
        Self {
            file,
            base_offset,
            capacity,
            len: AtomicU64::new(capacity),
            read_only,
            source_mode,
        }
    }

    /// Open `path` and validate a window over it.
    ///
    /// The backing file is opened read-write unless `read_only` is set. The
    /// window's capacity is `size_limit` when given, otherwise everything
    /// from `offset` to the end of the file. A window extending past the
    /// file's size at open time is rejected.
    pub fn open(path: &Path, options: &WindowOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .open(path)?;
        let meta = file.metadata()?;
        let file_len = meta.len();

        if options.offset > file_len {
            return Err(SliceError::InvalidArgument(format!(
                "offset {} extends past the end of {} ({} bytes)",
                options.offset,
                path.display(),
                file_len
            )));
        }

        let capacity = match options.size_limit {
            Some(limit) => limit,
            None => file_len - options.offset,
        };

        let end = options
            .offset
            .checked_add(capacity)
            .ok_or_else(|| SliceError::InvalidArgument("offset + size overflows".into()))?;
        if end > file_len {
            return Err(SliceError::InvalidArgument(format!(
                "requested size or offset extends past the end of {} ({} bytes)",
                path.display(),
                file_len
            )));
        }

        debug!(
            path = %path.display(),
            offset = options.offset,
            capacity,
            read_only = options.read_only,
            "opened window"
        );

        Ok(Self::new(
            file,
            options.offset,
            capacity,
            options.read_only,
            meta.mode(),
        ))
    }

    /// Absolute offset of the window within the backing file.
    #[must_use]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Hard ceiling on the virtual file's size.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The virtual file's current length.
    #[must_use]
    pub fn current_len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Whether every mutating operation is rejected.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Synthesize the virtual file's attributes.
    ///
    /// Timestamps come from a live stat of the backing descriptor; size is
    /// the current length; uid/gid are the effective process identity.
    pub fn attributes(&self) -> Result<FileAttributes> {
        let meta = self.file.metadata()?;
        let mut perm = perm_bits(self.source_mode);
        if self.read_only {
            perm &= !0o222;
        }
        let size = self.current_len();

        Ok(FileAttributes {
            size,
            blocks: size.div_ceil(512),
            atime: system_time(meta.atime(), meta.atime_nsec()),
            mtime: system_time(meta.mtime(), meta.mtime_nsec()),
            ctime: system_time(meta.ctime(), meta.ctime_nsec()),
            perm,
            nlink: 1,
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            blksize: u32::try_from(meta.blksize()).unwrap_or(4096),
        })
    }

    /// Gate an `open` request by its access flags.
    ///
    /// Side-effect free; a read-only window denies any write-intent open.
    pub fn open_check(&self, flags: i32) -> Result<()> {
        if self.read_only && (flags & libc::O_ACCMODE) != libc::O_RDONLY {
            return Err(SliceError::PermissionDenied);
        }
        Ok(())
    }

    /// Gate an `access` probe by its mode mask.
    ///
    /// Write access is denied on read-only windows; execute access is never
    /// granted (the virtual file is a data window, not a program).
    pub fn access_check(&self, mask: i32) -> Result<()> {
        if (mask & libc::W_OK) != 0 && self.read_only {
            return Err(SliceError::PermissionDenied);
        }
        if (mask & libc::X_OK) != 0 {
            return Err(SliceError::PermissionDenied);
        }
        Ok(())
    }

    /// Read up to `length` bytes at virtual offset `at`.
    ///
    /// The request is clamped to the current length; reading at or past the
    /// end yields an empty buffer, the ordinary end-of-file signal. The
    /// transfer loops on interrupted calls and stops early only if the
    /// backing stream ends.
    pub fn read_at(&self, at: u64, length: usize) -> Result<Vec<u8>> {
        let end = at
            .checked_add(length as u64)
            .ok_or_else(|| SliceError::InvalidArgument("offset + length overflows".into()))?;

        let current = self.current_len();
        let clamped = end.min(current).saturating_sub(at);
        if clamped == 0 {
            return Ok(Vec::new());
        }

        // clamped <= length <= usize::MAX by construction
        let mut buf = vec![0_u8; clamped as usize];
        let mut filled = 0_usize;
        while filled < buf.len() {
            let pos = self.base_offset + at + filled as u64;
            match self.file.read_at(&mut buf[filled..], pos) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(SliceError::Io(e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Write `data` at virtual offset `at`, returning the bytes written.
    ///
    /// A write crossing the capacity ceiling is clamped and reports the
    /// short count, like any filesystem running out of room; a write
    /// *starting* at or past the ceiling (with data to deliver) is an
    /// error. A write past the current length grows the file up to the
    /// ceiling, exactly like a sparse-extending write.
    pub fn write_at(&self, at: u64, data: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(SliceError::ReadOnly);
        }
        let end = at
            .checked_add(data.len() as u64)
            .ok_or_else(|| SliceError::InvalidArgument("offset + length overflows".into()))?;

        if at > self.capacity || (at == self.capacity && !data.is_empty()) {
            return Err(SliceError::WriteBeyondWindow {
                at,
                capacity: self.capacity,
            });
        }

        let clamped = (end.min(self.capacity) - at) as usize;
        if clamped == 0 {
            return Ok(0);
        }

        self.file
            .write_all_at(&data[..clamped], self.base_offset + at)?;

        // Publish growth only after the bytes are durable in the backing
        // file's page cache: a concurrent attribute query must never see a
        // length covering uncommitted bytes.
        self.len.fetch_max(at + clamped as u64, Ordering::AcqRel);
        Ok(clamped)
    }

    /// Set the virtual file's length, clamped to the capacity ceiling.
    ///
    /// No data is physically altered: bytes beyond the new length stay in
    /// the backing file and reappear if the length is grown back. Callers
    /// that must reject over-capacity truncation check the resulting
    /// length themselves.
    pub fn set_len(&self, new_len: u64) -> Result<()> {
        self.len
            .store(new_len.min(self.capacity), Ordering::Release);
        Ok(())
    }

    /// Flush the backing descriptor to durable storage.
    ///
    /// `datasync` skips the metadata flush, mirroring `fdatasync`.
    pub fn sync(&self, datasync: bool) -> Result<()> {
        if datasync {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Forward an atime/mtime update to the backing descriptor.
    ///
    /// A `None` slot leaves that timestamp untouched.
    pub fn set_times(
        &self,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let atime = timespec_or_omit(atime);
        let mtime = timespec_or_omit(mtime);
        nix::sys::stat::futimens(self.file.as_raw_fd(), &atime, &mtime)
            .map_err(|errno| SliceError::Io(errno.into()))
    }

    /// Ownership of the virtual file tracks the backing file; always denied.
    pub fn chown(&self, _uid: Option<u32>, _gid: Option<u32>) -> Result<()> {
        Err(SliceError::NotOwner)
    }

    /// Mode is derived from the backing file and the read-only flag, not
    /// independently stored; accepted as a no-op.
    pub fn chmod(&self, _mode: u32) -> Result<()> {
        Ok(())
    }
}

fn perm_bits(mode: u32) -> u16 {
    // Lower 12 bits: suid/sgid/sticky + rwxrwxrwx.
    (mode & 0o7777) as u16
}

fn system_time(secs: i64, nanos: i64) -> SystemTime {
    let nanos = nanos.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0)
    }
}

fn timespec_or_omit(t: Option<SystemTime>) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    match t {
        None => TimeSpec::new(0, libc::UTIME_OMIT),
        Some(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => TimeSpec::new(d.as_secs() as i64, i64::from(d.subsec_nanos())),
            // Pre-epoch timestamps collapse to the epoch.
            Err(_) => TimeSpec::new(0, 0),
        },
    }
}
