#![forbid(unsafe_code)]
//! FUSE adapter for SliceFS.
//!
//! This crate is a thin translation layer: kernel FUSE requests arrive via
//! the `fuser` crate, get forwarded to the one long-lived
//! [`WindowedFile`](sfs_core::WindowedFile), and errors are mapped through
//! [`SliceError::to_errno()`].
//!
//! The virtual tree is a single regular file: the mountpoint is itself a
//! regular file, so the FUSE root inode *is* the virtual file. There are no
//! directory entries to look up and nothing to read below the root.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData, ReplyEmpty,
    ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use sfs_core::{FileAttributes, WindowedFile};
use sfs_error::SliceError;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{info, trace, warn};

/// The FUSE root inode; for a file mountpoint it is the virtual file itself.
const ROOT_INO: u64 = 1;

/// TTL for cached attributes.
///
/// The window's length can move under concurrent writers, so keep the
/// kernel's attribute cache short-lived.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── FUSE error context ──────────────────────────────────────────────────────

/// Structured error context for FUSE operation failures.
///
/// Captures the operation name, optional byte offset, and the underlying
/// error. Used to produce consistent, structured tracing for every FUSE
/// error reply.
pub struct FuseErrorContext<'a> {
    pub error: &'a SliceError,
    pub operation: &'static str,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log this error context via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // ENOENT on lookup is normal for a single-file tree — trace, not warn.
        if errno == libc::ENOENT {
            trace!(
                op = self.operation,
                errno,
                error = %self.error,
                "FUSE op returned ENOENT"
            );
        } else {
            warn!(
                op = self.operation,
                offset = self.offset,
                errno,
                error = %self.error,
                "FUSE op failed"
            );
        }
        errno
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── Cache-line padding ──────────────────────────────────────────────────────

/// Pad a value to 64 bytes to avoid false sharing between hot counters
/// updated on different CPU cores.
#[repr(C, align(64))]
pub struct CacheLinePadded<T>(pub T);

impl<T: std::fmt::Debug> std::fmt::Debug for CacheLinePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ── Atomic metrics ──────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
///
/// Each counter sits on its own cache line (64 B) so cores updating
/// different counters never invalidate each other's L1 lines.
#[repr(C)]
pub struct AtomicMetrics {
    pub requests_total: CacheLinePadded<AtomicU64>,
    pub requests_ok: CacheLinePadded<AtomicU64>,
    pub requests_err: CacheLinePadded<AtomicU64>,
    pub bytes_read: CacheLinePadded<AtomicU64>,
    pub bytes_written: CacheLinePadded<AtomicU64>,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_total: CacheLinePadded(AtomicU64::new(0)),
            requests_ok: CacheLinePadded(AtomicU64::new(0)),
            requests_err: CacheLinePadded(AtomicU64::new(0)),
            bytes_read: CacheLinePadded(AtomicU64::new(0)),
            bytes_written: CacheLinePadded(AtomicU64::new(0)),
        }
    }

    fn record_ok(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_ok.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_err(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_err.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes_read(&self, n: u64) {
        self.bytes_read.0.fetch_add(n, Ordering::Relaxed);
    }

    fn record_bytes_written(&self, n: u64) {
        self.bytes_written.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot of all counters (for diagnostics / reporting).
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.0.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.0.load(Ordering::Relaxed),
            requests_err: self.requests_err.0.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.0.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.0.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AtomicMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();
        f.debug_struct("AtomicMetrics")
            .field("requests_total", &s.requests_total)
            .field("requests_ok", &s.requests_ok)
            .field("requests_err", &s.requests_err)
            .field("bytes_read", &s.bytes_read)
            .field("bytes_written", &s.bytes_written)
            .finish()
    }
}

/// Point-in-time snapshot of metrics (all plain `u64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

// ── Shared FUSE inner state ─────────────────────────────────────────────────

/// Thread-safe shared state for the FUSE backend.
///
/// All fields are `Send + Sync`: the window uses positioned I/O plus one
/// atomic length field, and the metrics are lock-free counters.
struct FuseInner {
    window: Arc<WindowedFile>,
    metrics: Arc<AtomicMetrics>,
    read_only: bool,
}

impl std::fmt::Debug for FuseInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseInner")
            .field("window", &self.window)
            .field("metrics", &self.metrics)
            .field("read_only", &self.read_only)
            .finish()
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter that delegates all operations to a shared [`WindowedFile`].
///
/// Internally wraps all state in `Arc<FuseInner>` so it is `Send + Sync`
/// and ready for multi-threaded FUSE dispatch. Lock-free [`AtomicMetrics`]
/// are updated on every request.
pub struct SliceFuse {
    inner: Arc<FuseInner>,
}

// Compile-time assertion: SliceFuse must be Send + Sync.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<SliceFuse>;
};

impl SliceFuse {
    /// Create a new FUSE adapter serving the given window.
    #[must_use]
    pub fn new(window: Arc<WindowedFile>) -> Self {
        Self {
            inner: Arc::new(FuseInner {
                read_only: window.read_only(),
                metrics: Arc::new(AtomicMetrics::new()),
                window,
            }),
        }
    }

    /// Get a reference to the shared metrics.
    #[must_use]
    pub fn metrics(&self) -> &AtomicMetrics {
        &self.inner.metrics
    }

    /// The single-file tree has exactly one inode.
    fn check_root(ino: u64) -> Result<(), SliceError> {
        if ino == ROOT_INO {
            Ok(())
        } else {
            Err(SliceError::NotFound(format!("inode {ino}")))
        }
    }

    /// Record the outcome of a request in the metrics.
    fn observe<T>(&self, result: &Result<T, SliceError>) {
        if result.is_ok() {
            self.inner.metrics.record_ok();
        } else {
            self.inner.metrics.record_err();
        }
    }

    fn to_file_attr(attrs: &FileAttributes) -> FileAttr {
        FileAttr {
            ino: ROOT_INO,
            size: attrs.size,
            blocks: attrs.blocks,
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
            crtime: attrs.ctime,
            kind: FileType::RegularFile,
            perm: attrs.perm,
            nlink: attrs.nlink,
            uid: attrs.uid,
            gid: attrs.gid,
            rdev: 0,
            blksize: attrs.blksize,
            flags: 0,
        }
    }

    fn reply_attr_result(
        &self,
        operation: &'static str,
        result: Result<FileAttributes, SliceError>,
        reply: ReplyAttr,
    ) {
        self.observe(&result);
        match result {
            Ok(attrs) => reply.attr(&ATTR_TTL, &Self::to_file_attr(&attrs)),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn reply_empty_result(
        &self,
        operation: &'static str,
        result: Result<(), SliceError>,
        reply: ReplyEmpty,
    ) {
        self.observe(&result);
        match result {
            Ok(()) => reply.ok(),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }
}

impl Filesystem for SliceFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {}

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let result = Self::check_root(ino).and_then(|()| self.inner.window.attributes());
        self.reply_attr_result("getattr", result, reply);
    }

    fn lookup(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &std::ffi::OsStr,
        reply: fuser::ReplyEntry,
    ) {
        // The root is a regular file; there is nothing beneath it.
        reply.error(libc::ENOTDIR);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        reply: fuser::ReplyDirectory,
    ) {
        reply.error(libc::ENOTDIR);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = Self::check_root(ino).and_then(|()| self.inner.window.open_check(flags));
        self.observe(&result);
        match result {
            // Stateless open: no file handles to track.
            Ok(()) => reply.opened(0, 0),
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "open",
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        // Clamp negative offsets to 0 (shouldn't happen in practice).
        let at = u64::try_from(offset).unwrap_or(0);
        let result =
            Self::check_root(ino).and_then(|()| self.inner.window.read_at(at, size as usize));
        self.observe(&result);
        match result {
            Ok(data) => {
                self.inner
                    .metrics
                    .record_bytes_read(u64::try_from(data.len()).unwrap_or(u64::MAX));
                reply.data(&data);
            }
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "read",
                    offset: Some(at),
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let at = u64::try_from(offset).unwrap_or(0);
        let result = Self::check_root(ino).and_then(|()| self.inner.window.write_at(at, data));
        self.observe(&result);
        match result {
            Ok(written) => {
                self.inner
                    .metrics
                    .record_bytes_written(u64::try_from(written).unwrap_or(u64::MAX));
                reply.written(u32::try_from(written).unwrap_or(u32::MAX));
            }
            Err(e) => {
                let ctx = FuseErrorContext {
                    error: &e,
                    operation: "write",
                    offset: Some(at),
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if let Err(e) = Self::check_root(ino) {
            self.inner.metrics.record_err();
            let ctx = FuseErrorContext {
                error: &e,
                operation: "setattr",
                offset: None,
            };
            reply.error(ctx.log_and_errno());
            return;
        }
        if self.inner.read_only {
            self.inner.metrics.record_err();
            reply.error(libc::EROFS);
            return;
        }

        let resolve_time = |t: TimeOrNow| -> SystemTime {
            match t {
                TimeOrNow::SpecificTime(st) => st,
                TimeOrNow::Now => SystemTime::now(),
            }
        };

        let result = (|| {
            if uid.is_some() || gid.is_some() {
                self.inner.window.chown(uid, gid)?;
            }
            if let Some(mode) = mode {
                self.inner.window.chmod(mode)?;
            }
            if let Some(size) = size {
                self.inner.window.set_len(size)?;
            }
            if atime.is_some() || mtime.is_some() {
                self.inner
                    .window
                    .set_times(atime.map(resolve_time), mtime.map(resolve_time))?;
            }
            self.inner.window.attributes()
        })();
        self.reply_attr_result("setattr", result, reply);
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let result = Self::check_root(ino).and_then(|()| self.inner.window.access_check(mask));
        self.reply_empty_result("access", result, reply);
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        let result = Self::check_root(ino).and_then(|()| self.inner.window.sync(datasync));
        self.reply_empty_result("fsync", result, reply);
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

/// Build a list of `fuser::MountOption` from our `MountOptions`.
fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("slicefs".to_owned()),
        MountOption::Subtype("slicefs".to_owned()),
    ];

    if options.read_only {
        opts.push(MountOption::RO);
    }
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

/// Mount the window at the given mountpoint (blocking).
///
/// This function blocks until the filesystem is unmounted.
pub fn mount(
    window: Arc<WindowedFile>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let fs = SliceFuse::new(window);
    info!(mountpoint = %mountpoint.display(), "mounting slicefs");
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount the window in the background, returning a session handle.
///
/// The filesystem is unmounted when the returned `BackgroundSession` is
/// dropped.
pub fn mount_background(
    window: Arc<WindowedFile>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let fs = SliceFuse::new(window);
    let session = fuser::spawn_mount2(fs, mountpoint, &fuse_opts)?;
    Ok(session)
}

// ── Mount lifecycle ─────────────────────────────────────────────────────────

/// Handle for a live FUSE mount with lifecycle control.
///
/// Dropping the handle triggers a clean unmount. Call [`MountHandle::wait`]
/// to block until external shutdown (Ctrl+C / programmatic flag set).
///
/// The CLI (or any owner) wires SIGTERM / SIGINT handlers to the shared
/// `shutdown` flag; the `AutoUnmount` fuser option is the safety net if the
/// process exits without a clean unmount.
pub struct MountHandle {
    session: Option<fuser::BackgroundSession>,
    mountpoint: PathBuf,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    metrics: Arc<AtomicMetrics>,
}

impl MountHandle {
    /// The mountpoint path.
    #[must_use]
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Shared shutdown flag.
    ///
    /// Set this to `true` (from a signal handler or another thread) to
    /// trigger a graceful unmount.
    #[must_use]
    pub fn shutdown_flag(&self) -> &Arc<std::sync::atomic::AtomicBool> {
        &self.shutdown
    }

    /// Get a snapshot of the mount metrics.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Block until the shutdown flag is set, then unmount cleanly.
    ///
    /// Returns the final metrics snapshot.
    #[must_use]
    pub fn wait(mut self) -> MetricsSnapshot {
        info!(mountpoint = %self.mountpoint.display(), "waiting for shutdown signal");
        while !self.shutdown.load(std::sync::atomic::Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(100));
        }
        info!(mountpoint = %self.mountpoint.display(), "shutdown signal received");
        self.do_unmount()
    }

    /// Trigger a graceful unmount.
    ///
    /// Returns the final metrics snapshot.
    #[must_use]
    pub fn unmount(mut self) -> MetricsSnapshot {
        self.do_unmount()
    }

    fn do_unmount(&mut self) -> MetricsSnapshot {
        let snap = self.metrics.snapshot();
        if let Some(session) = self.session.take() {
            info!(
                mountpoint = %self.mountpoint.display(),
                requests_total = snap.requests_total,
                requests_ok = snap.requests_ok,
                requests_err = snap.requests_err,
                bytes_read = snap.bytes_read,
                bytes_written = snap.bytes_written,
                "unmounting FUSE filesystem"
            );
            // Dropping the BackgroundSession triggers FUSE unmount.
            drop(session);
            info!(mountpoint = %self.mountpoint.display(), "unmount complete");
        }
        snap
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.do_unmount();
        }
    }
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("active", &self.session.is_some())
            .field(
                "shutdown",
                &self.shutdown.load(std::sync::atomic::Ordering::Relaxed),
            )
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

/// Mount the window with full lifecycle control.
///
/// Returns a [`MountHandle`] that can be used to wait for signals, query
/// metrics, and trigger a clean unmount.
pub fn mount_managed(
    window: Arc<WindowedFile>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<MountHandle, FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    if !mountpoint.exists() {
        return Err(FuseError::InvalidMountpoint(format!(
            "mountpoint does not exist: {}",
            mountpoint.display()
        )));
    }

    let fuse_opts = build_mount_options(options);
    let fs = SliceFuse::new(window);
    let metrics_ref = Arc::clone(&fs.inner.metrics);

    let session = fuser::spawn_mount2(fs, mountpoint, &fuse_opts)?;
    info!(mountpoint = %mountpoint.display(), "FUSE mount active");

    Ok(MountHandle {
        session: Some(session),
        mountpoint: mountpoint.to_owned(),
        shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        metrics: metrics_ref,
    })
}
