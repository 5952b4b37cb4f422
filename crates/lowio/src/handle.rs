// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::PathBuf;

use tracing::{event, Level};

use crate::native_handle::NativeHandle;
use crate::{Errc, Error, Result};

/// What i/o the handle is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum Mode {
    /// Keep the mode of an existing handle (clone only).
    #[display("unchanged")]
    Unchanged,
    /// No data access, only synchronisation.
    #[display("none")]
    None,
    /// Attribute reads only.
    #[display("attr read")]
    AttrRead,
    /// Attribute reads and writes.
    #[display("attr write")]
    AttrWrite,
    /// Data reads.
    #[default]
    #[display("read")]
    Read,
    /// Data reads and writes.
    #[display("write")]
    Write,
    /// Atomic appends. All mainstream kernels guarantee appends through this
    /// mode are atomic with respect to all other appenders of the inode.
    #[display("append")]
    Append,
}

/// Whether opening also creates or truncates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum Creation {
    /// Open an existing file, fail if absent.
    #[default]
    #[display("open existing")]
    OpenExisting,
    /// Create a new file, fail if present.
    #[display("only if not exist")]
    OnlyIfNotExist,
    /// Open if present, create otherwise.
    #[display("if needed")]
    IfNeeded,
    /// Open an existing file and atomically truncate it, leaving the
    /// creation date unmodified.
    #[display("truncate existing")]
    TruncateExisting,
    /// Always create a fresh inode, replacing anything at the path.
    #[display("always new")]
    AlwaysNew,
}

/// The kernel caching policy for a handle.
///
/// Bit 0 of the discriminant being set means safety fsyncs apply (see
/// [`HandleFlags::DISABLE_SAFETY_FSYNCS`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum Caching {
    /// Keep the caching of an existing handle (clone only).
    #[display("unchanged")]
    Unchanged,
    /// No caching whatsoever (`O_DIRECT | O_SYNC`). All i/o must be
    /// sector-aligned.
    #[display("none")]
    None,
    /// Cache metadata but not data (`O_DIRECT`). All i/o must be
    /// sector-aligned.
    #[display("only metadata")]
    OnlyMetadata,
    /// Cache reads only; writes of data and metadata do not complete until
    /// reaching storage (`O_SYNC`).
    #[display("reads")]
    Reads,
    /// Cache reads and metadata writes; data writes reach storage before
    /// completing (`O_DSYNC`).
    #[display("reads and metadata")]
    ReadsAndMetadata,
    /// Default kernel caching.
    #[default]
    #[display("all")]
    All,
    /// Default kernel caching plus extra fsyncs at the points documented on
    /// [`HandleFlags::DISABLE_SAFETY_FSYNCS`].
    #[display("safety fsyncs")]
    SafetyFsyncs,
    /// Cache aggressively and only flush on last close; the file is expected
    /// to be temporary.
    #[display("temporary")]
    Temporary,
}

impl Caching {
    /// Whether this policy requires sector-aligned i/o.
    #[must_use]
    pub const fn requires_aligned_io(&self) -> bool {
        matches!(self, Self::None | Self::OnlyMetadata)
    }

    /// Whether the safety-fsync policy applies to this mode (several kernels
    /// document incomplete durability for exactly these).
    #[must_use]
    pub const fn wants_safety_fsyncs(&self) -> bool {
        matches!(self, Self::None | Self::Reads | Self::ReadsAndMetadata | Self::SafetyFsyncs)
    }
}

bitflags::bitflags! {
    /// Per-handle behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HandleFlags: u32 {
        /// Unlink the inode on the first close of this handle. On POSIX this
        /// is a plain `unlink` of `current_path()` (inode-checked unless
        /// [`Self::DISABLE_SAFETY_UNLINKS`]). On Windows without
        /// POSIX-semantics delete, the entry is renamed to a random
        /// 32-hex-character name suffixed `.deleted` and marked
        /// delete-on-close, unless [`Self::WIN_DISABLE_UNLINK_EMULATION`].
        const UNLINK_ON_FIRST_CLOSE = 1 << 0;

        /// Disable the extra fsyncs otherwise issued on truncate, close and
        /// (Linux only) the parent directory after create/close, for the
        /// caching modes where kernels document incomplete durability.
        const DISABLE_SAFETY_FSYNCS = 1 << 2;

        /// Skip the inode comparison before unlink/relink. Needed on Linux
        /// systems without `/proc`.
        const DISABLE_SAFETY_UNLINKS = 1 << 3;

        /// Ask the kernel to stop prefetching data for this handle.
        const DISABLE_PREFETCHING = 1 << 4;

        /// Ask the kernel to prefetch aggressively, possibly the whole file.
        const MAXIMUM_PREFETCHING = 1 << 5;

        /// See [`Self::UNLINK_ON_FIRST_CLOSE`].
        const WIN_DISABLE_UNLINK_EMULATION = 1 << 24;

        /// Do not opt newly created files into extents-based (sparse)
        /// storage on NTFS.
        const WIN_DISABLE_SPARSE_FILE_CREATION = 1 << 25;

        /// Create the handle multiplexable: `OVERLAPPED` on Windows,
        /// non-blocking on POSIX. Required for deadlined and multiplexed i/o.
        const OVERLAPPED = 1 << 28;

        /// Acknowledge use of POSIX byte-range locks, which are released
        /// when *any* descriptor to the file is closed in this process.
        const BYTE_LOCK_INSANITY = 1 << 29;

        /// The inode has no representation on the filing system.
        const ANONYMOUS_INODE = 1 << 30;
    }
}

/// An owning wrapper for one native handle.
///
/// On drop the native handle is closed; a close failure while i/o could
/// still be pending leaves dangling kernel callbacks, which is why close
/// failure in drop is fatal. Move transfers ownership and invalidates the
/// source; there is no copy — use [`clone`](Self::clone_handle) to duplicate
/// the kernel object.
#[derive(Debug, Default)]
pub struct Handle {
    native: NativeHandle,
    caching: Caching,
    flags: HandleFlags,
}

impl Handle {
    /// Takes ownership of a native handle.
    #[must_use]
    pub const fn from_native(native: NativeHandle, caching: Caching, flags: HandleFlags) -> Self {
        Self { native, caching, flags }
    }

    /// The invalid handle.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            native: NativeHandle::INVALID,
            caching: Caching::All,
            flags: HandleFlags::empty(),
        }
    }

    /// The native handle descriptor.
    #[must_use]
    pub const fn native(&self) -> &NativeHandle {
        &self.native
    }

    /// The caching policy chosen at open.
    #[must_use]
    pub const fn caching(&self) -> Caching {
        self.caching
    }

    /// The flags chosen at open.
    #[must_use]
    pub const fn flags(&self) -> HandleFlags {
        self.flags
    }

    pub(crate) fn flags_mut(&mut self) -> &mut HandleFlags {
        &mut self.flags
    }

    pub(crate) fn native_mut(&mut self) -> &mut NativeHandle {
        &mut self.native
    }

    /// Whether this handle refers to a kernel object.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.native.is_valid()
    }

    /// Whether the handle was opened multiplexable (deadlined i/o capable).
    #[must_use]
    pub const fn is_multiplexable(&self) -> bool {
        self.flags.contains(HandleFlags::OVERLAPPED)
    }

    /// Whether the safety-fsync policy is active for this handle.
    #[must_use]
    pub const fn wants_safety_fsyncs(&self) -> bool {
        self.caching.wants_safety_fsyncs() && !self.flags.contains(HandleFlags::DISABLE_SAFETY_FSYNCS)
    }

    /// Whether all i/o through this handle must be sector-aligned.
    #[must_use]
    pub const fn requires_aligned_io(&self) -> bool {
        self.caching.requires_aligned_io()
    }

    /// Closes the native handle. Closing an invalid handle is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the operating system error if the close call fails; the
    /// handle is invalidated regardless, since the kernel may have torn the
    /// object down anyway.
    pub fn close(&mut self) -> Result<()> {
        let native = self.native.take();
        if !native.is_valid() {
            return Ok(());
        }
        event!(Level::TRACE, handle = ?native, "close handle");
        close_native(&native)
    }

    /// Duplicates the underlying kernel object into a new, independently
    /// owned handle with the same caching and flags.
    pub fn clone_handle(&self) -> Result<Self> {
        let native = duplicate_native(&self.native)?;
        Ok(Self {
            native,
            caching: self.caching,
            flags: self.flags,
        })
    }

    /// Surrenders ownership of the native handle without closing it.
    #[must_use]
    pub fn release(mut self) -> NativeHandle {
        self.native.take()
    }

    /// Asks the operating system for a canonical path to the open inode.
    ///
    /// Always expensive. Returns an empty path for unlinked inodes. On Linux
    /// this requires `/proc` to be mounted.
    pub fn current_path(&self) -> Result<PathBuf> {
        current_path_of(&self.native)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let native = self.native.take();
        if !native.is_valid() {
            return;
        }
        if let Err(error) = close_native(&native) {
            // A failed close with i/o potentially in flight leaves dangling
            // kernel callbacks; continuing would be undefined behavior.
            event!(Level::ERROR, %error, handle = ?native, "fatal: closing handle failed in drop");
            std::process::abort();
        }
    }
}

#[cfg(unix)]
pub(crate) fn close_native(native: &NativeHandle) -> Result<()> {
    // SAFETY: we exclusively own this descriptor.
    if unsafe { libc::close(native.fd()) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn close_native(native: &NativeHandle) -> Result<()> {
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    // SAFETY: we exclusively own this handle.
    unsafe { CloseHandle(HANDLE(native.raw_handle())) }.map_err(|_| Error::last_os_error())
}

#[cfg(unix)]
pub(crate) fn duplicate_native(native: &NativeHandle) -> Result<NativeHandle> {
    if !native.is_valid() {
        return Err(Error::generic(Errc::InvalidArgument));
    }
    // SAFETY: plain descriptor duplication.
    let fd = unsafe { libc::fcntl(native.fd(), libc::F_DUPFD_CLOEXEC, 0) };
    if fd == -1 {
        return Err(Error::last_os_error());
    }
    Ok(NativeHandle::from_fd(fd, native.disposition))
}

#[cfg(windows)]
pub(crate) fn duplicate_native(native: &NativeHandle) -> Result<NativeHandle> {
    use windows::Win32::Foundation::{DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE};
    use windows::Win32::System::Threading::GetCurrentProcess;

    if !native.is_valid() {
        return Err(Error::generic(Errc::InvalidArgument));
    }
    let mut duplicated = HANDLE::default();
    // SAFETY: duplicating within our own process.
    unsafe {
        DuplicateHandle(
            GetCurrentProcess(),
            HANDLE(native.raw_handle()),
            GetCurrentProcess(),
            &mut duplicated,
            0,
            false,
            DUPLICATE_SAME_ACCESS,
        )
    }
    .map_err(|_| Error::last_os_error())?;
    Ok(NativeHandle::from_raw_handle(duplicated.0, native.disposition))
}

#[cfg(target_os = "linux")]
fn current_path_of(native: &NativeHandle) -> Result<PathBuf> {
    use std::os::unix::ffi::OsStringExt;

    if !native.is_valid() {
        return Err(Error::generic(Errc::InvalidArgument));
    }
    let link = format!("/proc/self/fd/{}", native.fd());
    let target = std::fs::read_link(&link).map_err(Error::from)?;
    // The kernel appends " (deleted)" once the inode is unlinked.
    let bytes = target.clone().into_os_string().into_vec();
    if bytes.ends_with(b" (deleted)") {
        return Ok(PathBuf::new());
    }
    Ok(target)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn current_path_of(native: &NativeHandle) -> Result<PathBuf> {
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;

    if !native.is_valid() {
        return Err(Error::generic(Errc::InvalidArgument));
    }
    let mut buffer = vec![0u8; libc::PATH_MAX as usize];
    // SAFETY: F_GETPATH fills up to PATH_MAX bytes, NUL terminated.
    if unsafe { libc::fcntl(native.fd(), libc::F_GETPATH, buffer.as_mut_ptr()) } == -1 {
        return Err(Error::last_os_error());
    }
    let len = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    buffer.truncate(len);
    Ok(PathBuf::from(OsString::from_vec(buffer)))
}

#[cfg(windows)]
fn current_path_of(native: &NativeHandle) -> Result<PathBuf> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{GetFinalPathNameByHandleW, VOLUME_NAME_DOS};

    if !native.is_valid() {
        return Err(Error::generic(Errc::InvalidArgument));
    }
    let mut buffer = vec![0u16; 32768];
    // SAFETY: buffer is large enough for any DOS path.
    let len = unsafe {
        GetFinalPathNameByHandleW(HANDLE(native.raw_handle()), &mut buffer, VOLUME_NAME_DOS)
    };
    if len == 0 {
        return Err(Error::last_os_error());
    }
    buffer.truncate(len as usize);
    Ok(PathBuf::from(OsString::from_wide(&buffer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use crate::native_handle::Disposition;

    #[cfg(unix)]
    fn open_scratch_file() -> (tempfile::TempDir, Handle) {
        use std::os::unix::io::IntoRawFd;

        let dir = tempfile::tempdir().expect("tempdir");
        let file = std::fs::File::create(dir.path().join("scratch")).expect("create");
        let native = NativeHandle::from_fd(
            file.into_raw_fd(),
            Disposition::WRITABLE | Disposition::SEEKABLE | Disposition::FILE,
        );
        (dir, Handle::from_native(native, Caching::All, HandleFlags::empty()))
    }

    #[test]
    fn invalid_handle_close_is_noop() {
        let mut handle = Handle::invalid();
        handle.close().expect("closing an invalid handle is a no-op");
        handle.close().expect("and stays one");
    }

    #[cfg(unix)]
    #[test]
    fn close_invalidates() {
        let (_dir, mut handle) = open_scratch_file();
        assert!(handle.is_valid());
        handle.close().expect("close");
        assert!(!handle.is_valid());
    }

    #[cfg(unix)]
    #[test]
    fn clone_is_independent() {
        let (_dir, mut handle) = open_scratch_file();
        let mut cloned = handle.clone_handle().expect("clone");
        assert_ne!(handle.native().fd(), cloned.native().fd());
        assert_eq!(cloned.caching(), handle.caching());
        handle.close().expect("close original");
        // The clone still refers to a live kernel object.
        cloned.current_path().expect("clone outlives original");
        cloned.close().expect("close clone");
    }

    #[cfg(unix)]
    #[test]
    fn release_surrenders_ownership() {
        let (_dir, handle) = open_scratch_file();
        let native = handle.release();
        assert!(native.is_valid());
        // We are now the owner; close manually.
        close_native(&native).expect("close released descriptor");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn current_path_resolves_and_empties_after_unlink() {
        let (dir, handle) = open_scratch_file();
        let path = handle.current_path().expect("current_path");
        assert_eq!(path, dir.path().join("scratch").canonicalize().expect("canonicalize"));

        std::fs::remove_file(dir.path().join("scratch")).expect("unlink");
        let path = handle.current_path().expect("current_path after unlink");
        assert!(path.as_os_str().is_empty(), "unlinked inode yields empty path");
    }

    #[test]
    fn safety_fsync_policy_follows_caching_and_flag() {
        let wants = Handle::from_native(NativeHandle::INVALID, Caching::Reads, HandleFlags::empty());
        assert!(wants.wants_safety_fsyncs());

        let disabled = Handle::from_native(
            NativeHandle::INVALID,
            Caching::Reads,
            HandleFlags::DISABLE_SAFETY_FSYNCS,
        );
        assert!(!disabled.wants_safety_fsyncs());

        let default_caching = Handle::from_native(NativeHandle::INVALID, Caching::All, HandleFlags::empty());
        assert!(!default_caching.wants_safety_fsyncs());
    }
}
