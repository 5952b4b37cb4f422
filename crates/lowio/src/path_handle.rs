// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use pathview::PathView;

use crate::handle::{Caching, Handle, HandleFlags};
use crate::io_handle::AsHandle;
use crate::native_handle::{Disposition, NativeHandle};
use crate::{Error, Result};

/// A handle whose only permitted use is as the base directory for relative
/// opens.
///
/// Anchoring path resolution to a kernel-resolved inode removes the
/// time-of-check/time-of-use races of absolute-path lookups: once a
/// `PathHandle` is open, renames of any ancestor cannot redirect where
/// relative opens land. A `PathHandle` carries no i/o surface.
#[derive(Debug)]
pub struct PathHandle {
    handle: Handle,
}

impl PathHandle {
    /// Opens `path` (relative to `base`, or to the current directory if
    /// `base` is `None`) as a path-only directory anchor.
    pub fn path(base: Option<&PathHandle>, path: PathView<'_>) -> Result<Self> {
        let native = os_open_path(base, path)?;
        Ok(Self {
            handle: Handle::from_native(native, Caching::All, HandleFlags::empty()),
        })
    }

    /// Wraps an already-open directory handle.
    pub(crate) const fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    /// Surrenders the inner handle.
    #[cfg(windows)]
    pub(crate) fn into_handle(mut self) -> Handle {
        std::mem::take(&mut self.handle)
    }

    /// Duplicates the anchor.
    pub fn clone_handle(&self) -> Result<Self> {
        Ok(Self {
            handle: self.handle.clone_handle()?,
        })
    }

    /// The directory descriptor relative opens resolve against, or the
    /// platform's "current directory" sentinel when `base` is `None`.
    #[cfg(unix)]
    pub(crate) fn base_fd(base: Option<&Self>) -> std::os::unix::io::RawFd {
        base.map_or(libc::AT_FDCWD, |b| b.handle.native().fd())
    }
}

impl AsHandle for PathHandle {
    fn as_handle(&self) -> &Handle {
        &self.handle
    }
}

#[cfg(unix)]
fn os_open_path(base: Option<&PathHandle>, path: PathView<'_>) -> Result<NativeHandle> {
    let c_path = crate::utils::to_cstring(path.as_path())?;

    #[cfg(target_os = "linux")]
    let oflags = libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC;
    #[cfg(not(target_os = "linux"))]
    let oflags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;

    // SAFETY: NUL-terminated path, owned base descriptor.
    let fd = unsafe { libc::openat(PathHandle::base_fd(base), c_path.as_ptr(), oflags) };
    if fd == -1 {
        return Err(Error::last_os_error().with_path(path.as_path()));
    }
    Ok(NativeHandle::from_fd(fd, Disposition::DIRECTORY))
}

#[cfg(windows)]
fn os_open_path(base: Option<&PathHandle>, path: PathView<'_>) -> Result<NativeHandle> {
    use std::os::windows::ffi::OsStrExt;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::GENERIC_READ;
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, FILE_FLAG_BACKUP_SEMANTICS, FILE_SHARE_DELETE, FILE_SHARE_READ,
        FILE_SHARE_WRITE, OPEN_EXISTING,
    };

    let resolved = match base {
        Some(b) => b.as_handle().current_path()?.join(path.as_path()),
        None => path.as_path().to_path_buf(),
    };
    let mut wide: Vec<u16> = resolved.as_os_str().encode_wide().collect();
    wide.push(0);
    // SAFETY: NUL-terminated wide path.
    let handle = unsafe {
        CreateFileW(
            PCWSTR(wide.as_ptr()),
            GENERIC_READ.0,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            None,
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS,
            None,
        )
    }
    .map_err(|_| Error::last_os_error().with_path(path.as_path()))?;
    Ok(NativeHandle::from_raw_handle(handle.0, Disposition::DIRECTORY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Errc;

    #[test]
    fn opens_a_directory_anchor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let anchor = PathHandle::path(None, PathView::new(dir.path())).expect("open anchor");
        assert!(anchor.as_handle().is_valid());
        assert!(anchor.as_handle().native().disposition.contains(Disposition::DIRECTORY));
    }

    #[test]
    fn refuses_a_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        let error = PathHandle::path(None, PathView::new(&missing)).expect_err("must fail");
        assert_eq!(error.errc(), Some(Errc::NoSuchFileOrDirectory));
        assert_eq!(error.path(), Some(missing.as_path()));
    }

    #[test]
    fn anchors_relative_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("inner")).expect("mkdir");
        let anchor = PathHandle::path(None, PathView::new(dir.path())).expect("outer");
        let inner = PathHandle::path(Some(&anchor), PathView::new("inner")).expect("inner");
        assert!(inner.as_handle().is_valid());
    }
}
