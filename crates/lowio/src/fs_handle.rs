// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use pathview::PathView;
use tracing::{event, Level};

use crate::io_handle::AsHandle;
use crate::path_handle::PathHandle;
use crate::{Errc, Error, Result};

/// The identity of an inode: device id plus inode number.
///
/// Two handles refer to the same file if and only if their `InodeId`s are
/// equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId {
    /// The id of the device holding the inode.
    pub device: u64,
    /// The inode number on that device.
    pub inode: u64,
}

/// Operations on handles that refer to an entry in a filing system.
///
/// `relink` and `unlink` act on the *inode the handle is open on*, not on
/// whatever currently occupies the path it was opened under. Where the
/// operating system has no race-free unlink-by-handle, the implementation
/// re-resolves `current_path()` and compares inodes first; the comparison
/// can be skipped with
/// [`HandleFlags::DISABLE_SAFETY_UNLINKS`](crate::HandleFlags::DISABLE_SAFETY_UNLINKS).
pub trait FsHandle: AsHandle {
    /// The identity of the open inode.
    fn unique_id(&self) -> Result<InodeId> {
        os::unique_id(self.as_handle())
    }

    /// Atomically renames the open inode to `new_path` relative to `base`,
    /// replacing anything already there.
    fn relink(&self, base: Option<&PathHandle>, new_path: PathView<'_>) -> Result<()> {
        let current = self.as_handle().current_path()?;
        if current.as_os_str().is_empty() {
            return Err(Error::generic(Errc::NoSuchFileOrDirectory));
        }
        self.check_inode_still_at(&current)?;
        os::relink(&current, base, new_path)?;
        event!(Level::TRACE, from = %current.display(), to = %new_path, "relinked inode");
        Ok(())
    }

    /// Unlinks the open inode from the filing system. The inode itself
    /// lives on until the last handle to it closes.
    fn unlink(&self) -> Result<()> {
        let current = self.as_handle().current_path()?;
        if current.as_os_str().is_empty() {
            // Already unlinked.
            return Ok(());
        }
        self.check_inode_still_at(&current)?;
        os::unlink(self.as_handle(), &current)?;
        event!(Level::TRACE, path = %current.display(), "unlinked inode");
        Ok(())
    }

    /// Opens the parent directory of the open inode as a path anchor.
    fn parent_path_handle(&self) -> Result<PathHandle> {
        let current = self.as_handle().current_path()?;
        if current.as_os_str().is_empty() {
            return Err(Error::generic(Errc::NoSuchFileOrDirectory));
        }
        let parent = PathView::new(&current).parent_path();
        if parent.is_empty() {
            return Err(Error::generic(Errc::NoSuchFileOrDirectory));
        }
        PathHandle::path(None, parent)
    }

    /// Verifies that `path` still resolves to this handle's inode, unless
    /// safety unlinks are disabled.
    #[doc(hidden)]
    fn check_inode_still_at(&self, path: &std::path::Path) -> Result<()> {
        if self
            .as_handle()
            .flags()
            .contains(crate::HandleFlags::DISABLE_SAFETY_UNLINKS)
        {
            return Ok(());
        }
        let ours = self.unique_id()?;
        let theirs = os::path_inode_id(path)?;
        if ours != theirs {
            // Someone renamed another file over our path since we opened.
            return Err(Error::generic(Errc::NoSuchFileOrDirectory).with_path(path));
        }
        Ok(())
    }
}

#[cfg(unix)]
mod os {
    use std::path::Path;

    use pathview::PathView;

    use crate::handle::Handle;
    use crate::path_handle::PathHandle;
    use crate::utils::to_cstring;
    use crate::{Error, InodeId, Result};

    pub(super) fn unique_id(handle: &Handle) -> Result<InodeId> {
        // SAFETY: out-param struct on the stack.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(handle.native().fd(), &mut stat) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(InodeId {
            device: stat.st_dev as u64,
            inode: stat.st_ino as u64,
        })
    }

    pub(super) fn path_inode_id(path: &Path) -> Result<InodeId> {
        let c_path = to_cstring(path)?;
        // SAFETY: out-param struct on the stack, NUL-terminated path.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::lstat(c_path.as_ptr(), &mut stat) } == -1 {
            return Err(Error::last_os_error().with_path(path));
        }
        Ok(InodeId {
            device: stat.st_dev as u64,
            inode: stat.st_ino as u64,
        })
    }

    pub(super) fn relink(current: &Path, base: Option<&PathHandle>, new_path: PathView<'_>) -> Result<()> {
        let c_old = to_cstring(current)?;
        let c_new = to_cstring(new_path.as_path())?;
        // SAFETY: NUL-terminated paths; new path resolves against the base
        // anchor's descriptor.
        let rc = unsafe {
            libc::renameat(
                libc::AT_FDCWD,
                c_old.as_ptr(),
                PathHandle::base_fd(base),
                c_new.as_ptr(),
            )
        };
        if rc == -1 {
            return Err(Error::last_os_error()
                .with_path(current)
                .with_path(new_path.as_path()));
        }
        Ok(())
    }

    pub(super) fn unlink(_handle: &Handle, current: &Path) -> Result<()> {
        let c_path = to_cstring(current)?;
        // SAFETY: NUL-terminated path.
        if unsafe { libc::unlink(c_path.as_ptr()) } == -1 {
            return Err(Error::last_os_error().with_path(current));
        }
        Ok(())
    }
}

#[cfg(windows)]
mod os {
    use std::path::Path;

    use pathview::PathView;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::{
        GetFileInformationByHandle, MoveFileExW, BY_HANDLE_FILE_INFORMATION,
        MOVEFILE_REPLACE_EXISTING,
    };

    use crate::handle::Handle;
    use crate::path_handle::PathHandle;
    use crate::{Error, InodeId, Result};

    fn wide(path: &Path) -> Vec<u16> {
        use std::os::windows::ffi::OsStrExt;
        let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
        wide.push(0);
        wide
    }

    pub(super) fn unique_id(handle: &Handle) -> Result<InodeId> {
        let mut info = BY_HANDLE_FILE_INFORMATION::default();
        // SAFETY: out-param struct on the stack.
        unsafe { GetFileInformationByHandle(HANDLE(handle.native().raw_handle()), &mut info) }
            .map_err(|_| Error::last_os_error())?;
        Ok(InodeId {
            device: u64::from(info.dwVolumeSerialNumber),
            inode: (u64::from(info.nFileIndexHigh) << 32) | u64::from(info.nFileIndexLow),
        })
    }

    pub(super) fn path_inode_id(path: &Path) -> Result<InodeId> {
        let file = std::fs::File::open(path).map_err(|e| Error::from(e).with_path(path))?;
        use std::os::windows::io::AsRawHandle;
        let mut info = BY_HANDLE_FILE_INFORMATION::default();
        // SAFETY: out-param struct on the stack.
        unsafe { GetFileInformationByHandle(HANDLE(file.as_raw_handle()), &mut info) }
            .map_err(|_| Error::last_os_error())?;
        Ok(InodeId {
            device: u64::from(info.dwVolumeSerialNumber),
            inode: (u64::from(info.nFileIndexHigh) << 32) | u64::from(info.nFileIndexLow),
        })
    }

    pub(super) fn relink(current: &Path, base: Option<&PathHandle>, new_path: PathView<'_>) -> Result<()> {
        use crate::io_handle::AsHandle;
        let resolved = match base {
            Some(b) => b.as_handle().current_path()?.join(new_path.as_path()),
            None => new_path.as_path().to_path_buf(),
        };
        let old = wide(current);
        let new = wide(&resolved);
        // SAFETY: NUL-terminated wide paths.
        unsafe {
            MoveFileExW(
                windows::core::PCWSTR(old.as_ptr()),
                windows::core::PCWSTR(new.as_ptr()),
                MOVEFILE_REPLACE_EXISTING,
            )
        }
        .map_err(|_| Error::last_os_error().with_path(current).with_path(&resolved))
    }

    pub(super) fn unlink(handle: &Handle, current: &Path) -> Result<()> {
        use windows::Win32::Storage::FileSystem::{
            SetFileInformationByHandle, FileDispositionInfoEx, FILE_DISPOSITION_INFO_EX,
        };

        const FILE_DISPOSITION_FLAG_DELETE: u32 = 0x1;
        const FILE_DISPOSITION_FLAG_POSIX_SEMANTICS: u32 = 0x2;

        let h = HANDLE(handle.native().raw_handle());

        // Windows 10 1709+ can unlink the open inode with POSIX semantics:
        // the name disappears immediately, exactly like unlink(2).
        let info = FILE_DISPOSITION_INFO_EX {
            Flags: FILE_DISPOSITION_FLAG_DELETE | FILE_DISPOSITION_FLAG_POSIX_SEMANTICS,
        };
        // SAFETY: info is a live local struct of the advertised class.
        let posix_delete = unsafe {
            SetFileInformationByHandle(
                h,
                FileDispositionInfoEx,
                std::ptr::from_ref(&info).cast(),
                std::mem::size_of::<FILE_DISPOSITION_INFO_EX>() as u32,
            )
        };
        if posix_delete.is_ok() {
            return Ok(());
        }

        if handle
            .flags()
            .contains(crate::HandleFlags::WIN_DISABLE_UNLINK_EMULATION)
        {
            return std::fs::remove_file(current).map_err(|e| Error::from(e).with_path(current));
        }

        // Older editions: the entry cannot vanish while handles are open,
        // so rename it out of the way (32 hex chars + ".deleted", which
        // enumeration's fastdeleted filter hides) and mark delete-on-close.
        let hidden = current.with_file_name(format!("{}.deleted", crate::utils::temp_file_name()));
        let old = wide(current);
        let new = wide(&hidden);
        // SAFETY: NUL-terminated wide paths.
        unsafe {
            MoveFileExW(
                windows::core::PCWSTR(old.as_ptr()),
                windows::core::PCWSTR(new.as_ptr()),
                MOVEFILE_REPLACE_EXISTING,
            )
        }
        .map_err(|_| Error::last_os_error().with_path(current))?;
        std::fs::remove_file(&hidden).map_err(|e| Error::from(e).with_path(&hidden))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_handle::FileHandle;
    use crate::handle::{Caching, Creation, Mode};
    use crate::HandleFlags;

    fn open_in(dir: &std::path::Path, name: &str, creation: Creation) -> Result<FileHandle> {
        let base = PathHandle::path(None, PathView::new(dir))?;
        FileHandle::file(
            Some(&base),
            PathView::new(name),
            Mode::Write,
            creation,
            Caching::All,
            HandleFlags::empty(),
        )
    }

    #[test]
    fn unique_id_matches_across_handles_to_same_inode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = open_in(dir.path(), "f", Creation::IfNeeded).expect("create");
        let b = open_in(dir.path(), "f", Creation::OpenExisting).expect("reopen");
        assert_eq!(a.unique_id().expect("id a"), b.unique_id().expect("id b"));

        let c = open_in(dir.path(), "g", Creation::IfNeeded).expect("other");
        assert_ne!(a.unique_id().expect("id a"), c.unique_id().expect("id c"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn relink_moves_the_inode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_in(dir.path(), "before", Creation::IfNeeded).expect("create");
        let id = file.unique_id().expect("id");

        let base = PathHandle::path(None, PathView::new(dir.path())).expect("anchor");
        file.relink(Some(&base), PathView::new("after")).expect("relink");

        assert!(!dir.path().join("before").exists());
        let reopened = open_in(dir.path(), "after", Creation::OpenExisting).expect("reopen");
        assert_eq!(reopened.unique_id().expect("id"), id);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unlink_removes_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_in(dir.path(), "doomed", Creation::IfNeeded).expect("create");
        file.unlink().expect("unlink");
        assert!(!dir.path().join("doomed").exists());
        // The handle stays usable on the orphaned inode.
        file.unique_id().expect("inode survives");
    }

    #[cfg(unix)]
    #[test]
    fn safety_check_detects_a_foreign_inode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = open_in(dir.path(), "victim", Creation::IfNeeded).expect("create");

        let impostor = dir.path().join("impostor");
        std::fs::write(&impostor, b"impostor").expect("write impostor");

        let error = file
            .check_inode_still_at(&impostor)
            .expect_err("a different inode at the path must be rejected");
        assert_eq!(error.errc(), Some(Errc::NoSuchFileOrDirectory));

        // The path the handle is really at passes the check.
        file.check_inode_still_at(&dir.path().join("victim")).expect("same inode");
    }

    #[cfg(unix)]
    #[test]
    fn disabled_safety_skips_the_inode_comparison() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = PathHandle::path(None, PathView::new(dir.path())).expect("anchor");
        let file = FileHandle::file(
            Some(&base),
            PathView::new("f"),
            Mode::Write,
            Creation::IfNeeded,
            Caching::All,
            HandleFlags::DISABLE_SAFETY_UNLINKS,
        )
        .expect("create");

        let impostor = dir.path().join("impostor");
        std::fs::write(&impostor, b"impostor").expect("write impostor");
        file.check_inode_still_at(&impostor).expect("check disabled");
    }
}
