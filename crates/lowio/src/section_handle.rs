// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mappable memory sections.
//!
//! On Windows a section is a distinct NT kernel object; on POSIX there is no
//! such object, so a section is a cloned descriptor of its backing file plus
//! book-keeping. A section backed by no file owns a fresh anonymous temp
//! inode created in a discovered memory-backed (tmpfs/ramfs) directory, which
//! vanishes when the section is dropped.

use tracing::{event, Level};

use crate::file_handle::FileHandle;
use crate::handle::{Caching, Handle, HandleFlags};
use crate::io_handle::AsHandle;
use crate::map_handle::MemoryFlags;
use crate::native_handle::{Disposition, NativeHandle};
use crate::path_discovery;
use crate::path_handle::PathHandle;
use crate::{Errc, Error, Result};

/// A kernel memory section (Windows) or a mappable backing descriptor
/// (POSIX).
///
/// `length()` always equals the backing file's length, except when the
/// backing was truncated behind the section's back. The section's flags
/// bound the permissions of every [`MapHandle`](crate::MapHandle) view of
/// it.
#[derive(Debug)]
pub struct SectionHandle {
    handle: Handle,
    /// The anonymous inode this section owns, if it was created without a
    /// backing file.
    owned_backing: Option<FileHandle>,
    flags: MemoryFlags,
    anonymous: bool,
}

impl SectionHandle {
    /// Creates a section backed by `file`. The section borrows (clones) the
    /// backing descriptor; the file handle must outlive every map of the
    /// section.
    pub fn section(file: &FileHandle, flags: MemoryFlags) -> Result<Self> {
        let handle = os::section_of(file.as_handle(), flags)?;
        event!(Level::TRACE, ?flags, "created file-backed section");
        Ok(Self {
            handle,
            owned_backing: None,
            flags,
            anonymous: false,
        })
    }

    /// Creates a section of `bytes` bytes backed by a private anonymous
    /// temp inode under `dir` (or the discovered memory-backed temp
    /// directory when `dir` is `None`).
    pub fn anonymous(bytes: u64, flags: MemoryFlags, dir: Option<&PathHandle>) -> Result<Self> {
        let discovered_base;
        let base = match dir {
            Some(base) => base,
            None => {
                let found = path_discovery::memory_backed_temp_dir()?;
                discovered_base = PathHandle::path(None, pathview::PathView::new(found))?;
                &discovered_base
            }
        };
        let backing = FileHandle::temp_inode(Some(base), Caching::All, HandleFlags::empty())?;
        backing.truncate(bytes)?;
        let handle = os::section_of(backing.as_handle(), flags)?;
        event!(Level::TRACE, bytes, ?flags, "created anonymous section");
        Ok(Self {
            handle,
            owned_backing: Some(backing),
            flags,
            anonymous: true,
        })
    }

    /// The maximum extent a map over this section may cover: the backing
    /// file's current length.
    pub fn length(&self) -> Result<u64> {
        os::backing_length(self.backing_native())
    }

    /// Resizes the backing of an **anonymous** section. For file-backed
    /// sections this is a no-op on POSIX (there is no kernel section
    /// object); resize the backing file instead.
    pub fn truncate(&self, new_size: u64) -> Result<u64> {
        if !self.anonymous {
            return Ok(self.length()?);
        }
        let backing = self
            .owned_backing
            .as_ref()
            .ok_or_else(|| Error::generic(Errc::InvalidArgument))?;
        backing.truncate(new_size)
    }

    /// The permission bound for views of this section.
    #[must_use]
    pub const fn flags(&self) -> MemoryFlags {
        self.flags
    }

    /// Whether this section owns an anonymous backing inode.
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// The descriptor maps of this section are created from: the cloned
    /// backing descriptor on POSIX, the NT section object on Windows.
    #[must_use]
    pub(crate) fn backing_native(&self) -> &NativeHandle {
        self.handle.native()
    }
}

impl AsHandle for SectionHandle {
    fn as_handle(&self) -> &Handle {
        &self.handle
    }
}

#[cfg(unix)]
mod os {
    use super::*;

    pub(super) fn section_of(backing: &Handle, flags: MemoryFlags) -> Result<Handle> {
        // Unix has no kernel section object: the section is a cloned
        // descriptor of the backing.
        let _ = flags;
        let mut cloned = backing.clone_handle()?;
        cloned.native_mut().disposition |= Disposition::SECTION;
        Ok(cloned)
    }

    pub(super) fn backing_length(backing: &NativeHandle) -> Result<u64> {
        // SAFETY: out-param struct on the stack.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(backing.fd(), &mut stat) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(stat.st_size as u64)
    }
}

#[cfg(windows)]
mod os {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Memory::{
        CreateFileMappingW, PAGE_EXECUTE_READWRITE, PAGE_READONLY, PAGE_READWRITE,
        SEC_COMMIT, SEC_RESERVE,
    };

    use super::*;

    pub(super) fn section_of(backing: &Handle, flags: MemoryFlags) -> Result<Handle> {
        let protect = if flags.contains(MemoryFlags::EXECUTE) {
            PAGE_EXECUTE_READWRITE
        } else if flags.contains(MemoryFlags::WRITE) || flags.contains(MemoryFlags::COW) {
            PAGE_READWRITE
        } else {
            PAGE_READONLY
        };
        let section_flags = if flags.contains(MemoryFlags::NOCOMMIT) {
            SEC_RESERVE
        } else {
            SEC_COMMIT
        };
        // SAFETY: creating a section over a handle we borrow.
        let section = unsafe {
            CreateFileMappingW(
                HANDLE(backing.native().raw_handle()),
                None,
                windows::Win32::System::Memory::PAGE_PROTECTION_FLAGS(protect.0 | section_flags.0),
                0,
                0,
                None,
            )
        }
        .map_err(|_| Error::last_os_error())?;
        Ok(Handle::from_native(
            NativeHandle::from_raw_handle(section.0, Disposition::SECTION),
            Caching::All,
            HandleFlags::empty(),
        ))
    }

    pub(super) fn backing_length(backing: &NativeHandle) -> Result<u64> {
        use windows::Win32::Storage::FileSystem::GetFileSizeEx;
        let mut size = 0i64;
        // SAFETY: out-param on the stack.
        unsafe { GetFileSizeEx(HANDLE(backing.raw_handle()), &mut size) }
            .map_err(|_| Error::last_os_error())?;
        Ok(size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, ConstBuffer, IoRequest};
    use crate::io_handle::{BarrierKind, IoHandle};
    use crate::map_handle::{page_size, MapHandle};

    fn scratch_file(bytes: u64) -> (tempfile::TempDir, FileHandle) {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = PathHandle::path(None, pathview::PathView::new(dir.path())).expect("anchor");
        let file = FileHandle::file(
            Some(&base),
            pathview::PathView::new("backing"),
            crate::Mode::Write,
            crate::Creation::IfNeeded,
            Caching::All,
            HandleFlags::empty(),
        )
        .expect("create backing");
        file.truncate(bytes).expect("size backing");
        (dir, file)
    }

    #[test]
    fn section_length_tracks_backing() {
        let (_dir, file) = scratch_file(page_size() as u64 * 4);
        let section = SectionHandle::section(&file, MemoryFlags::readwrite()).expect("section");
        assert_eq!(section.length().expect("length"), page_size() as u64 * 4);

        file.truncate(page_size() as u64 * 8).expect("grow backing");
        assert_eq!(
            section.length().expect("length"),
            page_size() as u64 * 8,
            "section length follows the backing"
        );
    }

    #[test]
    fn anonymous_section_owns_its_inode() {
        let section =
            SectionHandle::anonymous(page_size() as u64, MemoryFlags::readwrite(), None)
                .expect("anonymous section");
        assert!(section.is_anonymous());
        assert_eq!(section.length().expect("length"), page_size() as u64);

        section.truncate(page_size() as u64 * 2).expect("truncate");
        assert_eq!(section.length().expect("length"), page_size() as u64 * 2);
    }

    #[test]
    fn file_backed_section_truncate_is_a_noop() {
        let (_dir, file) = scratch_file(page_size() as u64);
        let section = SectionHandle::section(&file, MemoryFlags::readwrite()).expect("section");
        let length = section.truncate(12345).expect("no-op truncate");
        assert_eq!(length, page_size() as u64, "file-backed truncate changes nothing");
    }

    #[test]
    fn two_maps_of_one_section_share_writes_after_barrier() {
        let (_dir, file) = scratch_file(page_size() as u64);
        let section = SectionHandle::section(&file, MemoryFlags::readwrite()).expect("section");

        let map_writer =
            MapHandle::map_section(&section, 0, 0, MemoryFlags::readwrite()).expect("map 1");
        let map_reader =
            MapHandle::map_section(&section, 0, 0, MemoryFlags::READ).expect("map 2");

        let payload = *b"shared view";
        let mut write_buffers = [ConstBuffer::new(&payload)];
        map_writer
            .write(IoRequest::new(&mut write_buffers, 64), None)
            .expect("write through map 1");
        map_writer
            .barrier(Some(64..64 + payload.len() as u64), BarrierKind::WaitDataOnly, None)
            .expect("barrier map 1");

        let mut scratch = [0u8; 11];
        let mut read_buffers = [Buffer::new(&mut scratch)];
        let read = map_reader
            .read(IoRequest::new(&mut read_buffers, 64), None)
            .expect("read through map 2");
        assert_eq!(read[0].as_slice(), b"shared view");
    }

    #[test]
    fn map_permissions_are_bounded_by_the_section() {
        let (_dir, file) = scratch_file(page_size() as u64);
        let section = SectionHandle::section(&file, MemoryFlags::READ).expect("read-only section");
        let map = MapHandle::map_section(&section, 0, 0, MemoryFlags::readwrite()).expect("map");
        // The write bit was stripped by the intersection.
        let payload = [0u8; 4];
        let mut buffers = [ConstBuffer::new(&payload)];
        let error = map.write(IoRequest::new(&mut buffers, 0), None).expect_err("read-only");
        assert_eq!(error.errc(), Some(Errc::PermissionDenied));
    }
}
