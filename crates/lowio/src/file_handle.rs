// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Regular file handles.
//!
//! A [`FileHandle`] composes the byte i/o of [`IoHandle`] with the inode
//! operations of [`FsHandle`]. Creation goes through static factories which
//! either succeed with a valid handle or fail with no observable side effect
//! on the filing system.

use std::ops::Range;

use pathview::PathView;
use tracing::{event, Level};

use crate::fs_handle::FsHandle;
use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
use crate::io_handle::{AsHandle, IoHandle};
use crate::path_discovery;
use crate::path_handle::PathHandle;
use crate::utils::temp_file_name;
use crate::{Errc, Error, Result};

/// A handle to a regular file.
#[derive(Debug)]
pub struct FileHandle {
    handle: Handle,
}

impl FileHandle {
    /// Opens or creates a file at `path` relative to `base` (or the current
    /// directory when `base` is `None`).
    pub fn file(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        let handle = os::open_file(base, path, mode, creation, caching, flags)?;
        event!(Level::TRACE, path = %path, %mode, %creation, %caching, "opened file");
        Ok(Self { handle })
    }

    /// Creates a file with a fresh random 32-hex-character name under
    /// `base`, retrying on collision.
    pub fn random_file(
        base: Option<&PathHandle>,
        mode: Mode,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        loop {
            let name = temp_file_name();
            match Self::file(
                base,
                PathView::new(&name),
                mode,
                Creation::OnlyIfNotExist,
                caching,
                flags,
            ) {
                Ok(file) => return Ok(file),
                Err(error) if error.errc() == Some(Errc::FileExists) => {}
                Err(error) => return Err(error),
            }
        }
    }

    /// Opens or creates `name` under the discovered system temporary
    /// directory. An empty `name` defers to [`random_file`](Self::random_file)
    /// and ignores `creation`.
    pub fn temp_file(
        name: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        let dir = path_discovery::storage_backed_temp_dir()?;
        let base = PathHandle::path(None, PathView::new(dir))?;
        if name.is_empty() {
            return Self::random_file(Some(&base), mode, caching, flags);
        }
        Self::file(Some(&base), name, mode, creation, caching, flags)
    }

    /// Creates an inode with no reachable path, open read/write.
    ///
    /// On Linux this is `O_TMPFILE`; elsewhere the file is created with a
    /// random name and immediately unlinked.
    pub fn temp_inode(base: Option<&PathHandle>, caching: Caching, flags: HandleFlags) -> Result<Self> {
        let flags = flags | HandleFlags::ANONYMOUS_INODE;
        let storage_base;
        let base = match base {
            Some(base) => base,
            None => {
                let dir = path_discovery::storage_backed_temp_dir()?;
                storage_base = PathHandle::path(None, PathView::new(dir))?;
                &storage_base
            }
        };
        os::temp_inode(base, caching, flags).map(|handle| Self { handle })
    }

    /// Wraps an already-open handle.
    pub(crate) const fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    /// The file's length in bytes.
    pub fn length(&self) -> Result<u64> {
        os::length(&self.handle)
    }

    /// Sets the file's length, extending with zeros or dropping the tail.
    /// Issues a safety fsync afterwards when the policy calls for one.
    pub fn truncate(&self, new_length: u64) -> Result<u64> {
        os::truncate(&self.handle, new_length)?;
        if self.handle.wants_safety_fsyncs() {
            os::fsync(&self.handle)?;
        }
        Ok(new_length)
    }

    /// The allocated regions of the file, in offset order. The gaps between
    /// them are holes reading as zeros.
    pub fn extents(&self) -> Result<Vec<Range<u64>>> {
        os::extents(&self.handle)
    }

    /// Fills `range` with zeros, deallocating (hole punching) the underlying
    /// extents where the filing system supports it.
    pub fn zero(&self, range: Range<u64>) -> Result<()> {
        if range.start > range.end {
            return Err(Error::generic(Errc::ArgumentOutOfDomain));
        }
        os::zero_range(&self.handle, &range)
    }

    /// Duplicates the native handle into a new, independently owned
    /// `FileHandle` onto the same inode.
    pub fn clone_handle(&self) -> Result<Self> {
        Ok(Self {
            handle: self.handle.clone_handle()?,
        })
    }

    /// Clones this file's content into `destination`.
    ///
    /// On filing systems with copy-on-write cloning (reflink), the two files
    /// share physical extents afterwards; otherwise the bytes are copied by
    /// range. Returns the number of bytes in the destination.
    pub fn clone_extents_to(&self, destination: &Self) -> Result<u64> {
        let length = self.length()?;
        os::clone_or_copy(&self.handle, &destination.handle, length)?;
        Ok(length)
    }

    /// Closes the handle, honoring unlink-on-first-close and the safety
    /// fsync policy.
    pub fn close(mut self) -> Result<()> {
        self.pre_close();
        self.handle.close()
    }

    fn pre_close(&mut self) {
        if !self.handle.is_valid() {
            return;
        }
        if self.handle.flags().contains(HandleFlags::UNLINK_ON_FIRST_CLOSE)
            && !self.handle.flags().contains(HandleFlags::ANONYMOUS_INODE)
        {
            if let Err(error) = self.unlink() {
                event!(Level::WARN, %error, "unlink on first close failed");
            }
            // One shot, even if the handle is cloned and closed again.
            self.handle.flags_mut().remove(HandleFlags::UNLINK_ON_FIRST_CLOSE);
        }
        if self.handle.wants_safety_fsyncs() {
            if let Err(error) = os::fsync(&self.handle) {
                event!(Level::WARN, %error, "safety fsync on close failed");
            }
        }
    }
}

impl AsHandle for FileHandle {
    fn as_handle(&self) -> &Handle {
        &self.handle
    }
}

impl IoHandle for FileHandle {}

impl FsHandle for FileHandle {}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.pre_close();
        // The inner Handle's drop closes the descriptor.
    }
}

#[cfg(unix)]
mod os {
    use std::ops::Range;

    use pathview::PathView;

    use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
    use crate::native_handle::{Disposition, NativeHandle};
    use crate::path_handle::PathHandle;
    use crate::utils::to_cstring;
    use crate::{Errc, Error, Result};

    const CREATE_PERMISSIONS: libc::mode_t = 0o660;

    fn mode_to_oflags(mode: Mode) -> Result<libc::c_int> {
        Ok(match mode {
            Mode::Unchanged => return Err(Error::generic(Errc::InvalidArgument)),
            Mode::None | Mode::AttrRead | Mode::AttrWrite | Mode::Read => libc::O_RDONLY,
            Mode::Write => libc::O_RDWR,
            Mode::Append => libc::O_WRONLY | libc::O_APPEND,
        })
    }

    fn caching_to_oflags(caching: Caching) -> Result<libc::c_int> {
        #[cfg(target_os = "linux")]
        let direct = libc::O_DIRECT;
        #[cfg(not(target_os = "linux"))]
        let direct = 0;
        Ok(match caching {
            Caching::Unchanged => return Err(Error::generic(Errc::InvalidArgument)),
            Caching::None => direct | libc::O_SYNC,
            Caching::OnlyMetadata => direct,
            Caching::Reads => libc::O_SYNC,
            Caching::ReadsAndMetadata => libc::O_DSYNC,
            Caching::All | Caching::SafetyFsyncs | Caching::Temporary => 0,
        })
    }

    fn disposition_of(mode: Mode, caching: Caching, flags: HandleFlags) -> Disposition {
        let mut disposition = Disposition::FILE | Disposition::SEEKABLE;
        match mode {
            Mode::Read | Mode::AttrRead => disposition |= Disposition::READABLE,
            Mode::Write | Mode::AttrWrite => {
                disposition |= Disposition::READABLE | Disposition::WRITABLE;
            }
            Mode::Append => disposition |= Disposition::WRITABLE | Disposition::APPEND_ONLY,
            Mode::Unchanged | Mode::None => {}
        }
        if caching.requires_aligned_io() {
            disposition |= Disposition::ALIGNED_IO;
        }
        if flags.contains(HandleFlags::OVERLAPPED) {
            disposition |= Disposition::OVERLAPPED;
        }
        disposition
    }

    fn apply_prefetch_hints(fd: libc::c_int, flags: HandleFlags) {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: advisory only; failures are ignored.
            unsafe {
                if flags.contains(HandleFlags::DISABLE_PREFETCHING) {
                    let _ = libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_RANDOM);
                } else if flags.contains(HandleFlags::MAXIMUM_PREFETCHING) {
                    let _ = libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
                    let _ = libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_WILLNEED);
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = (fd, flags);
    }

    pub(super) fn open_file(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Handle> {
        let c_path = to_cstring(path.as_path())?;
        let base_oflags = mode_to_oflags(mode)? | caching_to_oflags(caching)? | libc::O_CLOEXEC;

        let mut attempts = 0;
        let fd = loop {
            let creation_oflags = match creation {
                Creation::OpenExisting => 0,
                Creation::OnlyIfNotExist | Creation::AlwaysNew => libc::O_CREAT | libc::O_EXCL,
                Creation::IfNeeded => libc::O_CREAT,
                Creation::TruncateExisting => libc::O_TRUNC,
            };
            // SAFETY: NUL-terminated path, owned base descriptor.
            let fd = unsafe {
                libc::openat(
                    PathHandle::base_fd(base),
                    c_path.as_ptr(),
                    base_oflags | creation_oflags,
                    libc::c_uint::from(CREATE_PERMISSIONS),
                )
            };
            if fd != -1 {
                break fd;
            }
            let error = Error::last_os_error().with_path(path.as_path());
            // AlwaysNew replaces whatever already occupies the path.
            if creation == Creation::AlwaysNew && error.errc() == Some(Errc::FileExists) && attempts < 16 {
                attempts += 1;
                // SAFETY: NUL-terminated path.
                let _ = unsafe { libc::unlinkat(PathHandle::base_fd(base), c_path.as_ptr(), 0) };
                continue;
            }
            return Err(error);
        };

        apply_prefetch_hints(fd, flags);

        let created = matches!(
            creation,
            Creation::OnlyIfNotExist | Creation::IfNeeded | Creation::AlwaysNew
        );
        let handle = Handle::from_native(
            NativeHandle::from_fd(fd, disposition_of(mode, caching, flags)),
            caching,
            flags,
        );
        if created && handle.wants_safety_fsyncs() {
            fsync_parent_directory(base);
        }
        Ok(handle)
    }

    pub(super) fn temp_inode(base: &PathHandle, caching: Caching, flags: HandleFlags) -> Result<Handle> {
        #[cfg(target_os = "linux")]
        {
            let oflags =
                libc::O_TMPFILE | libc::O_EXCL | libc::O_RDWR | libc::O_CLOEXEC | caching_to_oflags(caching)?;
            // SAFETY: "." relative to the base anchor.
            let fd = unsafe {
                libc::openat(
                    PathHandle::base_fd(Some(base)),
                    c".".as_ptr(),
                    oflags,
                    libc::c_uint::from(CREATE_PERMISSIONS),
                )
            };
            if fd != -1 {
                return Ok(Handle::from_native(
                    NativeHandle::from_fd(fd, disposition_of(Mode::Write, caching, flags)),
                    caching,
                    flags,
                ));
            }
            // Filesystems without O_TMPFILE fall through to the unlink dance.
        }

        // Create with an unguessable name, then immediately unlink it.
        loop {
            let name = temp_name_cstring()?;
            // SAFETY: NUL-terminated fresh random name.
            let fd = unsafe {
                libc::openat(
                    PathHandle::base_fd(Some(base)),
                    name.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC | caching_to_oflags(caching)?,
                    libc::c_uint::from(CREATE_PERMISSIONS),
                )
            };
            if fd == -1 {
                let error = Error::last_os_error();
                if error.errc() == Some(Errc::FileExists) {
                    continue;
                }
                return Err(error);
            }
            // SAFETY: unlinking the name we just created.
            let _ = unsafe { libc::unlinkat(PathHandle::base_fd(Some(base)), name.as_ptr(), 0) };
            return Ok(Handle::from_native(
                NativeHandle::from_fd(fd, disposition_of(Mode::Write, caching, flags)),
                caching,
                flags,
            ));
        }
    }

    fn temp_name_cstring() -> Result<std::ffi::CString> {
        std::ffi::CString::new(crate::utils::temp_file_name())
            .map_err(|_| Error::generic(Errc::InvalidArgument))
    }

    /// Linux-only: fsync the base directory so a freshly created name
    /// reaches storage.
    fn fsync_parent_directory(base: Option<&PathHandle>) {
        #[cfg(target_os = "linux")]
        if let Some(base) = base {
            // The anchor is O_PATH, which cannot be fsynced; reopen it.
            // SAFETY: "." relative to the base anchor, plain fsync + close.
            unsafe {
                let fd = libc::openat(
                    PathHandle::base_fd(Some(base)),
                    c".".as_ptr(),
                    libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
                );
                if fd != -1 {
                    let _ = libc::fsync(fd);
                    let _ = libc::close(fd);
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = base;
    }

    pub(super) fn length(handle: &Handle) -> Result<u64> {
        // SAFETY: out-param struct on the stack.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(handle.native().fd(), &mut stat) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(stat.st_size as u64)
    }

    pub(super) fn truncate(handle: &Handle, new_length: u64) -> Result<()> {
        // SAFETY: plain ftruncate of our own descriptor.
        if unsafe { libc::ftruncate(handle.native().fd(), new_length as libc::off_t) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn fsync(handle: &Handle) -> Result<()> {
        // SAFETY: plain fsync of our own descriptor.
        if unsafe { libc::fsync(handle.native().fd()) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn extents(handle: &Handle) -> Result<Vec<Range<u64>>> {
        let length = length(handle)?;
        let fd = handle.native().fd();
        let mut extents = Vec::new();
        let mut cursor: libc::off_t = 0;
        loop {
            // SAFETY: querying our own descriptor.
            let data = unsafe { libc::lseek(fd, cursor, libc::SEEK_DATA) };
            if data == -1 {
                let errno = std::io::Error::last_os_error().raw_os_error();
                match errno {
                    // No more data until end of file.
                    Some(libc::ENXIO) => break,
                    // Filesystem cannot enumerate holes: one big extent.
                    Some(libc::EINVAL | libc::EOPNOTSUPP) => {
                        if length > 0 {
                            return Ok(vec![0..length]);
                        }
                        return Ok(Vec::new());
                    }
                    _ => return Err(Error::last_os_error()),
                }
            }
            // SAFETY: as above.
            let hole = unsafe { libc::lseek(fd, data, libc::SEEK_HOLE) };
            if hole == -1 {
                return Err(Error::last_os_error());
            }
            extents.push(data as u64..hole as u64);
            cursor = hole;
            if cursor as u64 >= length {
                break;
            }
        }
        Ok(extents)
    }

    pub(super) fn zero_range(handle: &Handle, range: &Range<u64>) -> Result<()> {
        let fd = handle.native().fd();
        let len = range.end - range.start;
        if len == 0 {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            // SAFETY: punching a hole in our own file.
            let rc = unsafe {
                libc::fallocate(
                    fd,
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    range.start as libc::off_t,
                    len as libc::off_t,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            // Filesystems without hole punching fall through to writing
            // zeros.
        }
        let zeros = vec![0u8; 64 * 1024];
        let mut offset = range.start;
        while offset < range.end {
            let chunk = ((range.end - offset) as usize).min(zeros.len());
            // SAFETY: writing from a live local buffer.
            let written = unsafe {
                libc::pwrite(fd, zeros.as_ptr().cast(), chunk, offset as libc::off_t)
            };
            if written <= 0 {
                return Err(Error::last_os_error());
            }
            offset += written as u64;
        }
        Ok(())
    }

    pub(super) fn clone_or_copy(source: &Handle, destination: &Handle, length: u64) -> Result<()> {
        let src = source.native().fd();
        let dst = destination.native().fd();

        #[cfg(target_os = "linux")]
        {
            const FICLONE: libc::c_ulong = 0x4004_9409;
            // SAFETY: both descriptors are ours; FICLONE takes the source fd.
            if unsafe { libc::ioctl(dst, FICLONE, src) } == 0 {
                return Ok(());
            }
            // Reflink unsupported across this pair; fall back to range copy.
            let mut remaining = length as i64;
            let mut src_offset: libc::loff_t = 0;
            let mut dst_offset: libc::loff_t = 0;
            while remaining > 0 {
                // SAFETY: kernel-side copy between our own descriptors.
                let copied = unsafe {
                    libc::copy_file_range(
                        src,
                        &mut src_offset,
                        dst,
                        &mut dst_offset,
                        remaining as usize,
                        0,
                    )
                };
                match copied {
                    1.. => remaining -= copied as i64,
                    0 => break,
                    _ => {
                        let errno = std::io::Error::last_os_error().raw_os_error();
                        if matches!(errno, Some(libc::EXDEV | libc::EINVAL | libc::EOPNOTSUPP))
                            && src_offset == 0
                        {
                            // Ancient kernel or filesystem: plain copy below.
                            break;
                        }
                        return Err(Error::last_os_error());
                    }
                }
            }
            if remaining <= 0 {
                return Ok(());
            }
        }

        userspace_copy(src, dst, length)
    }

    fn userspace_copy(src: libc::c_int, dst: libc::c_int, length: u64) -> Result<()> {
        let mut buffer = vec![0u8; 128 * 1024];
        let mut offset: u64 = 0;
        while offset < length {
            let want = ((length - offset) as usize).min(buffer.len());
            // SAFETY: reading into a live local buffer.
            let got = unsafe {
                libc::pread(src, buffer.as_mut_ptr().cast(), want, offset as libc::off_t)
            };
            if got < 0 {
                return Err(Error::last_os_error());
            }
            if got == 0 {
                break;
            }
            let mut written_total = 0usize;
            while written_total < got as usize {
                // SAFETY: writing from the bytes just read.
                let written = unsafe {
                    libc::pwrite(
                        dst,
                        buffer[written_total..].as_ptr().cast(),
                        got as usize - written_total,
                        (offset + written_total as u64) as libc::off_t,
                    )
                };
                if written <= 0 {
                    return Err(Error::last_os_error());
                }
                written_total += written as usize;
            }
            offset += got as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod os {
    use std::ops::Range;

    use pathview::PathView;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{GENERIC_READ, GENERIC_WRITE, HANDLE};
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, SetEndOfFile, SetFilePointerEx, FILE_ATTRIBUTE_NORMAL,
        FILE_ATTRIBUTE_TEMPORARY, FILE_BEGIN, FILE_FLAG_DELETE_ON_CLOSE, FILE_FLAG_NO_BUFFERING,
        FILE_FLAG_OVERLAPPED, FILE_FLAG_WRITE_THROUGH, FILE_SHARE_DELETE, FILE_SHARE_READ,
        FILE_SHARE_WRITE, GetFileSizeEx, CREATE_ALWAYS, CREATE_NEW, OPEN_ALWAYS, OPEN_EXISTING,
        TRUNCATE_EXISTING,
    };
    use windows::Win32::System::Ioctl::FSCTL_SET_ZERO_DATA;
    use windows::Win32::System::IO::DeviceIoControl;

    use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
    use crate::io_handle::AsHandle;
    use crate::native_handle::{Disposition, NativeHandle};
    use crate::path_handle::PathHandle;
    use crate::{Errc, Error, Result};

    fn wide(path: &std::path::Path) -> Vec<u16> {
        use std::os::windows::ffi::OsStrExt;
        let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
        wide.push(0);
        wide
    }

    fn resolve(base: Option<&PathHandle>, path: PathView<'_>) -> Result<std::path::PathBuf> {
        Ok(match base {
            Some(b) => b.as_handle().current_path()?.join(path.as_path()),
            None => path.as_path().to_path_buf(),
        })
    }

    fn disposition_of(mode: Mode, caching: Caching, flags: HandleFlags) -> Disposition {
        let mut disposition = Disposition::FILE | Disposition::SEEKABLE;
        match mode {
            Mode::Read | Mode::AttrRead => disposition |= Disposition::READABLE,
            Mode::Write | Mode::AttrWrite => {
                disposition |= Disposition::READABLE | Disposition::WRITABLE;
            }
            Mode::Append => disposition |= Disposition::WRITABLE | Disposition::APPEND_ONLY,
            Mode::Unchanged | Mode::None => {}
        }
        if caching.requires_aligned_io() {
            disposition |= Disposition::ALIGNED_IO;
        }
        if flags.contains(HandleFlags::OVERLAPPED) {
            disposition |= Disposition::OVERLAPPED;
        }
        disposition
    }

    pub(super) fn open_file(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Handle> {
        let resolved = resolve(base, path)?;
        let wide_path = wide(&resolved);

        let access = match mode {
            Mode::Unchanged => return Err(Error::generic(Errc::InvalidArgument)),
            Mode::None => 0,
            Mode::AttrRead | Mode::Read => GENERIC_READ.0,
            Mode::AttrWrite | Mode::Write | Mode::Append => GENERIC_READ.0 | GENERIC_WRITE.0,
        };
        let disposition = match creation {
            Creation::OpenExisting => OPEN_EXISTING,
            Creation::OnlyIfNotExist => CREATE_NEW,
            Creation::IfNeeded => OPEN_ALWAYS,
            Creation::TruncateExisting => TRUNCATE_EXISTING,
            Creation::AlwaysNew => CREATE_ALWAYS,
        };
        let mut attributes = FILE_ATTRIBUTE_NORMAL;
        if caching == Caching::Temporary {
            attributes |= FILE_ATTRIBUTE_TEMPORARY;
        }
        if caching.requires_aligned_io() {
            attributes |= FILE_FLAG_NO_BUFFERING;
        }
        if matches!(caching, Caching::None | Caching::Reads | Caching::ReadsAndMetadata) {
            attributes |= FILE_FLAG_WRITE_THROUGH;
        }
        if flags.contains(HandleFlags::OVERLAPPED) {
            attributes |= FILE_FLAG_OVERLAPPED;
        }

        // SAFETY: NUL-terminated wide path.
        let handle = unsafe {
            CreateFileW(
                PCWSTR(wide_path.as_ptr()),
                access,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                None,
                disposition,
                attributes,
                None,
            )
        }
        .map_err(|_| Error::last_os_error().with_path(&resolved))?;

        Ok(Handle::from_native(
            NativeHandle::from_raw_handle(handle.0, disposition_of(mode, caching, flags)),
            caching,
            flags,
        ))
    }

    pub(super) fn temp_inode(base: &PathHandle, caching: Caching, flags: HandleFlags) -> Result<Handle> {
        let dir = base.as_handle().current_path()?;
        loop {
            let name = crate::utils::temp_file_name();
            let resolved = dir.join(&name);
            let wide_path = wide(&resolved);
            // SAFETY: NUL-terminated wide path; DELETE_ON_CLOSE makes the
            // inode vanish with the last handle.
            let created = unsafe {
                CreateFileW(
                    PCWSTR(wide_path.as_ptr()),
                    GENERIC_READ.0 | GENERIC_WRITE.0,
                    FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                    None,
                    CREATE_NEW,
                    FILE_ATTRIBUTE_TEMPORARY | FILE_FLAG_DELETE_ON_CLOSE,
                    None,
                )
            };
            match created {
                Ok(handle) => {
                    return Ok(Handle::from_native(
                        NativeHandle::from_raw_handle(
                            handle.0,
                            disposition_of(Mode::Write, caching, flags),
                        ),
                        caching,
                        flags,
                    ));
                }
                Err(_) => {
                    let error = Error::last_os_error();
                    if error.errc() == Some(Errc::FileExists) {
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    pub(super) fn length(handle: &Handle) -> Result<u64> {
        let mut size = 0i64;
        // SAFETY: out-param on the stack.
        unsafe { GetFileSizeEx(HANDLE(handle.native().raw_handle()), &mut size) }
            .map_err(|_| Error::last_os_error())?;
        Ok(size as u64)
    }

    pub(super) fn truncate(handle: &Handle, new_length: u64) -> Result<()> {
        let h = HANDLE(handle.native().raw_handle());
        // SAFETY: repositioning and truncating our own handle.
        unsafe {
            SetFilePointerEx(h, new_length as i64, None, FILE_BEGIN)
                .map_err(|_| Error::last_os_error())?;
            SetEndOfFile(h).map_err(|_| Error::last_os_error())
        }
    }

    pub(super) fn fsync(handle: &Handle) -> Result<()> {
        use windows::Win32::Storage::FileSystem::FlushFileBuffers;
        // SAFETY: flushing our own handle.
        unsafe { FlushFileBuffers(HANDLE(handle.native().raw_handle())) }
            .map_err(|_| Error::last_os_error())
    }

    pub(super) fn extents(handle: &Handle) -> Result<Vec<Range<u64>>> {
        // Allocated-range enumeration needs FSCTL_QUERY_ALLOCATED_RANGES;
        // report one extent covering the whole file.
        let length = length(handle)?;
        if length == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![0..length])
    }

    pub(super) fn zero_range(handle: &Handle, range: &Range<u64>) -> Result<()> {
        #[repr(C)]
        struct FileZeroDataInformation {
            file_offset: i64,
            beyond_final_zero: i64,
        }
        let input = FileZeroDataInformation {
            file_offset: range.start as i64,
            beyond_final_zero: range.end as i64,
        };
        let mut returned = 0u32;
        // SAFETY: control buffer is a live local struct.
        unsafe {
            DeviceIoControl(
                HANDLE(handle.native().raw_handle()),
                FSCTL_SET_ZERO_DATA,
                Some(std::ptr::from_ref(&input).cast()),
                std::mem::size_of::<FileZeroDataInformation>() as u32,
                None,
                0,
                Some(&mut returned),
                None,
            )
        }
        .map_err(|_| Error::last_os_error())
    }

    pub(super) fn clone_or_copy(source: &Handle, destination: &Handle, length: u64) -> Result<()> {
        // Block cloning needs FSCTL_DUPLICATE_EXTENTS_TO_FILE on ReFS; the
        // portable path copies by range.
        let mut buffer = vec![0u8; 128 * 1024];
        let mut offset: u64 = 0;
        while offset < length {
            let want = ((length - offset) as usize).min(buffer.len());
            let read = crate::io_handle::blocking_read(
                source,
                crate::buffer::IoRequest::new(
                    std::slice::from_mut(&mut crate::buffer::Buffer::new(&mut buffer[..want])),
                    offset,
                ),
                None,
            )?;
            let got: usize = read.iter().map(crate::buffer::Buffer::len).sum();
            if got == 0 {
                break;
            }
            let mut write_buffer = [crate::buffer::ConstBuffer::new(&buffer[..got])];
            crate::io_handle::blocking_write(
                destination,
                crate::buffer::IoRequest::new(&mut write_buffer, offset),
                None,
            )?;
            offset += got as u64;
        }
        Ok(())
    }
}
