// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Directory handles and entry enumeration.
//!
//! [`DirectoryHandle::enumerate`] fills a caller-supplied
//! [`EnumerationBuffer`]: the buffer owns the leaf-name byte storage, and the
//! [`DirectoryEntry`] views returned by [`EnumerationBuffer::entries`] borrow
//! it, so the buffer must outlive any use of the entries. Reusing one buffer
//! across calls amortizes its allocations.

use pathview::PathView;

use crate::fs_handle::FsHandle;
use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
use crate::io_handle::AsHandle;
use crate::path_handle::PathHandle;
use crate::Result;

bitflags::bitflags! {
    /// Which fields of a [`Stat`] an enumeration actually filled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatMask: u32 {
        /// [`Stat::inode`] is valid.
        const INODE = 1 << 0;
        /// [`Stat::entry_type`] is valid.
        const TYPE = 1 << 1;
        /// [`Stat::size`] is valid.
        const SIZE = 1 << 2;
    }
}

/// The type of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EntryType {
    #[display("file")]
    File,
    #[display("directory")]
    Directory,
    #[display("symlink")]
    Symlink,
    #[display("fifo")]
    Fifo,
    #[display("socket")]
    Socket,
    #[display("char device")]
    CharDevice,
    #[display("block device")]
    BlockDevice,
    #[display("unknown")]
    Unknown,
}

/// A partially filled stat record; consult the enumeration's [`StatMask`]
/// for which fields are meaningful.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// Inode number.
    pub inode: u64,
    /// Entry type.
    pub entry_type: EntryType,
    /// Size in bytes.
    pub size: u64,
}

/// One enumerated entry. The leaf name borrows the enumeration buffer.
#[derive(Debug)]
pub struct DirectoryEntry<'buffer> {
    /// The bare leaf name.
    pub leafname: PathView<'buffer>,
    /// The partially filled stat record.
    pub stat: Stat,
}

/// Caller-supplied storage for an enumeration.
///
/// Owns the leaf-name bytes (the "kernel buffer") and the per-entry records.
#[derive(Debug, Default)]
pub struct EnumerationBuffer {
    names: Vec<u8>,
    entries: Vec<(std::ops::Range<usize>, Stat)>,
    max_entries: usize,
}

impl EnumerationBuffer {
    /// An unbounded buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer accepting at most `max_entries` entries per call; the
    /// enumeration reports `done == false` when it stops early.
    #[must_use]
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            names: Vec::new(),
            entries: Vec::new(),
            max_entries,
        }
    }

    /// The number of entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Views of the held entries. The views borrow this buffer.
    pub fn entries(&self) -> impl Iterator<Item = DirectoryEntry<'_>> {
        self.entries.iter().map(|(range, stat)| {
            let bytes = &self.names[range.clone()];
            // SAFETY: the bytes were copied verbatim from an OsStr leaf name.
            let os = unsafe { std::ffi::OsStr::from_encoded_bytes_unchecked(bytes) };
            DirectoryEntry {
                leafname: PathView::new(os),
                stat: *stat,
            }
        })
    }

    fn clear(&mut self) {
        self.names.clear();
        self.entries.clear();
    }

    fn push(&mut self, name: &[u8], stat: Stat) -> bool {
        let start = self.names.len();
        self.names.extend_from_slice(name);
        self.entries.push((start..self.names.len(), stat));
        self.max_entries == 0 || self.entries.len() < self.max_entries
    }

    fn full(&self) -> bool {
        self.max_entries != 0 && self.entries.len() >= self.max_entries
    }
}

/// Entry filtering applied during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectoryFilter {
    /// Keep everything.
    #[default]
    None,
    /// Skip leaf names matching the unlink-emulation rename pattern
    /// (32 hex characters + `.deleted`).
    FastDeleted,
}

/// The outcome of one enumeration call.
#[derive(Debug, Clone, Copy)]
pub struct EnumerationResult {
    /// Which [`Stat`] fields were populated for every returned entry.
    pub metadata: StatMask,
    /// Whether the directory was exhausted. `false` means the buffer filled
    /// up first; call again to continue — note entries may repeat across
    /// calls, deduplicate by name.
    pub done: bool,
}

/// A handle to a directory.
#[derive(Debug)]
pub struct DirectoryHandle {
    handle: Handle,
}

impl DirectoryHandle {
    /// Opens (or with a creating `creation`, creates) the directory at
    /// `path` relative to `base`.
    pub fn directory(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        let handle = os::open_directory(base, path, mode, creation, caching, flags)?;
        Ok(Self { handle })
    }

    /// Fills `into` with this directory's entries.
    ///
    /// `glob` is matched against leaf names (kernel-side where the platform
    /// supports it, in user space otherwise); `filter` optionally skips
    /// unlink-emulation leftovers. `.` and `..` are never returned.
    pub fn enumerate(
        &self,
        into: &mut EnumerationBuffer,
        glob: Option<PathView<'_>>,
        filter: DirectoryFilter,
    ) -> Result<EnumerationResult> {
        into.clear();
        os::enumerate(&self.handle, into, glob, filter)
    }

    /// Converts this directory into a path anchor for relative opens.
    pub fn to_path_handle(&self) -> Result<PathHandle> {
        Ok(PathHandle::from_handle(self.handle.clone_handle()?))
    }
}

impl AsHandle for DirectoryHandle {
    fn as_handle(&self) -> &Handle {
        &self.handle
    }
}

impl FsHandle for DirectoryHandle {}

/// Matches `name` against a shell glob supporting `*`, `?` and `[...]`
/// character classes.
pub(crate) fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    fn inner(mut pattern: &[u8], mut name: &[u8]) -> bool {
        loop {
            match pattern.first() {
                None => return name.is_empty(),
                Some(b'*') => {
                    // Collapse runs of stars, then try every split point.
                    while pattern.first() == Some(&b'*') {
                        pattern = &pattern[1..];
                    }
                    if pattern.is_empty() {
                        return true;
                    }
                    for skip in 0..=name.len() {
                        if inner(pattern, &name[skip..]) {
                            return true;
                        }
                    }
                    return false;
                }
                Some(b'?') => {
                    if name.is_empty() {
                        return false;
                    }
                    pattern = &pattern[1..];
                    name = &name[1..];
                }
                Some(b'[') => {
                    let Some(close) = pattern.iter().position(|&b| b == b']').filter(|&p| p > 1)
                    else {
                        // Unterminated class: treat '[' literally.
                        if name.first() != Some(&b'[') {
                            return false;
                        }
                        pattern = &pattern[1..];
                        name = &name[1..];
                        continue;
                    };
                    let Some(&candidate) = name.first() else {
                        return false;
                    };
                    let (negated, class) = match pattern[1] {
                        b'!' | b'^' => (true, &pattern[2..close]),
                        _ => (false, &pattern[1..close]),
                    };
                    let mut matched = false;
                    let mut i = 0;
                    while i < class.len() {
                        if i + 2 < class.len() && class[i + 1] == b'-' {
                            if (class[i]..=class[i + 2]).contains(&candidate) {
                                matched = true;
                            }
                            i += 3;
                        } else {
                            if class[i] == candidate {
                                matched = true;
                            }
                            i += 1;
                        }
                    }
                    if matched == negated {
                        return false;
                    }
                    pattern = &pattern[close + 1..];
                    name = &name[1..];
                }
                Some(&literal) => {
                    if name.first() != Some(&literal) {
                        return false;
                    }
                    pattern = &pattern[1..];
                    name = &name[1..];
                }
            }
        }
    }
    inner(pattern, name)
}

#[cfg(unix)]
mod os {
    use pathview::PathView;

    use super::{
        glob_match, DirectoryFilter, EntryType, EnumerationBuffer, EnumerationResult, Stat,
        StatMask,
    };
    use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
    use crate::native_handle::{Disposition, NativeHandle};
    use crate::path_handle::PathHandle;
    use crate::utils::to_cstring;
    use crate::{Errc, Error, Result};

    pub(super) fn open_directory(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Handle> {
        let c_path = to_cstring(path.as_path())?;
        let base_fd = PathHandle::base_fd(base);

        if matches!(creation, Creation::OnlyIfNotExist | Creation::IfNeeded) {
            // SAFETY: NUL-terminated path.
            let rc = unsafe { libc::mkdirat(base_fd, c_path.as_ptr(), 0o770) };
            if rc == -1 {
                let error = Error::last_os_error().with_path(path.as_path());
                let exists = error.errc() == Some(Errc::FileExists);
                if !(exists && creation == Creation::IfNeeded) {
                    return Err(error);
                }
            }
        }

        // SAFETY: NUL-terminated path.
        let fd = unsafe {
            libc::openat(base_fd, c_path.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC)
        };
        if fd == -1 {
            return Err(Error::last_os_error().with_path(path.as_path()));
        }
        let mut disposition = Disposition::DIRECTORY | Disposition::READABLE;
        if matches!(mode, Mode::Write | Mode::AttrWrite) {
            disposition |= Disposition::WRITABLE;
        }
        Ok(Handle::from_native(
            NativeHandle::from_fd(fd, disposition),
            caching,
            flags,
        ))
    }

    pub(super) fn enumerate(
        handle: &Handle,
        into: &mut EnumerationBuffer,
        glob: Option<PathView<'_>>,
        filter: DirectoryFilter,
    ) -> Result<EnumerationResult> {
        // fdopendir takes ownership, so hand it a duplicate.
        // SAFETY: plain descriptor duplication.
        let dup = unsafe { libc::fcntl(handle.native().fd(), libc::F_DUPFD_CLOEXEC, 0) };
        if dup == -1 {
            return Err(Error::last_os_error());
        }
        // SAFETY: dup is a fresh directory descriptor, owned by the stream
        // from here on.
        let dir = unsafe { libc::fdopendir(dup) };
        if dir.is_null() {
            let error = Error::last_os_error();
            // SAFETY: fdopendir refused ownership; close it ourselves.
            unsafe { libc::close(dup) };
            return Err(error);
        }
        // SAFETY: rewind so we enumerate from the start regardless of any
        // prior stream position on the descriptor.
        unsafe { libc::rewinddir(dir) };

        let mut done = true;
        loop {
            if into.full() {
                done = false;
                break;
            }
            // SAFETY: dir is a live stream; readdir's result is valid until
            // the next call on the same stream.
            let entry = unsafe { libc::readdir(dir) };
            if entry.is_null() {
                break;
            }
            // SAFETY: d_name is NUL-terminated within the dirent.
            let name = unsafe { std::ffi::CStr::from_ptr((*entry).d_name.as_ptr()) };
            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }
            if let Some(pattern) = glob {
                if !glob_match(pattern.as_bytes(), bytes) {
                    continue;
                }
            }
            if filter == DirectoryFilter::FastDeleted {
                // SAFETY: bytes come from a leaf name.
                let leaf = unsafe { std::ffi::OsStr::from_encoded_bytes_unchecked(bytes) };
                if PathView::new(leaf).is_deleted() {
                    continue;
                }
            }
            // SAFETY: entry is valid until the next readdir.
            let (inode, d_type) = unsafe { ((*entry).d_ino as u64, (*entry).d_type) };
            let stat = Stat {
                inode,
                entry_type: entry_type_of(d_type),
                size: 0,
            };
            into.push(bytes, stat);
        }
        // SAFETY: closing the stream releases the duplicated descriptor.
        unsafe { libc::closedir(dir) };
        Ok(EnumerationResult {
            metadata: StatMask::INODE | StatMask::TYPE,
            done,
        })
    }

    fn entry_type_of(d_type: u8) -> EntryType {
        match d_type {
            libc::DT_REG => EntryType::File,
            libc::DT_DIR => EntryType::Directory,
            libc::DT_LNK => EntryType::Symlink,
            libc::DT_FIFO => EntryType::Fifo,
            libc::DT_SOCK => EntryType::Socket,
            libc::DT_CHR => EntryType::CharDevice,
            libc::DT_BLK => EntryType::BlockDevice,
            _ => EntryType::Unknown,
        }
    }
}

#[cfg(windows)]
mod os {
    use pathview::PathView;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::ERROR_NO_MORE_FILES;
    use windows::Win32::Storage::FileSystem::{
        FindClose, FindFirstFileW, FindNextFileW, FILE_ATTRIBUTE_DIRECTORY,
        FILE_ATTRIBUTE_REPARSE_POINT, WIN32_FIND_DATAW,
    };

    use super::{
        glob_match, DirectoryFilter, EntryType, EnumerationBuffer, EnumerationResult, Stat,
        StatMask,
    };
    use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
    use crate::io_handle::AsHandle;
    use crate::path_handle::PathHandle;
    use crate::{Error, Result};

    pub(super) fn open_directory(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        _mode: Mode,
        creation: Creation,
        _caching: Caching,
        _flags: HandleFlags,
    ) -> Result<Handle> {
        let resolved = match base {
            Some(b) => b.as_handle().current_path()?.join(path.as_path()),
            None => path.as_path().to_path_buf(),
        };
        if matches!(creation, Creation::OnlyIfNotExist | Creation::IfNeeded) {
            match std::fs::create_dir(&resolved) {
                Ok(()) => {}
                Err(e)
                    if e.kind() == std::io::ErrorKind::AlreadyExists
                        && creation == Creation::IfNeeded => {}
                Err(e) => return Err(Error::from(e).with_path(&resolved)),
            }
        }
        let anchor = PathHandle::path(None, PathView::new(&resolved))?;
        Ok(anchor.into_handle())
    }

    pub(super) fn enumerate(
        handle: &Handle,
        into: &mut EnumerationBuffer,
        glob: Option<PathView<'_>>,
        filter: DirectoryFilter,
    ) -> Result<EnumerationResult> {
        use std::os::windows::ffi::{OsStrExt, OsStringExt};

        let dir = handle.current_path()?;
        // The glob is applied kernel-side through the search pattern.
        let pattern = match glob {
            Some(g) => dir.join(g.as_path()),
            None => dir.join("*"),
        };
        let mut wide: Vec<u16> = pattern.as_os_str().encode_wide().collect();
        wide.push(0);

        let mut data = WIN32_FIND_DATAW::default();
        // SAFETY: NUL-terminated wide pattern, out-param struct.
        let find = unsafe { FindFirstFileW(PCWSTR(wide.as_ptr()), &mut data) };
        let find = match find {
            Ok(handle) => handle,
            Err(_) => return Err(Error::last_os_error()),
        };

        let mut done = true;
        loop {
            let len = data.cFileName.iter().position(|&c| c == 0).unwrap_or(data.cFileName.len());
            let name = std::ffi::OsString::from_wide(&data.cFileName[..len]);
            let bytes = name.as_encoded_bytes();
            let skip = bytes == b"." || bytes == b".."
                || (filter == DirectoryFilter::FastDeleted && PathView::new(&name).is_deleted())
                || glob.map_or(false, |g| !glob_match(g.as_bytes(), bytes));
            if !skip {
                let entry_type = if data.dwFileAttributes & FILE_ATTRIBUTE_REPARSE_POINT.0 != 0 {
                    EntryType::Symlink
                } else if data.dwFileAttributes & FILE_ATTRIBUTE_DIRECTORY.0 != 0 {
                    EntryType::Directory
                } else {
                    EntryType::File
                };
                let stat = Stat {
                    inode: 0,
                    entry_type,
                    size: (u64::from(data.nFileSizeHigh) << 32) | u64::from(data.nFileSizeLow),
                };
                if !into.push(bytes, stat) {
                    done = false;
                    break;
                }
            }
            // SAFETY: live find handle, out-param struct.
            if unsafe { FindNextFileW(find, &mut data) }.is_err() {
                let error = Error::last_os_error();
                if error.code() != crate::ErrorCode::Win32(ERROR_NO_MORE_FILES.0) {
                    // SAFETY: releasing the find handle.
                    unsafe { let _ = FindClose(find); }
                    return Err(error);
                }
                break;
            }
        }
        // SAFETY: releasing the find handle.
        unsafe { let _ = FindClose(find); }
        Ok(EnumerationResult {
            metadata: StatMask::TYPE | StatMask::SIZE,
            done,
        })
    }
}
