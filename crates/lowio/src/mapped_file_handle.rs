// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! File handles whose i/o is served through a memory map.
//!
//! A [`MappedFileHandle`] owns a [`FileHandle`], a [`SectionHandle`] over it
//! and a [`MapHandle`] view; reads and writes become memory copies into the
//! view. When the file's length changes through this handle the view is
//! remapped automatically; a length change made through a *different* handle
//! becomes visible after [`update_map`](MappedFileHandle::update_map).

use std::ops::Range;

use pathview::PathView;

use crate::buffer::{Buffer, ConstBuffer, IoRequest};
use crate::deadline::Deadline;
use crate::file_handle::FileHandle;
use crate::fs_handle::FsHandle;
use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
use crate::io_handle::{AsHandle, BarrierKind, IoHandle};
use crate::map_handle::{MapHandle, MemoryFlags};
use crate::path_handle::PathHandle;
use crate::section_handle::SectionHandle;
use crate::{Errc, Error, Result};

/// A regular file whose reads and writes are memory copies into an
/// internally owned map.
#[derive(Debug)]
pub struct MappedFileHandle {
    // Field order is drop order: the view must unmap before its section
    // closes, and the section before the file.
    map: Option<MapHandle>,
    section: Option<SectionHandle>,
    file: FileHandle,
}

impl MappedFileHandle {
    /// Opens or creates a file as [`FileHandle::file`] does, serving its
    /// i/o through a map.
    pub fn mapped_file(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        let file = FileHandle::file(base, path, mode, creation, caching, flags)?;
        let mut this = Self {
            file,
            section: None,
            map: None,
        };
        this.update_map()?;
        Ok(this)
    }

    /// A mapped file over a fresh anonymous temp inode.
    pub fn mapped_temp_inode(base: Option<&PathHandle>, flags: HandleFlags) -> Result<Self> {
        let file = FileHandle::temp_inode(base, Caching::All, flags)?;
        let mut this = Self {
            file,
            section: None,
            map: None,
        };
        this.update_map()?;
        Ok(this)
    }

    /// The underlying file handle.
    #[must_use]
    pub const fn file(&self) -> &FileHandle {
        &self.file
    }

    /// The file's length in bytes.
    pub fn length(&self) -> Result<u64> {
        self.file.length()
    }

    /// Sets the file's length and remaps the view to match.
    pub fn truncate(&mut self, new_length: u64) -> Result<u64> {
        self.file.truncate(new_length)?;
        self.update_map()?;
        Ok(new_length)
    }

    /// Re-reads the file's length and rebuilds the view to cover it. Call
    /// after the file was resized through another handle.
    pub fn update_map(&mut self) -> Result<()> {
        // Unmap before touching the section: invariant of map teardown.
        self.map = None;
        let length = self.file.length()?;
        if length == 0 {
            self.section = None;
            return Ok(());
        }
        let wants_write = self.file.as_handle().native().is_writable();
        let section_flags = if wants_write {
            MemoryFlags::readwrite()
        } else {
            MemoryFlags::READ
        };
        let section = SectionHandle::section(&self.file, section_flags)?;
        let length = usize::try_from(length).map_err(|_| Error::generic(Errc::ValueTooLarge))?;
        self.map = Some(MapHandle::map_section(&section, length, 0, section_flags)?);
        self.section = Some(section);
        Ok(())
    }

    fn map(&self) -> Result<&MapHandle> {
        self.map
            .as_ref()
            .ok_or_else(|| Error::generic(Errc::NoSuchDeviceOrAddress))
    }
}

impl AsHandle for MappedFileHandle {
    fn as_handle(&self) -> &Handle {
        self.file.as_handle()
    }
}

impl FsHandle for MappedFileHandle {}

impl IoHandle for MappedFileHandle {
    /// I/o is pure memory copying.
    fn max_buffers(&self) -> usize {
        0
    }

    /// Returns buffers aliasing the map. A zero-length file yields
    /// zero-length buffers.
    fn read<'call, 'mem>(
        &'mem self,
        request: IoRequest<'call, Buffer<'mem>>,
        deadline: Option<Deadline>,
    ) -> Result<&'call mut [Buffer<'mem>]> {
        match self.map.as_ref() {
            Some(map) => map.read(request, deadline),
            None => {
                // Empty file: every buffer reads back empty.
                let IoRequest { buffers, .. } = request;
                for buffer in buffers.iter_mut() {
                    buffer.truncate(0);
                }
                Ok(buffers)
            }
        }
    }

    fn write<'call, 'mem>(
        &'mem self,
        request: IoRequest<'call, ConstBuffer<'mem>>,
        deadline: Option<Deadline>,
    ) -> Result<&'call mut [ConstBuffer<'mem>]> {
        self.map()?.write(request, deadline)
    }

    /// Flushes the mapped view, then the file metadata for metadata kinds.
    fn barrier(
        &self,
        range: Option<Range<u64>>,
        kind: BarrierKind,
        deadline: Option<Deadline>,
    ) -> Result<Range<u64>> {
        match self.map.as_ref() {
            Some(map) => map.barrier(range, kind, deadline),
            None => Ok(0..0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, MappedFileHandle) {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = PathHandle::path(None, PathView::new(dir.path())).expect("anchor");
        let file = MappedFileHandle::mapped_file(
            Some(&base),
            PathView::new("mapped"),
            Mode::Write,
            Creation::IfNeeded,
            Caching::All,
            HandleFlags::empty(),
        )
        .expect("create mapped file");
        (dir, file)
    }

    #[test]
    fn empty_file_reads_empty() {
        let (_dir, file) = scratch();
        let mut scratch_bytes = [0u8; 16];
        let mut buffers = [Buffer::new(&mut scratch_bytes)];
        let read = file.read(IoRequest::new(&mut buffers, 0), None).expect("read");
        assert_eq!(read[0].len(), 0);
    }

    #[test]
    fn write_lands_in_the_file() {
        let (dir, mut file) = scratch();
        file.truncate(4096).expect("truncate");

        let payload = *b"memory mapped";
        let mut buffers = [ConstBuffer::new(&payload)];
        file.write(IoRequest::new(&mut buffers, 100), None).expect("write");
        file.barrier(None, BarrierKind::WaitAll, None).expect("barrier");

        // Visible through ordinary file i/o.
        let on_disk = std::fs::read(dir.path().join("mapped")).expect("read back");
        assert_eq!(&on_disk[100..113], b"memory mapped");
    }

    #[test]
    fn truncate_remaps_the_view() {
        let (_dir, mut file) = scratch();
        file.truncate(4096).expect("first size");

        let payload = [7u8; 64];
        let mut buffers = [ConstBuffer::new(&payload)];
        file.write(IoRequest::new(&mut buffers, 0), None).expect("write");

        file.truncate(8192).expect("grow");
        // Old content survives and the new tail is addressable.
        let mut scratch_bytes = [0u8; 64];
        let mut buffers = [Buffer::new(&mut scratch_bytes)];
        let read = file.read(IoRequest::new(&mut buffers, 0), None).expect("read");
        assert!(read[0].as_slice().iter().all(|&b| b == 7));

        let mut tail = [0xFFu8; 16];
        let mut buffers = [Buffer::new(&mut tail)];
        let read = file.read(IoRequest::new(&mut buffers, 8000), None).expect("read tail");
        assert_eq!(read[0].len(), 16);
        assert!(read[0].as_slice().iter().all(|&b| b == 0), "grown tail is zeros");
    }

    #[test]
    fn reads_alias_the_map_not_the_scratch() {
        let (_dir, mut file) = scratch();
        file.truncate(4096).expect("truncate");
        let payload = *b"alias";
        let mut buffers = [ConstBuffer::new(&payload)];
        file.write(IoRequest::new(&mut buffers, 0), None).expect("write");

        let mut scratch_bytes = [0u8; 5];
        let scratch_ptr = scratch_bytes.as_ptr();
        let mut buffers = [Buffer::new(&mut scratch_bytes)];
        let read = file.read(IoRequest::new(&mut buffers, 0), None).expect("read");
        assert_eq!(read[0].as_slice(), b"alias");
        assert_ne!(read[0].as_ptr().cast_const(), scratch_ptr, "returned buffer aliases the map");
    }

    #[test]
    fn mapped_io_reports_zero_max_buffers() {
        let (_dir, file) = scratch();
        assert_eq!(file.max_buffers(), 0);
    }
}
