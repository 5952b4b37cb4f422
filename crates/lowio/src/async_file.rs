// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! File handles bound to a multiplexer for deadlined and asynchronous i/o.
//!
//! An [`AsyncFileHandle`] is a [`FileHandle`] opened multiplexable and
//! registered with a [`Multiplexer`] at construction. Its synchronous
//! `read`/`write` route through the multiplexer (honoring deadlines), and
//! it adds the asynchronous surface: completion callbacks
//! ([`begin_read`](AsyncFileHandle::begin_read)) and awaiters
//! ([`co_read`](AsyncFileHandle::co_read)).

use std::ops::Range;

use pathview::PathView;

use crate::buffer::{Buffer, ConstBuffer, IoRequest};
use crate::deadline::Deadline;
use crate::file_handle::FileHandle;
use crate::fs_handle::FsHandle;
use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
use crate::io_handle::{
    blocking_barrier, split_filled_prefix, split_written_prefix, AsHandle, BarrierKind, IoHandle,
};
use crate::mux::{Completion, IoFuture, Multiplexer, OpBuffer, OpId};
use crate::path_handle::PathHandle;
use crate::Result;

/// A regular file whose i/o is dispatched through a multiplexer.
#[derive(Debug)]
pub struct AsyncFileHandle {
    file: FileHandle,
    mux: Multiplexer,
}

impl AsyncFileHandle {
    /// Opens or creates a file as [`FileHandle::file`] does, forcing the
    /// multiplexable flag, and registers it with `mux`.
    pub fn async_file(
        mux: &Multiplexer,
        base: Option<&PathHandle>,
        path: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        let file = FileHandle::file(
            base,
            path,
            mode,
            creation,
            caching,
            flags | HandleFlags::OVERLAPPED,
        )?;
        mux.register_io_handle(&file)?;
        Ok(Self {
            file,
            mux: mux.clone(),
        })
    }

    /// An anonymous async temp inode.
    pub fn async_temp_inode(
        mux: &Multiplexer,
        base: Option<&PathHandle>,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        let file = FileHandle::temp_inode(base, caching, flags | HandleFlags::OVERLAPPED)?;
        mux.register_io_handle(&file)?;
        Ok(Self {
            file,
            mux: mux.clone(),
        })
    }

    /// Binds an already-open multiplexable file.
    pub fn from_file(mux: &Multiplexer, file: FileHandle) -> Result<Self> {
        mux.register_io_handle(&file)?;
        Ok(Self {
            file,
            mux: mux.clone(),
        })
    }

    /// The multiplexer this file is bound to.
    #[must_use]
    pub const fn multiplexer(&self) -> &Multiplexer {
        &self.mux
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

    /// Sets the file's length.
    pub fn truncate(&self, new_length: u64) -> Result<u64> {
        self.file.truncate(new_length)
    }

    /// Schedules an asynchronous read of up to `buffer.len()` bytes at
    /// `offset`; `receiver` gets the completion.
    pub fn begin_read(
        &self,
        buffer: impl Into<OpBuffer>,
        offset: u64,
        deadline: Option<Deadline>,
        receiver: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<OpId> {
        self.mux.read_op(&self.file, buffer, offset, deadline, receiver)
    }

    /// Schedules an asynchronous write of `buffer` at `offset`; `receiver`
    /// gets the completion.
    pub fn begin_write(
        &self,
        buffer: impl Into<OpBuffer>,
        offset: u64,
        deadline: Option<Deadline>,
        receiver: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<OpId> {
        self.mux.write_op(&self.file, buffer, offset, deadline, receiver)
    }

    /// An awaiter reading up to `buffer.len()` bytes at `offset`.
    pub fn co_read(
        &self,
        buffer: impl Into<OpBuffer>,
        offset: u64,
        deadline: Option<Deadline>,
    ) -> Result<IoFuture> {
        self.mux.co_read(&self.file, buffer, offset, deadline)
    }

    /// An awaiter writing `buffer` at `offset`.
    pub fn co_write(
        &self,
        buffer: impl Into<OpBuffer>,
        offset: u64,
        deadline: Option<Deadline>,
    ) -> Result<IoFuture> {
        self.mux.co_write(&self.file, buffer, offset, deadline)
    }
}

impl AsHandle for AsyncFileHandle {
    fn as_handle(&self) -> &Handle {
        self.file.as_handle()
    }
}

impl FsHandle for AsyncFileHandle {}

impl IoHandle for AsyncFileHandle {
    /// Synchronous reads route through the multiplexer, which is what makes
    /// the deadline honorable here where a plain file handle reports
    /// `not_supported`.
    fn read<'call, 'mem>(
        &'mem self,
        request: IoRequest<'call, Buffer<'mem>>,
        deadline: Option<Deadline>,
    ) -> Result<&'call mut [Buffer<'mem>]> {
        let IoRequest { buffers, offset } = request;
        let total: usize = buffers.iter().map(Buffer::len).sum();
        let staging = vec![0u8; total];
        let (transferred, staging) = self.mux.read_blocking(&self.file, staging, offset, deadline)?;
        // Scatter the staging bytes back across the caller's buffers.
        let bytes = staging.as_slice();
        let mut copied = 0;
        for buffer in buffers.iter_mut() {
            if copied >= transferred {
                break;
            }
            let take = buffer.len().min(transferred - copied);
            buffer.as_mut_slice()[..take].copy_from_slice(&bytes[copied..copied + take]);
            copied += take;
        }
        Ok(split_filled_prefix(buffers, transferred))
    }

    fn write<'call, 'mem>(
        &'mem self,
        request: IoRequest<'call, ConstBuffer<'mem>>,
        deadline: Option<Deadline>,
    ) -> Result<&'call mut [ConstBuffer<'mem>]> {
        let IoRequest { buffers, offset } = request;
        let mut staging = Vec::with_capacity(buffers.iter().map(ConstBuffer::len).sum());
        for buffer in buffers.iter() {
            staging.extend_from_slice(buffer.as_slice());
        }
        let (transferred, _staging) = self.mux.write_blocking(&self.file, staging, offset, deadline)?;
        Ok(split_written_prefix(buffers, transferred))
    }

    fn barrier(
        &self,
        range: Option<Range<u64>>,
        kind: BarrierKind,
        _deadline: Option<Deadline>,
    ) -> Result<Range<u64>> {
        blocking_barrier(self.as_handle(), range, kind)
    }
}

impl Drop for AsyncFileHandle {
    fn drop(&mut self) {
        // In-flight i/o keeps the registration alive; deregistration then
        // legitimately fails and the arena still pins the buffers.
        let _ = self.mux.deregister_io_handle(&self.file);
    }
}
