// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Low-level portable file i/o.
//!
//! This crate exposes the native capabilities of modern operating systems —
//! scatter/gather i/o, unbuffered/direct i/o, memory-mapped files,
//! asynchronous i/o, sparse files, race-free path resolution and precise
//! caching control — through a uniform set of handle types, without the
//! stream abstractions that hide them.
//!
//! # The handle hierarchy
//!
//! A [`Handle`] owns one native OS handle ([`NativeHandle`]) plus the
//! [`Caching`] policy and [`HandleFlags`] it was opened with, and closes it
//! on drop. Capabilities are composed as traits:
//!
//! * [`IoHandle`] — scatter/gather [`read`](IoHandle::read),
//!   [`write`](IoHandle::write) and [`barrier`](IoHandle::barrier);
//! * [`FsHandle`] — inode identity, [`relink`](FsHandle::relink),
//!   [`unlink`](FsHandle::unlink), parent-directory retrieval.
//!
//! The concrete types compose these over real kernel objects:
//!
//! | Type | What it is |
//! |------|------------|
//! | [`PathHandle`] | a race-free base anchor for relative opens |
//! | [`FileHandle`] | a regular file: factories, extents, hole punching, cloning |
//! | [`DirectoryHandle`] | a directory: filtered, globbed enumeration |
//! | [`PipeHandle`] | named and anonymous pipes |
//! | [`SectionHandle`] | a mappable memory section, file-backed or anonymous |
//! | [`MapHandle`] | a mapped view: commit/decommit, hole punching, barriers |
//! | [`MappedFileHandle`] | a file whose i/o is memcpy through its own map |
//! | [`AsyncFileHandle`] | a file bound to a [`Multiplexer`] for deadlined i/o |
//!
//! # Opening files
//!
//! Every factory takes an optional [`PathHandle`] base. When one is given,
//! the path resolves relative to that kernel-held directory, so no
//! concurrent rename of an ancestor can redirect the open:
//!
//! ```no_run
//! use lowio::{Caching, Creation, FileHandle, HandleFlags, Mode, PathHandle};
//! use pathview::PathView;
//!
//! # fn example() -> lowio::Result<()> {
//! let base = PathHandle::path(None, PathView::new("/var/data"))?;
//! let file = FileHandle::file(
//!     Some(&base),
//!     PathView::new("store.bin"),
//!     Mode::Write,
//!     Creation::IfNeeded,
//!     Caching::All,
//!     HandleFlags::empty(),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! # Scatter/gather i/o
//!
//! Requests are ordered buffer sequences plus a file offset. Results come
//! back as the *returned* buffers: lengths rewritten to the bytes actually
//! transferred, and — for mapped i/o — addresses possibly pointing into the
//! map rather than at the memory submitted. Always use what `read` returns.
//!
//! ```no_run
//! use lowio::{Buffer, IoHandle, IoRequest};
//! # fn example(file: lowio::FileHandle) -> lowio::Result<()> {
//! let mut head = [0u8; 128];
//! let mut tail = [0u8; 128];
//! let mut buffers = [Buffer::new(&mut head), Buffer::new(&mut tail)];
//! let filled = file.read(IoRequest::new(&mut buffers, 4096), None)?;
//! for buffer in filled.iter() {
//!     // process buffer.as_slice()
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Asynchronous i/o
//!
//! A [`Multiplexer`] ([`Multiplexer::best_available`]) turns kernel
//! completion notifications — IOCP, epoll, io_uring, kqueue — into
//! completion dispatch: posted work, registered handles, deadline wheels,
//! cancellation, and awaiters ([`IoFuture`]) for coroutine-style code.
//! [`AsyncFileHandle`] packages a file with its multiplexer registration.
//!
//! # Errors
//!
//! Every fallible operation returns [`Result`] with the [`Error`] carrier:
//! a categorized code (portable [`Errc`], POSIX errno, Win32 or NTSTATUS),
//! up to two path annotations, the raising thread and a log-ring index.

pub use crate::async_file::AsyncFileHandle;
pub use crate::buffer::{Buffer, ConstBuffer, IoRequest};
pub use crate::deadline::Deadline;
pub use crate::directory_handle::{
    DirectoryEntry, DirectoryFilter, DirectoryHandle, EntryType, EnumerationBuffer,
    EnumerationResult, Stat, StatMask,
};
pub use crate::error::{Errc, Error, ErrorCode, Result};
pub use crate::file_handle::FileHandle;
pub use crate::fs_handle::{FsHandle, InodeId};
pub use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
pub use crate::io_handle::{AsHandle, BarrierKind, IoHandle, DIRECT_IO_ALIGNMENT};
pub use crate::map_handle::{page_size, MapHandle, MemoryFlags, RegisteredBuffer};
pub use crate::mapped_file_handle::MappedFileHandle;
pub use crate::mux::{
    current_multiplexer, defer_completions, set_current_multiplexer, Completion, IoFuture,
    Multiplexer, OpBuffer, OpId,
};
pub use crate::native_handle::{Disposition, NativeHandle};
pub use crate::path_discovery::{memory_backed_temp_dir, storage_backed_temp_dir};
pub use crate::path_handle::PathHandle;
pub use crate::pipe_handle::PipeHandle;
pub use crate::section_handle::SectionHandle;
pub use crate::utils::temp_file_name;

mod async_file;
mod buffer;
mod deadline;
mod directory_handle;
mod error;
mod file_handle;
mod fs_handle;
mod handle;
mod io_handle;
pub mod log;
mod map_handle;
mod mapped_file_handle;
mod mux;
mod native_handle;
mod path_discovery;
mod path_handle;
mod pipe_handle;
mod section_handle;
mod utils;

#[cfg(test)]
mod tests {
    #[test]
    fn is_64_bit() {
        // Extent and offset math in this crate assumes 64-bit pointers;
        // u32 offsets overflow with entirely reasonable file sizes.
        static_assertions::const_assert!(std::mem::size_of::<usize>() >= 8);
    }
}
