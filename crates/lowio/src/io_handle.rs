// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scatter/gather byte i/o over a [`Handle`].
//!
//! The [`IoHandle`] trait adds `read`, `write` and `barrier` to any handle
//! type. The default implementations perform blocking positional i/o with
//! the platform's vectored syscalls; deadline support on handles opened
//! multiplexable is emulated with the kernel's readiness poll, exactly one
//! extra syscall per blocked attempt.
//!
//! Handle types whose i/o never touches the kernel (maps, mapped files)
//! override the defaults with pure memcpy implementations and report
//! [`max_buffers`](IoHandle::max_buffers) of zero.

use std::ops::Range;
use std::time::Instant;

use crate::buffer::{Buffer, ConstBuffer, IoRequest};
use crate::deadline::Deadline;
use crate::handle::Handle;
use crate::map_handle::RegisteredBuffer;
use crate::{Errc, Error, Result};

/// The kinds of write-reordering barrier.
///
/// A barrier ensures writes issued before it reach storage before writes
/// issued after it. It does not promise durability, and it may legally be a
/// no-op on filesystems that cannot express the requested flush; it never
/// corrupts data. Callers must not depend on cross-handle or cross-process
/// ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum BarrierKind {
    /// Barrier data only, without waiting for completion.
    #[display("nowait data only")]
    NowaitDataOnly,
    /// Barrier data only, wait until done.
    #[display("wait data only")]
    WaitDataOnly,
    /// Barrier data and the metadata needed to retrieve it, without waiting.
    #[display("nowait all")]
    NowaitAll,
    /// Barrier data and metadata, wait until done.
    #[display("wait all")]
    WaitAll,
}

impl BarrierKind {
    /// Whether this kind also flushes metadata.
    #[must_use]
    pub const fn includes_metadata(&self) -> bool {
        matches!(self, Self::NowaitAll | Self::WaitAll)
    }

    /// Whether the caller wants to wait for the flush to finish.
    #[must_use]
    pub const fn waits(&self) -> bool {
        matches!(self, Self::WaitDataOnly | Self::WaitAll)
    }
}

/// The sector alignment required of offsets, addresses and lengths when a
/// handle was opened with direct (uncached) i/o.
pub const DIRECT_IO_ALIGNMENT: u64 = 512;

/// Access to the owned [`Handle`] of a concrete handle type.
///
/// The capability traits ([`IoHandle`], [`FsHandle`](crate::FsHandle)) all
/// build on this.
pub trait AsHandle {
    /// The underlying handle.
    fn as_handle(&self) -> &Handle;
}

/// Byte i/o operations over a handle.
pub trait IoHandle: AsHandle {
    /// The maximum number of buffers a single `read` or `write` accepts
    /// atomically. Zero means i/o is pure memory copying with no syscall
    /// involved.
    fn max_buffers(&self) -> usize {
        max_gather_buffers()
    }

    /// Reads data into the request's buffers from `request.offset`.
    ///
    /// Returns the filled prefix of the submitted buffers, each entry's
    /// length overwritten with the bytes actually transferred. For mapped
    /// i/o the returned buffers alias internal memory and **must** be used
    /// as returned. Partial completion is legal.
    ///
    /// # Errors
    ///
    /// - [`Errc::NotSupported`] for a deadlined read on a handle not opened
    ///   multiplexable.
    /// - [`Errc::TimedOut`] when the deadline expires first; cancellation is
    ///   best-effort and the call may return after the deadline.
    /// - [`Errc::ArgumentListTooLong`] for more than
    ///   [`max_buffers`](Self::max_buffers) buffers.
    fn read<'call, 'mem>(
        &'mem self,
        request: IoRequest<'call, Buffer<'mem>>,
        deadline: Option<Deadline>,
    ) -> Result<&'call mut [Buffer<'mem>]> {
        blocking_read(self.as_handle(), request, deadline)
    }

    /// Writes the request's buffers at `request.offset`.
    ///
    /// Returns the written prefix with lengths overwritten by the bytes
    /// actually transferred. On append-only handles the offset is ignored
    /// and the write lands atomically at end of file.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read).
    fn write<'call, 'mem>(
        &'mem self,
        request: IoRequest<'call, ConstBuffer<'mem>>,
        deadline: Option<Deadline>,
    ) -> Result<&'call mut [ConstBuffer<'mem>]> {
        blocking_write(self.as_handle(), request, deadline)
    }

    /// Issues a write-reordering barrier over `range` (the whole file if
    /// `None`). Returns the range actually barriered, which may be smaller.
    fn barrier(
        &self,
        range: Option<Range<u64>>,
        kind: BarrierKind,
        deadline: Option<Deadline>,
    ) -> Result<Range<u64>> {
        let _ = deadline;
        blocking_barrier(self.as_handle(), range, kind)
    }

    /// Allocates a reference-counted buffer suitable for zero-copy i/o with
    /// a multiplexer. The returned length may be (considerably) larger than
    /// requested; use the returned length.
    fn allocate_registered_buffer(&self, bytes: usize) -> Result<RegisteredBuffer> {
        RegisteredBuffer::allocate(bytes)
    }
}

/// The platform's scatter/gather vector limit for kernel i/o.
#[must_use]
pub(crate) fn max_gather_buffers() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: plain sysconf query.
        let limit = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
        if limit <= 0 {
            16 // POSIX minimum
        } else {
            limit as usize
        }
    }
    #[cfg(windows)]
    {
        // No scatter/gather for cached file handles.
        1
    }
}

fn check_alignment_read(h: &Handle, request: &IoRequest<'_, Buffer<'_>>) -> Result<()> {
    if !h.requires_aligned_io() {
        return Ok(());
    }
    let misaligned = request.offset % DIRECT_IO_ALIGNMENT != 0
        || request.buffers.iter().any(|b| {
            (b.as_ptr() as u64) % DIRECT_IO_ALIGNMENT != 0 || (b.len() as u64) % DIRECT_IO_ALIGNMENT != 0
        });
    if misaligned {
        return Err(Error::generic(Errc::InvalidArgument));
    }
    Ok(())
}

fn check_alignment_write(h: &Handle, request: &IoRequest<'_, ConstBuffer<'_>>) -> Result<()> {
    if !h.requires_aligned_io() {
        return Ok(());
    }
    let misaligned = request.offset % DIRECT_IO_ALIGNMENT != 0
        || request.buffers.iter().any(|b| {
            (b.as_ptr() as u64) % DIRECT_IO_ALIGNMENT != 0 || (b.len() as u64) % DIRECT_IO_ALIGNMENT != 0
        });
    if misaligned {
        return Err(Error::generic(Errc::InvalidArgument));
    }
    Ok(())
}

fn check_deadline_supported(h: &Handle, deadline: Option<Deadline>) -> Result<()> {
    if deadline.is_some() && !h.is_multiplexable() {
        return Err(Error::generic(Errc::NotSupported));
    }
    Ok(())
}

/// Truncates `buffers` to the prefix covering `transferred` bytes and
/// rewrites each length to what was actually filled.
pub(crate) fn split_filled_prefix<'call, 'mem>(
    buffers: &'call mut [Buffer<'mem>],
    mut transferred: usize,
) -> &'call mut [Buffer<'mem>] {
    let mut filled = 0;
    for buffer in buffers.iter_mut() {
        if transferred == 0 {
            break;
        }
        let take = transferred.min(buffer.len());
        buffer.truncate(take);
        transferred -= take;
        filled += 1;
    }
    &mut buffers[..filled]
}

pub(crate) fn split_written_prefix<'call, 'mem>(
    buffers: &'call mut [ConstBuffer<'mem>],
    mut transferred: usize,
) -> &'call mut [ConstBuffer<'mem>] {
    let mut written = 0;
    for buffer in buffers.iter_mut() {
        if transferred == 0 {
            break;
        }
        let take = transferred.min(buffer.len());
        buffer.truncate(take);
        transferred -= take;
        written += 1;
    }
    &mut buffers[..written]
}

#[cfg(unix)]
pub(crate) fn blocking_read<'call, 'mem>(
    h: &Handle,
    request: IoRequest<'call, Buffer<'mem>>,
    deadline: Option<Deadline>,
) -> Result<&'call mut [Buffer<'mem>]> {
    check_deadline_supported(h, deadline)?;
    check_alignment_read(h, &request)?;
    if request.buffers.len() > max_gather_buffers() {
        return Err(Error::generic(Errc::ArgumentListTooLong));
    }

    let began = Instant::now();
    let fd = h.native().fd();
    let seekable = h.native().is_seekable();
    let IoRequest { buffers, offset } = request;

    loop {
        let iovecs = crate::buffer::as_iovecs_mut(buffers);
        // SAFETY: the iovecs view live caller buffers for the duration of
        // the call.
        let n = unsafe {
            if seekable {
                libc::preadv(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int, offset as libc::off_t)
            } else {
                libc::readv(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int)
            }
        };
        if n >= 0 {
            return Ok(split_filled_prefix(buffers, n as usize));
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => {}
            Some(libc::EAGAIN) => wait_until_ready(fd, Interest::Read, deadline, began)?,
            _ => return Err(Error::last_os_error()),
        }
    }
}

#[cfg(unix)]
pub(crate) fn blocking_write<'call, 'mem>(
    h: &Handle,
    request: IoRequest<'call, ConstBuffer<'mem>>,
    deadline: Option<Deadline>,
) -> Result<&'call mut [ConstBuffer<'mem>]> {
    check_deadline_supported(h, deadline)?;
    check_alignment_write(h, &request)?;
    if request.buffers.len() > max_gather_buffers() {
        return Err(Error::generic(Errc::ArgumentListTooLong));
    }

    let began = Instant::now();
    let fd = h.native().fd();
    // Append-only and non-seekable handles position themselves.
    let seekable = h.native().is_seekable() && !h.native().is_append_only();
    let IoRequest { buffers, offset } = request;

    loop {
        let iovecs = crate::buffer::as_iovecs(buffers);
        // SAFETY: the iovecs view live caller buffers for the duration of
        // the call.
        let n = unsafe {
            if seekable {
                libc::pwritev(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int, offset as libc::off_t)
            } else {
                libc::writev(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int)
            }
        };
        if n >= 0 {
            return Ok(split_written_prefix(buffers, n as usize));
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => {}
            Some(libc::EAGAIN) => wait_until_ready(fd, Interest::Write, deadline, began)?,
            _ => return Err(Error::last_os_error()),
        }
    }
}

#[cfg(unix)]
pub(crate) fn blocking_barrier(h: &Handle, range: Option<Range<u64>>, kind: BarrierKind) -> Result<Range<u64>> {
    let fd = h.native().fd();
    let barriered = range.unwrap_or(0..u64::MAX);

    #[cfg(target_os = "linux")]
    if !kind.waits() && !kind.includes_metadata() {
        // SAFETY: asynchronous writeback initiation over the given range.
        let rc = unsafe {
            libc::sync_file_range(
                fd,
                barriered.start as libc::off64_t,
                barriered.end.saturating_sub(barriered.start) as libc::off64_t,
                libc::SYNC_FILE_RANGE_WRITE,
            )
        };
        if rc == 0 {
            return Ok(barriered);
        }
        // Fall through to fdatasync below for filesystems without it.
    }

    // SAFETY: plain sync calls.
    let rc = unsafe {
        if kind.includes_metadata() {
            libc::fsync(fd)
        } else {
            libc::fdatasync(fd)
        }
    };
    if rc == -1 {
        match std::io::Error::last_os_error().raw_os_error() {
            // Pipes and some filesystems cannot express the flush; the
            // barrier legally degrades to a no-op.
            Some(libc::EINVAL | libc::EROFS | libc::ENOTSUP) => return Ok(barriered.start..barriered.start),
            _ => return Err(Error::last_os_error()),
        }
    }
    Ok(barriered)
}

/// Readiness interest for [`wait_until_ready`].
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// Sleeps in `poll(2)` until `fd` is ready or the deadline expires.
///
/// Deadline expiry reports [`Errc::TimedOut`]; a zero deadline polls.
#[cfg(unix)]
pub(crate) fn wait_until_ready(
    fd: std::os::unix::io::RawFd,
    interest: Interest,
    deadline: Option<Deadline>,
    began: Instant,
) -> Result<()> {
    let events = match interest {
        Interest::Read => libc::POLLIN,
        Interest::Write => libc::POLLOUT,
    };
    loop {
        let timeout_millis = match deadline {
            None => -1,
            Some(d) => {
                let remaining = d.remaining(began);
                if remaining.is_zero() {
                    return Err(Error::generic(Errc::TimedOut));
                }
                remaining.as_millis().min(i32::MAX as u128) as i32
            }
        };
        let mut pollfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: single pollfd on the stack.
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_millis) };
        match rc {
            1.. => return Ok(()),
            0 => return Err(Error::generic(Errc::TimedOut)),
            _ => match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => {}
                _ => return Err(Error::last_os_error()),
            },
        }
    }
}

#[cfg(windows)]
pub(crate) fn blocking_read<'call, 'mem>(
    h: &Handle,
    request: IoRequest<'call, Buffer<'mem>>,
    deadline: Option<Deadline>,
) -> Result<&'call mut [Buffer<'mem>]> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::ReadFile;
    use windows::Win32::System::IO::OVERLAPPED;

    check_deadline_supported(h, deadline)?;
    check_alignment_read(h, &request)?;

    let IoRequest { buffers, offset } = request;
    let handle = HANDLE(h.native().raw_handle());
    let mut transferred_total = 0usize;
    let mut position = offset;

    for buffer in buffers.iter_mut() {
        let mut overlapped = OVERLAPPED::default();
        overlapped.Anonymous.Anonymous.Offset = position as u32;
        overlapped.Anonymous.Anonymous.OffsetHigh = (position >> 32) as u32;
        let mut transferred = 0u32;
        // SAFETY: buffer lives for the duration of the synchronous call.
        let ok = unsafe {
            ReadFile(
                handle,
                Some(buffer.as_mut_slice()),
                Some(&mut transferred),
                Some(&mut overlapped),
            )
        };
        if ok.is_err() {
            if transferred_total > 0 {
                break;
            }
            return Err(Error::last_os_error());
        }
        transferred_total += transferred as usize;
        position += u64::from(transferred);
        if (transferred as usize) < buffer.len() {
            break;
        }
    }
    Ok(split_filled_prefix(buffers, transferred_total))
}

#[cfg(windows)]
pub(crate) fn blocking_write<'call, 'mem>(
    h: &Handle,
    request: IoRequest<'call, ConstBuffer<'mem>>,
    deadline: Option<Deadline>,
) -> Result<&'call mut [ConstBuffer<'mem>]> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::WriteFile;
    use windows::Win32::System::IO::OVERLAPPED;

    check_deadline_supported(h, deadline)?;
    check_alignment_write(h, &request)?;

    let IoRequest { buffers, offset } = request;
    let handle = HANDLE(h.native().raw_handle());
    let mut transferred_total = 0usize;
    let mut position = offset;

    for buffer in buffers.iter() {
        let mut overlapped = OVERLAPPED::default();
        overlapped.Anonymous.Anonymous.Offset = position as u32;
        overlapped.Anonymous.Anonymous.OffsetHigh = (position >> 32) as u32;
        let mut transferred = 0u32;
        // SAFETY: buffer lives for the duration of the synchronous call.
        let ok = unsafe {
            WriteFile(
                handle,
                Some(buffer.as_slice()),
                Some(&mut transferred),
                Some(&mut overlapped),
            )
        };
        if ok.is_err() {
            if transferred_total > 0 {
                break;
            }
            return Err(Error::last_os_error());
        }
        transferred_total += transferred as usize;
        position += u64::from(transferred);
        if (transferred as usize) < buffer.len() {
            break;
        }
    }
    Ok(split_written_prefix(buffers, transferred_total))
}

#[cfg(windows)]
pub(crate) fn blocking_barrier(h: &Handle, range: Option<Range<u64>>, kind: BarrierKind) -> Result<Range<u64>> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Storage::FileSystem::FlushFileBuffers;

    let _ = kind;
    let barriered = range.unwrap_or(0..u64::MAX);
    // SAFETY: plain flush of our own handle.
    unsafe { FlushFileBuffers(HANDLE(h.native().raw_handle())) }.map_err(|_| Error::last_os_error())?;
    Ok(barriered)
}
