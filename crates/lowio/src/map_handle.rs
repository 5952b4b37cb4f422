// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapped views of sections and anonymous memory.
//!
//! A [`MapHandle`] is a view of a [`SectionHandle`](crate::SectionHandle) —
//! or of fresh anonymous pages if no section is supplied — in the process
//! address space. The **reservation** (virtual address range) and the
//! **committed length** are distinct: mapping with [`MemoryFlags::NOCOMMIT`]
//! reserves addresses without backing them, and [`commit`](MapHandle::commit)
//! later promotes page-aligned regions to usable memory.
//!
//! Reads and writes through a map are pure memory copies clamped to the
//! committed length; no syscall is involved, which is why
//! [`max_buffers`](crate::IoHandle::max_buffers) reports zero.

use std::ops::Range;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::{event, Level};

use crate::buffer::{Buffer, ConstBuffer, IoRequest};
use crate::deadline::Deadline;
use crate::handle::Handle;
use crate::io_handle::{BarrierKind, IoHandle};
use crate::native_handle::NativeHandle;
use crate::section_handle::SectionHandle;
use crate::{Errc, Error, Result};

bitflags::bitflags! {
    /// Permissions and behaviors for sections and maps.
    ///
    /// The effective permission of a view is the intersection of the map's
    /// flags and its section's flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryFlags: u32 {
        /// Pages may be read.
        const READ = 1 << 0;
        /// Pages may be written.
        const WRITE = 1 << 1;
        /// Writes are copy-on-write: visible through this map only.
        const COW = 1 << 2;
        /// Pages may be executed.
        const EXECUTE = 1 << 3;
        /// Reserve address space without committing memory.
        const NOCOMMIT = 1 << 4;
        /// Fault all pages in immediately.
        const PREFAULT = 1 << 5;
        /// The section may be opened by name at most once (Windows only).
        const SINGLETON = 1 << 6;
        /// Issue a barrier over the whole map before closing a writable map.
        const BARRIER_ON_CLOSE = 1 << 7;
    }
}

impl MemoryFlags {
    /// Read + write, the common case.
    #[must_use]
    pub const fn readwrite() -> Self {
        Self::READ.union(Self::WRITE)
    }
}

/// The system page size.
#[must_use]
pub fn page_size() -> usize {
    static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
        #[cfg(unix)]
        {
            // SAFETY: plain sysconf query.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size <= 0 {
                4096
            } else {
                size as usize
            }
        }
        #[cfg(windows)]
        {
            use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
            let mut info = SYSTEM_INFO::default();
            // SAFETY: out-param struct on the stack.
            unsafe { GetSystemInfo(&mut info) };
            info.dwPageSize as usize
        }
    });
    *PAGE_SIZE
}

/// Rounds `value` down to a page boundary.
#[must_use]
pub(crate) fn page_floor(value: usize) -> usize {
    value & !(page_size() - 1)
}

/// Rounds `value` up to a page boundary.
#[must_use]
pub(crate) fn page_ceil(value: usize) -> usize {
    value.checked_add(page_size() - 1).map_or(usize::MAX & !(page_size() - 1), page_floor)
}

/// A mapped view of a section, or of anonymous memory.
///
/// Unmap happens on drop; the section (and its backing file) must outlive
/// the map. Closing a writable map whose flags include
/// [`MemoryFlags::BARRIER_ON_CLOSE`] issues a blocking barrier first.
#[derive(Debug)]
pub struct MapHandle {
    handle: Handle,
    addr: *mut u8,
    reservation: usize,
    length: usize,
    offset: u64,
    flags: MemoryFlags,
    /// Borrowed descriptor of the backing file, if file-backed. Never closed
    /// by the map.
    backing: NativeHandle,
}

// SAFETY: the map exclusively owns its pages; the raw pointer is not shared
// except through the i/o methods, which follow &self/&mut self discipline.
unsafe impl Send for MapHandle {}
// SAFETY: as above.
unsafe impl Sync for MapHandle {}

impl MapHandle {
    /// Maps fresh anonymous memory of at least `bytes` bytes (rounded up to
    /// page granularity).
    ///
    /// With [`MemoryFlags::NOCOMMIT`], address space is reserved but no
    /// memory is committed; the committed length starts at zero.
    pub fn map(bytes: usize, flags: MemoryFlags) -> Result<Self> {
        if bytes == 0 {
            return Err(Error::generic(Errc::ArgumentOutOfDomain));
        }
        let reservation = page_ceil(bytes);
        let addr = os::map_anonymous(reservation, flags)?;
        event!(Level::TRACE, addr = ?addr, reservation, "mapped anonymous memory");
        Ok(Self {
            handle: Handle::invalid(),
            addr,
            reservation,
            length: if flags.contains(MemoryFlags::NOCOMMIT) { 0 } else { reservation },
            offset: 0,
            flags,
            backing: NativeHandle::INVALID,
        })
    }

    /// Maps a view of `section` covering `bytes` bytes starting at `offset`
    /// within the section. A `bytes` of zero means "to the end of the
    /// section". `offset` must be page-aligned.
    ///
    /// The view's effective permissions are the intersection of `flags` and
    /// the section's flags.
    pub fn map_section(section: &SectionHandle, bytes: usize, offset: u64, flags: MemoryFlags) -> Result<Self> {
        if offset % page_size() as u64 != 0 {
            return Err(Error::generic(Errc::InvalidArgument));
        }
        let section_length = section.length()?;
        let available = section_length.saturating_sub(offset);
        let bytes = if bytes == 0 {
            usize::try_from(available).map_err(|_| Error::generic(Errc::ValueTooLarge))?
        } else {
            bytes
        };
        let effective = flags & (section.flags() | MemoryFlags::BARRIER_ON_CLOSE | MemoryFlags::PREFAULT);
        let reservation = page_ceil(bytes);
        let addr = os::map_section(section.backing_native(), reservation, offset, effective)?;
        event!(Level::TRACE, addr = ?addr, reservation, offset, "mapped section view");
        Ok(Self {
            handle: Handle::invalid(),
            addr,
            reservation,
            length: bytes,
            offset,
            flags: effective,
            backing: *section.backing_native(),
        })
    }

    /// The base address of the view.
    #[must_use]
    pub const fn address(&self) -> *mut u8 {
        self.addr
    }

    /// The committed length in bytes.
    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    /// The reserved address range length in bytes.
    #[must_use]
    pub const fn reservation(&self) -> usize {
        self.reservation
    }

    /// The offset of this view within its section.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// The flags of this view.
    #[must_use]
    pub const fn flags(&self) -> MemoryFlags {
        self.flags
    }

    /// The committed bytes as a shared slice.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        if self.length == 0 {
            return &[];
        }
        // SAFETY: [addr, addr+length) is committed, mapped memory owned by
        // this view.
        unsafe { std::slice::from_raw_parts(self.addr, self.length) }
    }

    /// The committed bytes as a mutable slice.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.length == 0 {
            return &mut [];
        }
        // SAFETY: as `as_slice`, with exclusivity from `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.addr, self.length) }
    }

    /// Commits `region` (page-aligned, relative to the view base) with the
    /// given permissions and issues a read-ahead hint.
    pub fn commit(&mut self, region: Range<usize>, flags: MemoryFlags) -> Result<Range<usize>> {
        self.check_page_aligned(&region)?;
        os::commit(self.addr, &region, flags)?;
        if region.end > self.length {
            self.length = region.end;
        }
        Ok(region)
    }

    /// Tells the kernel the pages of `region` (page-aligned) are transient:
    /// they are decommitted and become no-access.
    pub fn decommit(&mut self, region: Range<usize>) -> Result<Range<usize>> {
        self.check_page_aligned(&region)?;
        os::decommit(self.addr, &region)?;
        Ok(region)
    }

    /// Fills `region` with zeros. Fully page-aligned sub-ranges are
    /// deallocated (hole-punched) where the kernel supports it; the
    /// misaligned head and tail are zeroed by hand.
    pub fn zero_memory(&mut self, region: Range<usize>) -> Result<()> {
        if region.end > self.length || region.start > region.end {
            return Err(Error::generic(Errc::ArgumentOutOfDomain));
        }
        let aligned = page_ceil(region.start)..page_floor(region.end);
        if aligned.start < aligned.end && os::release_range(self.addr, &aligned).is_ok() {
            // Zero the misaligned head and tail only.
            self.as_mut_slice()[region.start..aligned.start].fill(0);
            let tail = aligned.end;
            self.as_mut_slice()[tail..region.end].fill(0);
            return Ok(());
        }
        self.as_mut_slice()[region].fill(0);
        Ok(())
    }

    /// Hints that the dirty state of `region` need not be preserved. After
    /// this call the contents of the region are unspecified: they may read
    /// as zero or as the last persisted version.
    ///
    /// Returns the page-aligned subrange the hint was applied to, which is
    /// empty if the kernel lacks support.
    pub fn do_not_store(&mut self, region: Range<usize>) -> Result<Range<usize>> {
        if region.end > self.reservation || region.start > region.end {
            return Err(Error::generic(Errc::ArgumentOutOfDomain));
        }
        let aligned = page_ceil(region.start)..page_floor(region.end);
        if aligned.start >= aligned.end {
            return Ok(region.start..region.start);
        }
        os::do_not_store(self.addr, &aligned);
        Ok(aligned)
    }

    /// Begins asynchronous read-ahead of the given regions. Returns the
    /// regions the hint covered (empty where the kernel lacks support).
    pub fn prefetch(&self, regions: &[Range<usize>]) -> Result<Vec<Range<usize>>> {
        let mut covered = Vec::with_capacity(regions.len());
        for region in regions {
            let aligned = page_floor(region.start)..page_ceil(region.end);
            if aligned.end > self.reservation || aligned.start >= aligned.end {
                continue;
            }
            if os::prefetch(self.addr, &aligned).is_ok() {
                covered.push(aligned);
            }
        }
        Ok(covered)
    }

    /// Grows or shrinks the reservation to `new_size` bytes (rounded up to
    /// page granularity).
    ///
    /// Growth may relocate the view if `permit_relocation` is set; without
    /// it, failure to extend in place reports
    /// [`Errc::NotEnoughMemory`]. Shrinking unmaps the suffix and never
    /// relocates.
    pub fn truncate(&mut self, new_size: usize, permit_relocation: bool) -> Result<usize> {
        if new_size == 0 {
            return Err(Error::generic(Errc::ArgumentOutOfDomain));
        }
        let new_reservation = page_ceil(new_size);
        if new_reservation == self.reservation {
            if !self.flags.contains(MemoryFlags::NOCOMMIT) {
                self.length = new_size;
            }
            return Ok(self.reservation);
        }
        let addr = os::remap(self.addr, self.reservation, new_reservation, permit_relocation, self.flags)?;
        self.addr = addr;
        self.reservation = new_reservation;
        if self.flags.contains(MemoryFlags::NOCOMMIT) {
            self.length = self.length.min(new_reservation);
        } else {
            self.length = new_size;
        }
        Ok(self.reservation)
    }

    fn check_page_aligned(&self, region: &Range<usize>) -> Result<()> {
        let page = page_size();
        if region.start % page != 0
            || region.end % page != 0
            || region.start > region.end
            || region.end > self.reservation
        {
            return Err(Error::generic(Errc::InvalidArgument));
        }
        Ok(())
    }

    fn barrier_range(&self, range: Option<Range<u64>>) -> Range<usize> {
        let range = range.unwrap_or(0..self.length as u64);
        let start = (range.start as usize).min(self.length);
        let end = (range.end as usize).min(self.length);
        page_floor(start)..page_ceil(end).min(self.reservation)
    }

    fn unmap(&mut self) {
        if self.addr.is_null() {
            return;
        }
        if self.flags.contains(MemoryFlags::BARRIER_ON_CLOSE) && self.flags.contains(MemoryFlags::WRITE) {
            if let Err(error) = self.barrier(None, BarrierKind::WaitAll, None) {
                event!(Level::ERROR, %error, "barrier on map close failed");
            }
        }
        if let Err(error) = os::unmap(self.addr, self.reservation) {
            // An unmap failure means the address space is in an unknown
            // state; continuing risks handing these pages to someone else.
            event!(Level::ERROR, %error, addr = ?self.addr, "fatal: unmapping failed");
            std::process::abort();
        }
        self.addr = std::ptr::null_mut();
    }
}

impl crate::io_handle::AsHandle for MapHandle {
    fn as_handle(&self) -> &Handle {
        &self.handle
    }
}

impl IoHandle for MapHandle {
    /// Maps copy bytes in user space; no syscall is involved.
    fn max_buffers(&self) -> usize {
        0
    }

    /// Returns buffers aliasing the map itself, clamped to the committed
    /// length. The tail past `length()` comes back as zero-length buffers.
    fn read<'call, 'mem>(
        &'mem self,
        request: IoRequest<'call, Buffer<'mem>>,
        _deadline: Option<Deadline>,
    ) -> Result<&'call mut [Buffer<'mem>]> {
        let IoRequest { buffers, offset } = request;
        let mut position = (offset as usize).min(self.length);
        for buffer in buffers.iter_mut() {
            let take = buffer.len().min(self.length - position);
            // SAFETY: [position, position+take) is committed map memory; the
            // &'mem self borrow keeps the map alive while the caller uses
            // the returned aliases.
            let alias = unsafe { std::slice::from_raw_parts_mut(self.addr.add(position), take) };
            buffer.reset(alias);
            position += take;
        }
        Ok(buffers)
    }

    /// Copies into the map, clamped to the committed length.
    fn write<'call, 'mem>(
        &'mem self,
        request: IoRequest<'call, ConstBuffer<'mem>>,
        _deadline: Option<Deadline>,
    ) -> Result<&'call mut [ConstBuffer<'mem>]> {
        if !self.flags.contains(MemoryFlags::WRITE) {
            return Err(Error::generic(Errc::PermissionDenied));
        }
        let IoRequest { buffers, offset } = request;
        let mut position = (offset as usize).min(self.length);
        let mut written = 0usize;
        for buffer in buffers.iter_mut() {
            let requested = buffer.len();
            let take = requested.min(self.length - position);
            // SAFETY: destination is committed, writable map memory and the
            // source is a live caller buffer; ranges cannot overlap a
            // caller slice because the caller cannot hold &mut into the map
            // while calling through &self.
            unsafe {
                std::ptr::copy_nonoverlapping(buffer.as_ptr(), self.addr.add(position), take);
            }
            buffer.truncate(take);
            position += take;
            written += 1;
            if take < requested {
                break;
            }
        }
        Ok(&mut buffers[..written])
    }

    /// Flushes dirty mapped pages over `range`; with a metadata kind and a
    /// file backing, also flushes the backing's metadata.
    fn barrier(
        &self,
        range: Option<Range<u64>>,
        kind: BarrierKind,
        _deadline: Option<Deadline>,
    ) -> Result<Range<u64>> {
        let region = self.barrier_range(range);
        if region.start >= region.end {
            return Ok(region.start as u64..region.start as u64);
        }
        os::sync_range(self.addr, &region, kind.waits())?;
        if kind.includes_metadata() && self.backing.is_valid() {
            os::sync_backing(&self.backing)?;
        }
        Ok(region.start as u64..region.end as u64)
    }
}

impl Drop for MapHandle {
    fn drop(&mut self) {
        self.unmap();
    }
}

/// A reference-counted, page-aligned buffer for zero-copy i/o.
///
/// Sizes are rounded up to page granularity — use [`len`](Self::len), not
/// the size requested. Cloning shares the same memory, mirroring how an
/// in-flight operation and its submitter both hold the buffer.
#[derive(Debug, Clone)]
pub struct RegisteredBuffer {
    inner: Arc<MapHandle>,
}

impl RegisteredBuffer {
    /// Allocates at least `bytes` bytes of page-aligned memory through the
    /// map allocator.
    pub fn allocate(bytes: usize) -> Result<Self> {
        let map = MapHandle::map(bytes, MemoryFlags::readwrite())?;
        Ok(Self { inner: Arc::new(map) })
    }

    /// The usable length, possibly (considerably) larger than requested.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.length()
    }

    /// Whether the buffer has zero length. Never true for a successfully
    /// allocated buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes, shared.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.inner.as_slice()
    }

    /// The bytes, mutable. Fails if the buffer is currently shared (e.g.
    /// still held by an in-flight operation).
    #[must_use]
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.inner).map(MapHandle::as_mut_slice)
    }

    /// The bytes, mutable, without the uniqueness check.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no other clone of this buffer is being read
    /// or written for the duration of the borrow. The multiplexer relies on
    /// this while an operation is in flight: the kernel side writes, the
    /// submitter must not touch the buffer until completion.
    #[must_use]
    pub(crate) unsafe fn as_mut_slice_unchecked(&self) -> &mut [u8] {
        // SAFETY: forwarded to the caller.
        unsafe { std::slice::from_raw_parts_mut(self.inner.address(), self.inner.length()) }
    }
}

#[cfg(unix)]
mod os {
    use std::ops::Range;

    use super::MemoryFlags;
    use crate::native_handle::NativeHandle;
    use crate::{Errc, Error, Result};

    fn prot_of(flags: MemoryFlags) -> libc::c_int {
        if flags.contains(MemoryFlags::NOCOMMIT) {
            return libc::PROT_NONE;
        }
        let mut prot = 0;
        if flags.contains(MemoryFlags::READ) {
            prot |= libc::PROT_READ;
        }
        if flags.contains(MemoryFlags::WRITE) || flags.contains(MemoryFlags::COW) {
            prot |= libc::PROT_READ | libc::PROT_WRITE;
        }
        if flags.contains(MemoryFlags::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }

    pub(super) fn map_anonymous(reservation: usize, flags: MemoryFlags) -> Result<*mut u8> {
        let mut map_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if flags.contains(MemoryFlags::NOCOMMIT) {
            map_flags |= libc::MAP_NORESERVE;
        }
        #[cfg(target_os = "linux")]
        if flags.contains(MemoryFlags::PREFAULT) {
            map_flags |= libc::MAP_POPULATE;
        }
        // SAFETY: requesting a fresh mapping; the kernel chooses the address.
        let addr = unsafe {
            libc::mmap(std::ptr::null_mut(), reservation, prot_of(flags), map_flags, -1, 0)
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(addr.cast())
    }

    pub(super) fn map_section(
        backing: &NativeHandle,
        reservation: usize,
        offset: u64,
        flags: MemoryFlags,
    ) -> Result<*mut u8> {
        if !backing.is_valid() {
            return Err(Error::generic(Errc::InvalidArgument));
        }
        let mut map_flags = if flags.contains(MemoryFlags::COW) {
            libc::MAP_PRIVATE
        } else {
            libc::MAP_SHARED
        };
        #[cfg(target_os = "linux")]
        if flags.contains(MemoryFlags::PREFAULT) {
            map_flags |= libc::MAP_POPULATE;
        }
        // SAFETY: mapping a descriptor we hold; offset is page-aligned
        // (checked by the caller).
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                reservation,
                prot_of(flags),
                map_flags,
                backing.fd(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(addr.cast())
    }

    pub(super) fn unmap(addr: *mut u8, reservation: usize) -> Result<()> {
        // SAFETY: unmapping a range this module mapped.
        if unsafe { libc::munmap(addr.cast(), reservation) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn commit(base: *mut u8, region: &Range<usize>, flags: MemoryFlags) -> Result<()> {
        let len = region.end - region.start;
        // SAFETY: region is page-aligned and inside the reservation.
        let rc = unsafe { libc::mprotect(base.add(region.start).cast(), len, prot_of(flags)) };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        // SAFETY: as above; WILLNEED is advisory.
        unsafe {
            let _ = libc::madvise(base.add(region.start).cast(), len, libc::MADV_WILLNEED);
        }
        Ok(())
    }

    pub(super) fn decommit(base: *mut u8, region: &Range<usize>) -> Result<()> {
        let len = region.end - region.start;
        // SAFETY: region is page-aligned and inside the reservation.
        unsafe {
            if libc::madvise(base.add(region.start).cast(), len, libc::MADV_DONTNEED) == -1 {
                return Err(Error::last_os_error());
            }
            if libc::mprotect(base.add(region.start).cast(), len, libc::PROT_NONE) == -1 {
                return Err(Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Deallocates the extents under a page-aligned range, reading back as
    /// zeros afterwards.
    pub(super) fn release_range(base: *mut u8, region: &Range<usize>) -> Result<()> {
        let len = region.end - region.start;
        #[cfg(target_os = "linux")]
        {
            // SAFETY: region is page-aligned and inside the reservation.
            if unsafe { libc::madvise(base.add(region.start).cast(), len, libc::MADV_REMOVE) } == -1 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (base, len);
            Err(Error::generic(Errc::NotSupported))
        }
    }

    /// Dirty-state hint: MADV_FREE only. Best-effort; see DESIGN.md for why
    /// the stronger hole-punching fallback is not used.
    pub(super) fn do_not_store(base: *mut u8, region: &Range<usize>) {
        #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
        {
            let len = region.end - region.start;
            // SAFETY: region is page-aligned and inside the reservation.
            unsafe {
                let _ = libc::madvise(base.add(region.start).cast(), len, libc::MADV_FREE);
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
        {
            let _ = (base, region);
        }
    }

    pub(super) fn prefetch(base: *mut u8, region: &Range<usize>) -> Result<()> {
        let len = region.end - region.start;
        // SAFETY: region is page-aligned and inside the reservation.
        if unsafe { libc::madvise(base.add(region.start).cast(), len, libc::MADV_WILLNEED) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn sync_range(base: *mut u8, region: &Range<usize>, wait: bool) -> Result<()> {
        let len = region.end - region.start;
        let flags = if wait { libc::MS_SYNC } else { libc::MS_ASYNC };
        // SAFETY: region is page-aligned and inside the reservation.
        if unsafe { libc::msync(base.add(region.start).cast(), len, flags) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn sync_backing(backing: &NativeHandle) -> Result<()> {
        // SAFETY: plain fsync of a descriptor we borrow.
        if unsafe { libc::fsync(backing.fd()) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    pub(super) fn remap(
        addr: *mut u8,
        old_reservation: usize,
        new_reservation: usize,
        permit_relocation: bool,
        _flags: MemoryFlags,
    ) -> Result<*mut u8> {
        let remap_flags = if permit_relocation { libc::MREMAP_MAYMOVE } else { 0 };
        // SAFETY: remapping a range this module mapped.
        let new_addr = unsafe { libc::mremap(addr.cast(), old_reservation, new_reservation, remap_flags) };
        if new_addr == libc::MAP_FAILED {
            let error = Error::last_os_error();
            return Err(if error.errc() == Some(Errc::NotEnoughMemory) {
                error
            } else {
                Error::generic(Errc::NotEnoughMemory)
            });
        }
        Ok(new_addr.cast())
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn remap(
        addr: *mut u8,
        old_reservation: usize,
        new_reservation: usize,
        _permit_relocation: bool,
        flags: MemoryFlags,
    ) -> Result<*mut u8> {
        if new_reservation < old_reservation {
            // Shrink: unmap the suffix in place.
            // SAFETY: the suffix belongs to this mapping.
            let rc = unsafe {
                libc::munmap(addr.add(new_reservation).cast(), old_reservation - new_reservation)
            };
            if rc == -1 {
                return Err(Error::last_os_error());
            }
            return Ok(addr);
        }
        // Grow: attempt an additional contiguous anonymous mapping right
        // after the existing reservation and unwind if the kernel places it
        // elsewhere.
        let tail_len = new_reservation - old_reservation;
        // SAFETY: hinting at the address just past our reservation.
        let tail = unsafe {
            libc::mmap(
                addr.add(old_reservation).cast(),
                tail_len,
                prot_of(flags),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if tail == libc::MAP_FAILED {
            return Err(Error::generic(Errc::NotEnoughMemory));
        }
        if tail.cast::<u8>() != unsafe { addr.add(old_reservation) } {
            // SAFETY: unwinding the mapping we just created.
            unsafe {
                let _ = libc::munmap(tail, tail_len);
            }
            return Err(Error::generic(Errc::NotEnoughMemory));
        }
        Ok(addr)
    }
}

#[cfg(windows)]
mod os {
    use std::ops::Range;

    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Memory::{
        FlushViewOfFile, MapViewOfFile, UnmapViewOfFile, VirtualAlloc, VirtualFree,
        FILE_MAP_COPY, FILE_MAP_READ, FILE_MAP_WRITE, MEMORY_MAPPED_VIEW_ADDRESS, MEM_COMMIT,
        MEM_DECOMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_READONLY,
        PAGE_READWRITE,
    };
    use windows::Win32::Storage::FileSystem::FlushFileBuffers;

    use super::MemoryFlags;
    use crate::native_handle::NativeHandle;
    use crate::{Errc, Error, Result};

    fn protect_of(flags: MemoryFlags) -> windows::Win32::System::Memory::PAGE_PROTECTION_FLAGS {
        if flags.contains(MemoryFlags::NOCOMMIT) {
            PAGE_NOACCESS
        } else if flags.contains(MemoryFlags::EXECUTE) {
            PAGE_EXECUTE_READWRITE
        } else if flags.contains(MemoryFlags::WRITE) || flags.contains(MemoryFlags::COW) {
            PAGE_READWRITE
        } else {
            PAGE_READONLY
        }
    }

    pub(super) fn map_anonymous(reservation: usize, flags: MemoryFlags) -> Result<*mut u8> {
        let allocation = if flags.contains(MemoryFlags::NOCOMMIT) {
            MEM_RESERVE
        } else {
            MEM_RESERVE | MEM_COMMIT
        };
        // SAFETY: fresh allocation, kernel chooses the address.
        let addr = unsafe { VirtualAlloc(None, reservation, allocation, protect_of(flags)) };
        if addr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(addr.cast())
    }

    pub(super) fn map_section(
        backing: &NativeHandle,
        reservation: usize,
        offset: u64,
        flags: MemoryFlags,
    ) -> Result<*mut u8> {
        let mut access = FILE_MAP_READ;
        if flags.contains(MemoryFlags::COW) {
            access = FILE_MAP_COPY;
        } else if flags.contains(MemoryFlags::WRITE) {
            access |= FILE_MAP_WRITE;
        }
        // SAFETY: mapping a section handle we borrow.
        let view = unsafe {
            MapViewOfFile(
                HANDLE(backing.raw_handle()),
                access,
                (offset >> 32) as u32,
                offset as u32,
                reservation,
            )
        };
        if view.Value.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(view.Value.cast())
    }

    pub(super) fn unmap(addr: *mut u8, reservation: usize) -> Result<()> {
        let _ = reservation;
        let view = MEMORY_MAPPED_VIEW_ADDRESS { Value: addr.cast() };
        // SAFETY: unmapping a view this module mapped; falls back to
        // VirtualFree for anonymous allocations.
        unsafe {
            if UnmapViewOfFile(view).is_ok() {
                return Ok(());
            }
            VirtualFree(addr.cast(), 0, windows::Win32::System::Memory::MEM_RELEASE)
                .map_err(|_| Error::last_os_error())
        }
    }

    pub(super) fn commit(base: *mut u8, region: &Range<usize>, flags: MemoryFlags) -> Result<()> {
        // SAFETY: committing inside our own reservation.
        let addr = unsafe {
            VirtualAlloc(
                Some(base.add(region.start).cast()),
                region.end - region.start,
                MEM_COMMIT,
                protect_of(flags),
            )
        };
        if addr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn decommit(base: *mut u8, region: &Range<usize>) -> Result<()> {
        // SAFETY: decommitting inside our own reservation.
        unsafe {
            VirtualFree(base.add(region.start).cast(), region.end - region.start, MEM_DECOMMIT)
        }
        .map_err(|_| Error::last_os_error())
    }

    pub(super) fn release_range(base: *mut u8, region: &Range<usize>) -> Result<()> {
        use windows::Win32::System::Memory::DiscardVirtualMemory;
        // SAFETY: discarding inside our own reservation.
        let rc = unsafe { DiscardVirtualMemory(base.add(region.start).cast(), region.end - region.start) };
        if rc.is_err() {
            return Err(Error::generic(Errc::NotSupported));
        }
        Ok(())
    }

    pub(super) fn do_not_store(_base: *mut u8, _region: &Range<usize>) {
        // No-op for file-backed maps on Windows.
    }

    pub(super) fn prefetch(_base: *mut u8, _region: &Range<usize>) -> Result<()> {
        // PrefetchVirtualMemory is absent before Windows 8; report lack of
        // support so the caller returns an empty span.
        Err(Error::generic(Errc::NotSupported))
    }

    pub(super) fn sync_range(base: *mut u8, region: &Range<usize>, _wait: bool) -> Result<()> {
        // SAFETY: flushing inside our own view.
        unsafe { FlushViewOfFile(base.add(region.start).cast(), region.end - region.start) }
            .map_err(|_| Error::last_os_error())
    }

    pub(super) fn sync_backing(backing: &NativeHandle) -> Result<()> {
        // SAFETY: flushing a handle we borrow.
        unsafe { FlushFileBuffers(HANDLE(backing.raw_handle())) }.map_err(|_| Error::last_os_error())
    }

    pub(super) fn remap(
        _addr: *mut u8,
        _old_reservation: usize,
        _new_reservation: usize,
        _permit_relocation: bool,
        _flags: MemoryFlags,
    ) -> Result<*mut u8> {
        Err(Error::generic(Errc::NotSupported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        let page = page_size();
        assert_eq!(page_floor(0), 0);
        assert_eq!(page_ceil(0), 0);
        assert_eq!(page_ceil(1), page);
        assert_eq!(page_floor(page + 1), page);
        assert_eq!(page_ceil(page), page);
    }

    #[test]
    fn anonymous_map_round_trips_data() {
        let mut map = MapHandle::map(8192, MemoryFlags::readwrite()).expect("map");
        assert!(map.length() >= 8192);
        assert_eq!(map.length(), map.reservation());

        map.as_mut_slice()[..5].copy_from_slice(b"hello");
        assert_eq!(&map.as_slice()[..5], b"hello");
    }

    #[test]
    fn map_io_is_memcpy_with_no_syscall_budget() {
        let map = MapHandle::map(page_size(), MemoryFlags::readwrite()).expect("map");
        assert_eq!(map.max_buffers(), 0);
    }

    #[test]
    fn write_then_read_through_io_interface() {
        let map = MapHandle::map(page_size(), MemoryFlags::readwrite()).expect("map");

        let payload = *b"mapped bytes";
        let mut write_buffers = [ConstBuffer::new(&payload)];
        let written = map
            .write(IoRequest::new(&mut write_buffers, 3), None)
            .expect("write");
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].len(), payload.len());

        let mut scratch = [0u8; 12];
        let mut read_buffers = [Buffer::new(&mut scratch)];
        let read = map.read(IoRequest::new(&mut read_buffers, 3), None).expect("read");
        // The returned buffer aliases the map, not our scratch array.
        assert_eq!(read[0].as_slice(), b"mapped bytes");
        assert_eq!(read[0].as_ptr(), unsafe { map.address().add(3) });
    }

    #[test]
    fn reads_past_length_are_zero_length_not_errors() {
        let map = MapHandle::map(page_size(), MemoryFlags::readwrite()).expect("map");
        let mut scratch = [0u8; 64];
        let mut buffers = [Buffer::new(&mut scratch)];
        let read = map
            .read(IoRequest::new(&mut buffers, map.length() as u64 + 100), None)
            .expect("read");
        assert_eq!(read[0].len(), 0);
    }

    #[test]
    fn zero_memory_zeroes_unaligned_ranges() {
        let mut map = MapHandle::map(3 * page_size(), MemoryFlags::readwrite()).expect("map");
        map.as_mut_slice().fill(0xAB);
        let range = 7..(2 * page_size() + 13);
        map.zero_memory(range.clone()).expect("zero_memory");
        assert!(map.as_slice()[range].iter().all(|&b| b == 0));
        // Outside the range is untouched.
        assert_eq!(map.as_slice()[0], 0xAB);
        assert_eq!(map.as_slice()[2 * page_size() + 13], 0xAB);
    }

    #[test]
    fn commit_requires_page_alignment() {
        let mut map = MapHandle::map(page_size() * 2, MemoryFlags::NOCOMMIT | MemoryFlags::readwrite())
            .expect("map");
        assert_eq!(map.length(), 0);
        let err = map.commit(1..17, MemoryFlags::readwrite()).expect_err("misaligned");
        assert_eq!(err.errc(), Some(Errc::InvalidArgument));

        map.commit(0..page_size(), MemoryFlags::readwrite()).expect("aligned commit");
        assert_eq!(map.length(), page_size());
        map.as_mut_slice()[0] = 1;
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn truncate_grows_and_shrinks() {
        let mut map = MapHandle::map(page_size(), MemoryFlags::readwrite()).expect("map");
        map.as_mut_slice()[0] = 42;

        map.truncate(page_size() * 4, true).expect("grow");
        assert_eq!(map.reservation(), page_size() * 4);
        assert_eq!(map.as_slice()[0], 42, "contents survive relocation");

        map.truncate(page_size(), true).expect("shrink");
        assert_eq!(map.reservation(), page_size());
    }

    #[test]
    fn registered_buffer_is_page_rounded_and_shared() {
        let mut buffer = RegisteredBuffer::allocate(100).expect("allocate");
        assert!(buffer.len() >= page_size());

        buffer.as_mut_slice().expect("unique")[0] = 7;
        let clone = buffer.clone();
        assert!(buffer.as_mut_slice().is_none(), "shared buffers are not uniquely mutable");
        assert_eq!(clone.as_slice()[0], 7);
    }
}
