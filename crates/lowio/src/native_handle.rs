// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

bitflags::bitflags! {
    /// The capabilities of a native handle.
    ///
    /// A handle's disposition is fixed when the kernel object is opened and
    /// describes what the object can do, not what the caller intends to do
    /// with it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Disposition: u32 {
        /// Is readable.
        const READABLE = 1 << 0;
        /// Is writable.
        const WRITABLE = 1 << 1;
        /// Is append only.
        const APPEND_ONLY = 1 << 2;

        /// Requires additional synchronisation (Windows `OVERLAPPED`, POSIX
        /// non-blocking).
        const OVERLAPPED = 1 << 4;
        /// Is seekable.
        const SEEKABLE = 1 << 5;
        /// Requires sector-aligned i/o (typically 512 or 4096 bytes).
        const ALIGNED_IO = 1 << 6;

        /// Is a regular file.
        const FILE = 1 << 8;
        /// Is a directory.
        const DIRECTORY = 1 << 9;
        /// Is a symlink.
        const SYMLINK = 1 << 10;
        /// Is a kqueue/epoll/io_uring/IOCP.
        const MULTIPLEXER = 1 << 11;
        /// Is a child process.
        const PROCESS = 1 << 12;
        /// Is a memory section.
        const SECTION = 1 << 13;
        /// Is a pipe.
        const PIPE = 1 << 14;
    }
}

/// An opaque descriptor for an operating system handle.
///
/// The value is a POSIX file descriptor or a Windows kernel `HANDLE`, stored
/// as a signed machine word. A `NativeHandle` has value semantics and owns
/// nothing; ownership and closing live in [`Handle`](crate::Handle).
///
/// Default construction yields the invalid descriptor (`-1`, empty
/// disposition).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle {
    /// The capabilities of the underlying kernel object.
    pub disposition: Disposition,
    value: isize,
}

impl NativeHandle {
    /// The invalid descriptor.
    pub const INVALID: Self = Self {
        disposition: Disposition::empty(),
        value: -1,
    };

    /// Wraps a POSIX file descriptor.
    #[cfg(unix)]
    #[must_use]
    pub const fn from_fd(fd: std::os::unix::io::RawFd, disposition: Disposition) -> Self {
        Self {
            disposition,
            value: fd as isize,
        }
    }

    /// Wraps a Windows kernel handle.
    #[cfg(windows)]
    #[must_use]
    pub fn from_raw_handle(
        handle: std::os::windows::io::RawHandle,
        disposition: Disposition,
    ) -> Self {
        Self {
            disposition,
            value: handle as isize,
        }
    }

    /// The POSIX file descriptor.
    #[cfg(unix)]
    #[must_use]
    pub const fn fd(&self) -> std::os::unix::io::RawFd {
        self.value as std::os::unix::io::RawFd
    }

    /// The Windows kernel handle.
    #[cfg(windows)]
    #[must_use]
    pub const fn raw_handle(&self) -> std::os::windows::io::RawHandle {
        self.value as std::os::windows::io::RawHandle
    }

    /// Whether this descriptor refers to a kernel object.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.value != -1
    }

    /// Resets to the invalid descriptor, returning the previous value.
    pub fn take(&mut self) -> Self {
        std::mem::replace(self, Self::INVALID)
    }

    /// Whether the object can be read from.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.disposition.contains(Disposition::READABLE)
    }

    /// Whether the object can be written to.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.disposition.contains(Disposition::WRITABLE)
    }

    /// Whether writes always land at the end of the object.
    #[must_use]
    pub const fn is_append_only(&self) -> bool {
        self.disposition.contains(Disposition::APPEND_ONLY)
    }

    /// Whether i/o requires additional synchronisation (can be attached to a
    /// multiplexer).
    #[must_use]
    pub const fn is_overlapped(&self) -> bool {
        self.disposition.contains(Disposition::OVERLAPPED)
    }

    /// Whether the object supports positional i/o.
    #[must_use]
    pub const fn is_seekable(&self) -> bool {
        self.disposition.contains(Disposition::SEEKABLE)
    }

    /// Whether i/o must be sector-aligned.
    #[must_use]
    pub const fn requires_aligned_io(&self) -> bool {
        self.disposition.contains(Disposition::ALIGNED_IO)
    }
}

impl Default for NativeHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("value", &self.value)
            .field("disposition", &self.disposition)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_invalid() {
        let h = NativeHandle::default();
        assert!(!h.is_valid());
        assert!(h.disposition.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn fd_round_trip() {
        let h = NativeHandle::from_fd(3, Disposition::READABLE | Disposition::SEEKABLE);
        assert!(h.is_valid());
        assert_eq!(h.fd(), 3);
        assert!(h.is_readable());
        assert!(!h.is_writable());
        assert!(h.is_seekable());
    }

    #[test]
    fn take_invalidates() {
        #[cfg(unix)]
        let mut h = NativeHandle::from_fd(5, Disposition::WRITABLE);
        #[cfg(not(unix))]
        let mut h = NativeHandle::INVALID;
        let taken = h.take();
        assert!(!h.is_valid());
        #[cfg(unix)]
        assert_eq!(taken.fd(), 5);
        #[cfg(not(unix))]
        let _ = taken;
    }
}
