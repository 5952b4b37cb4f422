// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Named and anonymous pipes.
//!
//! Named pipes live in the platform's pipe namespace: the filing system
//! (FIFOs) on POSIX, `\\.\pipe\` on Windows. Anonymous pipes come as a
//! connected `(read, write)` pair.
//!
//! Connection semantics follow the platform: opening the readable end of a
//! blocking named pipe blocks until a writer connects; opening it
//! non-blocking (the [`HandleFlags::OVERLAPPED`] flag) succeeds immediately
//! and reads drive the connect. Opening the writable end non-blocking with
//! no reader connected fails with
//! [`Errc::NoSuchDeviceOrAddress`](crate::Errc::NoSuchDeviceOrAddress),
//! matching Linux.

use pathview::PathView;
use tracing::{event, Level};

use crate::fs_handle::FsHandle;
use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
use crate::io_handle::{AsHandle, IoHandle};
use crate::path_handle::PathHandle;
use crate::Result;

/// A handle to one end of a pipe.
#[derive(Debug)]
pub struct PipeHandle {
    handle: Handle,
}

impl PipeHandle {
    /// Opens or creates the named pipe at `path` relative to `base`.
    ///
    /// `mode` selects the end: [`Mode::Read`] for the reading end,
    /// [`Mode::Write`] or [`Mode::Append`] for the writing end.
    pub fn pipe(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        let handle = os::open_pipe(base, path, mode, creation, caching, flags)?;
        event!(Level::TRACE, path = %path, %mode, "opened named pipe");
        Ok(Self { handle })
    }

    /// Creates the named pipe if needed and opens its reading end.
    pub fn pipe_create(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        Self::pipe(base, path, Mode::Read, Creation::IfNeeded, caching, flags)
    }

    /// Opens the writing end of an existing named pipe.
    pub fn pipe_open(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        Self::pipe(base, path, Mode::Write, Creation::OpenExisting, caching, flags)
    }

    /// Creates a connected anonymous pipe pair, returned as
    /// `(read, write)`.
    pub fn anonymous_pipe(caching: Caching, flags: HandleFlags) -> Result<(Self, Self)> {
        let (read, write) = os::anonymous_pipe(caching, flags)?;
        Ok((Self { handle: read }, Self { handle: write }))
    }
}

impl AsHandle for PipeHandle {
    fn as_handle(&self) -> &Handle {
        &self.handle
    }
}

impl IoHandle for PipeHandle {}

impl FsHandle for PipeHandle {}

#[cfg(unix)]
mod os {
    use pathview::PathView;

    use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
    use crate::native_handle::{Disposition, NativeHandle};
    use crate::path_handle::PathHandle;
    use crate::utils::to_cstring;
    use crate::{Errc, Error, Result};

    fn disposition_of(mode: Mode, flags: HandleFlags) -> Disposition {
        let mut disposition = Disposition::PIPE;
        match mode {
            Mode::Read => disposition |= Disposition::READABLE,
            Mode::Write | Mode::Append => disposition |= Disposition::WRITABLE,
            _ => {}
        }
        if flags.contains(HandleFlags::OVERLAPPED) {
            disposition |= Disposition::OVERLAPPED;
        }
        disposition
    }

    pub(super) fn open_pipe(
        base: Option<&PathHandle>,
        path: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Handle> {
        let c_path = to_cstring(path.as_path())?;
        let base_fd = PathHandle::base_fd(base);

        if matches!(
            creation,
            Creation::OnlyIfNotExist | Creation::IfNeeded | Creation::AlwaysNew
        ) {
            // SAFETY: NUL-terminated path.
            let rc = unsafe { libc::mkfifoat(base_fd, c_path.as_ptr(), 0o660) };
            if rc == -1 {
                let error = Error::last_os_error().with_path(path.as_path());
                let exists = error.errc() == Some(Errc::FileExists);
                if !(exists && creation != Creation::OnlyIfNotExist) {
                    return Err(error);
                }
            }
        }

        let mut oflags = match mode {
            Mode::Read => libc::O_RDONLY,
            Mode::Write | Mode::Append => libc::O_WRONLY,
            _ => return Err(Error::generic(Errc::InvalidArgument)),
        } | libc::O_CLOEXEC;
        if flags.contains(HandleFlags::OVERLAPPED) {
            // Non-blocking: readable opens succeed with no writer; writable
            // opens report ENXIO with no reader.
            oflags |= libc::O_NONBLOCK;
        }

        // SAFETY: NUL-terminated path. A blocking readable open sleeps here
        // until a writer connects.
        let fd = unsafe { libc::openat(base_fd, c_path.as_ptr(), oflags) };
        if fd == -1 {
            return Err(Error::last_os_error().with_path(path.as_path()));
        }
        Ok(Handle::from_native(
            NativeHandle::from_fd(fd, disposition_of(mode, flags)),
            caching,
            flags,
        ))
    }

    pub(super) fn anonymous_pipe(caching: Caching, flags: HandleFlags) -> Result<(Handle, Handle)> {
        let mut fds = [0 as libc::c_int; 2];
        let mut pipe_flags = libc::O_CLOEXEC;
        if flags.contains(HandleFlags::OVERLAPPED) {
            pipe_flags |= libc::O_NONBLOCK;
        }
        // SAFETY: out-param array on the stack.
        #[cfg(target_os = "linux")]
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), pipe_flags) };
        #[cfg(not(target_os = "linux"))]
        let rc = {
            let _ = pipe_flags;
            // SAFETY: out-param array on the stack.
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            if rc == 0 && flags.contains(HandleFlags::OVERLAPPED) {
                for fd in fds {
                    // SAFETY: setting flags on descriptors we just created.
                    unsafe {
                        let current = libc::fcntl(fd, libc::F_GETFL);
                        let _ = libc::fcntl(fd, libc::F_SETFL, current | libc::O_NONBLOCK);
                    }
                }
            }
            rc
        };
        if rc == -1 {
            return Err(Error::last_os_error());
        }
        Ok((
            Handle::from_native(
                NativeHandle::from_fd(fds[0], disposition_of(Mode::Read, flags)),
                caching,
                flags,
            ),
            Handle::from_native(
                NativeHandle::from_fd(fds[1], disposition_of(Mode::Write, flags)),
                caching,
                flags,
            ),
        ))
    }
}

#[cfg(windows)]
mod os {
    use pathview::PathView;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::GENERIC_WRITE;
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, FILE_FLAG_OVERLAPPED, FILE_SHARE_NONE, OPEN_EXISTING,
        PIPE_ACCESS_INBOUND,
    };
    use windows::Win32::System::Pipes::{
        CreateNamedPipeW, CreatePipe, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
    };

    use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
    use crate::native_handle::{Disposition, NativeHandle};
    use crate::path_handle::PathHandle;
    use crate::{Errc, Error, Result};

    fn namespaced(path: PathView<'_>) -> Vec<u16> {
        use std::os::windows::ffi::OsStrExt;
        let mut wide: Vec<u16> = std::path::Path::new(r"\\.\pipe\")
            .as_os_str()
            .encode_wide()
            .chain(path.as_path().as_os_str().encode_wide())
            .collect();
        wide.push(0);
        wide
    }

    fn disposition_of(mode: Mode, flags: HandleFlags) -> Disposition {
        let mut disposition = Disposition::PIPE;
        match mode {
            Mode::Read => disposition |= Disposition::READABLE,
            Mode::Write | Mode::Append => disposition |= Disposition::WRITABLE,
            _ => {}
        }
        if flags.contains(HandleFlags::OVERLAPPED) {
            disposition |= Disposition::OVERLAPPED;
        }
        disposition
    }

    pub(super) fn open_pipe(
        _base: Option<&PathHandle>,
        path: PathView<'_>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Handle> {
        let wide = namespaced(path);
        let overlapped = if flags.contains(HandleFlags::OVERLAPPED) {
            FILE_FLAG_OVERLAPPED
        } else {
            Default::default()
        };

        let handle = if mode == Mode::Read && creation != Creation::OpenExisting {
            // SAFETY: NUL-terminated wide name.
            let created = unsafe {
                CreateNamedPipeW(
                    PCWSTR(wide.as_ptr()),
                    PIPE_ACCESS_INBOUND | windows::Win32::Storage::FileSystem::FILE_FLAGS_AND_ATTRIBUTES(overlapped.0),
                    PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                    1,
                    65536,
                    65536,
                    0,
                    None,
                )
            };
            if created.is_invalid() {
                return Err(Error::last_os_error().with_path(path.as_path()));
            }
            created
        } else {
            // SAFETY: NUL-terminated wide name.
            unsafe {
                CreateFileW(
                    PCWSTR(wide.as_ptr()),
                    GENERIC_WRITE.0,
                    FILE_SHARE_NONE,
                    None,
                    OPEN_EXISTING,
                    overlapped,
                    None,
                )
            }
            .map_err(|_| {
                let error = Error::last_os_error().with_path(path.as_path());
                // No listening server is the Windows spelling of ENXIO.
                if error.code() == crate::ErrorCode::Win32(2) {
                    Error::generic(Errc::NoSuchDeviceOrAddress).with_path(path.as_path())
                } else {
                    error
                }
            })?
        };
        Ok(Handle::from_native(
            NativeHandle::from_raw_handle(handle.0, disposition_of(mode, flags)),
            caching,
            flags,
        ))
    }

    pub(super) fn anonymous_pipe(caching: Caching, flags: HandleFlags) -> Result<(Handle, Handle)> {
        let mut read = windows::Win32::Foundation::HANDLE::default();
        let mut write = windows::Win32::Foundation::HANDLE::default();
        // SAFETY: out-params on the stack.
        unsafe { CreatePipe(&mut read, &mut write, None, 0) }.map_err(|_| Error::last_os_error())?;
        Ok((
            Handle::from_native(
                NativeHandle::from_raw_handle(read.0, disposition_of(Mode::Read, flags)),
                caching,
                flags,
            ),
            Handle::from_native(
                NativeHandle::from_raw_handle(write.0, disposition_of(Mode::Write, flags)),
                caching,
                flags,
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, ConstBuffer, IoRequest};
    use crate::{Deadline, Errc};

    #[test]
    fn anonymous_pair_transfers_bytes() {
        let (read_end, write_end) =
            PipeHandle::anonymous_pipe(Caching::All, HandleFlags::empty()).expect("pipe pair");

        let payload = *b"through the pipe";
        let mut write_buffers = [ConstBuffer::new(&payload)];
        write_end
            .write(IoRequest::new(&mut write_buffers, 0), None)
            .expect("write");

        let mut scratch = [0u8; 64];
        let mut read_buffers = [Buffer::new(&mut scratch)];
        let read = read_end
            .read(IoRequest::new(&mut read_buffers, 0), None)
            .expect("read");
        assert_eq!(read[0].as_slice(), b"through the pipe");
    }

    #[cfg(unix)]
    #[test]
    fn zero_deadline_read_on_empty_pipe_times_out() {
        let (read_end, _write_end) =
            PipeHandle::anonymous_pipe(Caching::All, HandleFlags::OVERLAPPED).expect("pipe pair");

        let mut scratch = [0u8; 8];
        let mut buffers = [Buffer::new(&mut scratch)];
        let began = std::time::Instant::now();
        let error = read_end
            .read(IoRequest::new(&mut buffers, 0), Some(Deadline::POLL))
            .expect_err("nothing to read");
        assert_eq!(error.errc(), Some(crate::Errc::TimedOut));
        assert!(began.elapsed() < std::time::Duration::from_secs(2), "poll does not block");
    }

    #[cfg(unix)]
    #[test]
    fn short_deadline_read_times_out_within_bounds() {
        let (read_end, _write_end) =
            PipeHandle::anonymous_pipe(Caching::All, HandleFlags::OVERLAPPED).expect("pipe pair");

        let mut scratch = [0u8; 8];
        let mut buffers = [Buffer::new(&mut scratch)];
        let began = std::time::Instant::now();
        let error = read_end
            .read(
                IoRequest::new(&mut buffers, 0),
                Some(Deadline::Relative(std::time::Duration::from_millis(50))),
            )
            .expect_err("nothing to read");
        assert!(error.is_timed_out());
        let elapsed = began.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(45), "{elapsed:?}");
        assert!(elapsed < std::time::Duration::from_secs(5), "{elapsed:?}");
    }

    #[cfg(unix)]
    #[test]
    fn nonblocking_writable_end_without_reader_is_enxio() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = PathHandle::path(None, PathView::new(dir.path())).expect("anchor");

        // Create the FIFO without holding a read end open.
        {
            let _creator = PipeHandle::pipe(
                Some(&base),
                PathView::new("fifo"),
                Mode::Read,
                Creation::IfNeeded,
                Caching::All,
                HandleFlags::OVERLAPPED,
            )
            .expect("create fifo");
        }

        let error = PipeHandle::pipe(
            Some(&base),
            PathView::new("fifo"),
            Mode::Write,
            Creation::OpenExisting,
            Caching::All,
            HandleFlags::OVERLAPPED,
        )
        .expect_err("no reader connected");
        assert_eq!(error.errc(), Some(Errc::NoSuchDeviceOrAddress));
    }

    #[cfg(unix)]
    #[test]
    fn named_pipe_round_trips_across_threads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fifo = dir.path().to_path_buf();

        let reader = std::thread::spawn(move || {
            let base = PathHandle::path(None, PathView::new(&fifo)).expect("anchor");
            // Blocking readable open: sleeps until the writer connects.
            let pipe = PipeHandle::pipe_create(
                Some(&base),
                PathView::new("round-trip"),
                Caching::All,
                HandleFlags::empty(),
            )
            .expect("reader end");
            let mut scratch = [0u8; 64];
            let mut buffers = [Buffer::new(&mut scratch)];
            let read = pipe.read(IoRequest::new(&mut buffers, 0), None).expect("read");
            read[0].as_slice().to_vec()
        });

        // Give the reader time to create the FIFO and block in open().
        std::thread::sleep(std::time::Duration::from_millis(100));

        let base = PathHandle::path(None, PathView::new(dir.path())).expect("anchor");
        let writer = loop {
            match PipeHandle::pipe_open(
                Some(&base),
                PathView::new("round-trip"),
                Caching::All,
                HandleFlags::empty(),
            ) {
                Ok(pipe) => break pipe,
                // The reader may not have created the FIFO yet.
                Err(e) if e.errc() == Some(Errc::NoSuchFileOrDirectory) => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => panic!("writer open failed: {e}"),
            }
        };
        let mut buffers = [ConstBuffer::new(b"hello")];
        writer.write(IoRequest::new(&mut buffers, 0), None).expect("write");

        let received = reader.join().expect("reader thread");
        assert_eq!(received, b"hello");
    }
}
