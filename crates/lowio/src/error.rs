// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error as ThisError;

use crate::log;

/// The portable error conditions used by this library.
///
/// These mirror the POSIX `errc` set. Programmer errors and feature gaps are
/// reported through these; persistent operating system errors are carried
/// verbatim as [`ErrorCode::Posix`] / [`ErrorCode::Win32`] /
/// [`ErrorCode::NtKernel`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[non_exhaustive]
pub enum Errc {
    #[display("invalid argument")]
    InvalidArgument,
    #[display("argument out of domain")]
    ArgumentOutOfDomain,
    #[display("argument list too long")]
    ArgumentListTooLong,
    #[display("result out of range")]
    ResultOutOfRange,
    #[display("value too large")]
    ValueTooLarge,
    #[display("not enough memory")]
    NotEnoughMemory,
    #[display("resource unavailable, try again")]
    ResourceUnavailableTryAgain,
    #[display("timed out")]
    TimedOut,
    #[display("operation canceled")]
    OperationCanceled,
    #[display("not supported")]
    NotSupported,
    #[display("no such file or directory")]
    NoSuchFileOrDirectory,
    #[display("no such device or address")]
    NoSuchDeviceOrAddress,
    #[display("file exists")]
    FileExists,
    #[display("operation not supported")]
    OperationNotSupported,
    #[display("permission denied")]
    PermissionDenied,
    #[display("directory not empty")]
    DirectoryNotEmpty,
    #[display("broken pipe")]
    BrokenPipe,
    #[display("unknown error")]
    Unknown,
}

impl Errc {
    /// The closest POSIX errno value.
    #[cfg(unix)]
    #[must_use]
    pub const fn to_errno(self) -> i32 {
        match self {
            Self::InvalidArgument => libc::EINVAL,
            Self::ArgumentOutOfDomain => libc::EDOM,
            Self::ArgumentListTooLong => libc::E2BIG,
            Self::ResultOutOfRange => libc::ERANGE,
            Self::ValueTooLarge => libc::EOVERFLOW,
            Self::NotEnoughMemory => libc::ENOMEM,
            Self::ResourceUnavailableTryAgain => libc::EAGAIN,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::OperationCanceled => libc::ECANCELED,
            Self::NotSupported | Self::OperationNotSupported => libc::EOPNOTSUPP,
            Self::NoSuchFileOrDirectory => libc::ENOENT,
            Self::NoSuchDeviceOrAddress => libc::ENXIO,
            Self::FileExists => libc::EEXIST,
            Self::PermissionDenied => libc::EACCES,
            Self::DirectoryNotEmpty => libc::ENOTEMPTY,
            Self::BrokenPipe => libc::EPIPE,
            Self::Unknown => libc::EIO,
        }
    }

    /// Maps a POSIX errno value onto the portable condition set, if one of
    /// the conditions matches it.
    #[cfg(unix)]
    #[must_use]
    pub const fn from_errno(errno: i32) -> Option<Self> {
        // EAGAIN and EWOULDBLOCK share a value on Linux but not everywhere.
        #[allow(unreachable_patterns)]
        match errno {
            libc::EINVAL => Some(Self::InvalidArgument),
            libc::EDOM => Some(Self::ArgumentOutOfDomain),
            libc::E2BIG => Some(Self::ArgumentListTooLong),
            libc::ERANGE => Some(Self::ResultOutOfRange),
            libc::EOVERFLOW => Some(Self::ValueTooLarge),
            libc::ENOMEM => Some(Self::NotEnoughMemory),
            libc::EAGAIN | libc::EWOULDBLOCK => Some(Self::ResourceUnavailableTryAgain),
            libc::ETIMEDOUT => Some(Self::TimedOut),
            libc::ECANCELED => Some(Self::OperationCanceled),
            libc::EOPNOTSUPP | libc::ENOTSUP => Some(Self::OperationNotSupported),
            libc::ENOENT => Some(Self::NoSuchFileOrDirectory),
            libc::ENXIO => Some(Self::NoSuchDeviceOrAddress),
            libc::EEXIST => Some(Self::FileExists),
            libc::EACCES | libc::EPERM => Some(Self::PermissionDenied),
            libc::ENOTEMPTY => Some(Self::DirectoryNotEmpty),
            libc::EPIPE => Some(Self::BrokenPipe),
            _ => None,
        }
    }
}

/// The categorized code inside an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
#[non_exhaustive]
pub enum ErrorCode {
    /// A portable error condition, used for programmer errors and feature
    /// gaps that did not originate in a kernel call.
    #[error("{0}")]
    Generic(Errc),

    /// A POSIX errno, carried verbatim.
    #[error("posix error {0}")]
    Posix(i32),

    /// A Win32 error code (`GetLastError`), carried verbatim.
    #[error("win32 error {0}")]
    Win32(u32),

    /// An NTSTATUS from a direct NT kernel call, carried verbatim.
    #[error("ntkernel error {0:#x}")]
    NtKernel(i32),
}

impl ErrorCode {
    /// The portable condition this code maps to, if any.
    #[must_use]
    pub fn errc(&self) -> Option<Errc> {
        match *self {
            Self::Generic(errc) => Some(errc),
            #[cfg(unix)]
            Self::Posix(errno) => Errc::from_errno(errno),
            #[cfg(not(unix))]
            Self::Posix(_) => None,
            Self::Win32(code) => match code {
                2 | 3 => Some(Errc::NoSuchFileOrDirectory), // FILE/PATH_NOT_FOUND
                5 => Some(Errc::PermissionDenied),          // ACCESS_DENIED
                8 => Some(Errc::NotEnoughMemory),           // NOT_ENOUGH_MEMORY
                80 | 183 => Some(Errc::FileExists),         // FILE_EXISTS / ALREADY_EXISTS
                87 => Some(Errc::InvalidArgument),          // INVALID_PARAMETER
                995 => Some(Errc::OperationCanceled),       // OPERATION_ABORTED
                1235 => Some(Errc::OperationCanceled),      // REQUEST_ABORTED
                1460 => Some(Errc::TimedOut),               // TIMEOUT
                50 => Some(Errc::NotSupported),             // NOT_SUPPORTED
                _ => None,
            },
            Self::NtKernel(_) => None,
        }
    }
}

/// The error carrier returned by every fallible operation in this library.
///
/// An `Error` is a categorized code plus up to two path annotations, the id
/// of the thread that raised it, and the index of the log-ring record written
/// when it was raised. It is cheap to move, `Send + Sync`, and converts to
/// and from [`std::io::Error`].
#[derive(Debug, Clone, ThisError)]
#[error("{code}{}", render_annotations(.path1, .path2, .thread_id))]
pub struct Error {
    code: ErrorCode,
    path1: Option<PathBuf>,
    path2: Option<PathBuf>,
    thread_id: u64,
    log_index: Option<u64>,
}

impl Error {
    fn new(code: ErrorCode) -> Self {
        let thread_id = log::current_thread_id();
        let log_index = log::record(format_args!("{code}"));
        Self {
            code,
            path1: None,
            path2: None,
            thread_id,
            log_index,
        }
    }

    /// An error from the portable condition set.
    #[must_use]
    pub fn generic(errc: Errc) -> Self {
        Self::new(ErrorCode::Generic(errc))
    }

    /// An error carrying a POSIX errno verbatim.
    #[must_use]
    pub fn posix(errno: i32) -> Self {
        Self::new(ErrorCode::Posix(errno))
    }

    /// An error carrying a Win32 error code verbatim.
    #[must_use]
    pub fn win32(code: u32) -> Self {
        Self::new(ErrorCode::Win32(code))
    }

    /// An error carrying an NTSTATUS verbatim.
    #[must_use]
    pub fn ntkernel(status: i32) -> Self {
        Self::new(ErrorCode::NtKernel(status))
    }

    /// The error for the calling thread's most recent failed system call.
    #[must_use]
    pub fn last_os_error() -> Self {
        #[cfg(unix)]
        {
            Self::posix(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        }
        #[cfg(windows)]
        {
            let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            #[expect(clippy::cast_sign_loss, reason = "GetLastError codes are unsigned")]
            let code = code as u32;
            Self::win32(code)
        }
    }

    /// Translates a panic payload from a user completion callback.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("completion panicked");
        tracing::event!(tracing::Level::ERROR, payload = message, "user completion panicked");
        Self::generic(Errc::Unknown)
    }

    /// Attaches a path annotation. The first two calls fill the two slots;
    /// further calls are ignored.
    #[must_use]
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        if self.path1.is_none() {
            self.path1 = Some(path);
        } else if self.path2.is_none() {
            self.path2 = Some(path);
        }
        self
    }

    /// The categorized code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// The portable condition this error maps to, if any.
    #[must_use]
    pub fn errc(&self) -> Option<Errc> {
        self.code.errc()
    }

    /// The first path annotation.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path1.as_deref()
    }

    /// The second path annotation.
    #[must_use]
    pub fn second_path(&self) -> Option<&Path> {
        self.path2.as_deref()
    }

    /// The id of the thread on which this error was raised.
    #[must_use]
    pub const fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// The log-ring index recorded when this error was raised, if the ring
    /// was enabled.
    #[must_use]
    pub const fn log_index(&self) -> Option<u64> {
        self.log_index
    }

    /// Whether this error is the deadline-expiry condition.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.errc() == Some(Errc::TimedOut)
    }

    /// Whether this error is the cancellation condition.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.errc() == Some(Errc::OperationCanceled)
    }
}

fn render_annotations(
    path1: &Option<PathBuf>,
    path2: &Option<PathBuf>,
    thread_id: &u64,
) -> String {
    let mut out = String::new();
    if let Some(p) = path1 {
        let _ = write!(out, " [path: {}]", p.display());
    }
    if let Some(p) = path2 {
        let _ = write!(out, " [path: {}]", p.display());
    }
    let _ = write!(out, " [tid: {thread_id}]");
    out
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        match error.raw_os_error() {
            #[cfg(unix)]
            Some(errno) => Self::posix(errno),
            #[cfg(windows)]
            #[expect(clippy::cast_sign_loss, reason = "GetLastError codes are unsigned")]
            Some(code) => Self::win32(code as u32),
            _ => {
                use std::io::ErrorKind;
                let errc = match error.kind() {
                    ErrorKind::NotFound => Errc::NoSuchFileOrDirectory,
                    ErrorKind::PermissionDenied => Errc::PermissionDenied,
                    ErrorKind::AlreadyExists => Errc::FileExists,
                    ErrorKind::WouldBlock => Errc::ResourceUnavailableTryAgain,
                    ErrorKind::InvalidInput => Errc::InvalidArgument,
                    ErrorKind::TimedOut => Errc::TimedOut,
                    ErrorKind::Unsupported => Errc::NotSupported,
                    ErrorKind::OutOfMemory => Errc::NotEnoughMemory,
                    ErrorKind::BrokenPipe => Errc::BrokenPipe,
                    _ => Errc::Unknown,
                };
                Self::generic(errc)
            }
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(error: Error) -> Self {
        match error.code {
            #[cfg(unix)]
            ErrorCode::Posix(errno) => Self::from_raw_os_error(errno),
            #[cfg(windows)]
            #[expect(clippy::cast_possible_wrap, reason = "round-trip of GetLastError")]
            ErrorCode::Win32(code) => Self::from_raw_os_error(code as i32),
            _ => Self::other(error),
        }
    }
}

/// A specialized `Result` for this library's operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync);

    #[cfg(unix)]
    #[test]
    fn errc_round_trips_through_errno() {
        for errc in [
            Errc::InvalidArgument,
            Errc::TimedOut,
            Errc::OperationCanceled,
            Errc::NoSuchFileOrDirectory,
            Errc::NoSuchDeviceOrAddress,
            Errc::FileExists,
            Errc::NotEnoughMemory,
            Errc::ResourceUnavailableTryAgain,
        ] {
            let errno = errc.to_errno();
            assert_eq!(Errc::from_errno(errno), Some(errc), "{errc:?} via {errno}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn posix_error_maps_to_condition() {
        let e = Error::posix(libc::ETIMEDOUT);
        assert!(e.is_timed_out());
        assert!(!e.is_canceled());
        assert_eq!(e.errc(), Some(Errc::TimedOut));
    }

    #[test]
    fn path_annotations_fill_two_slots() {
        let e = Error::generic(Errc::NoSuchFileOrDirectory)
            .with_path("/a")
            .with_path("/b")
            .with_path("/ignored");
        assert_eq!(e.path(), Some(Path::new("/a")));
        assert_eq!(e.second_path(), Some(Path::new("/b")));
        let rendered = e.to_string();
        assert!(rendered.contains("/a") && rendered.contains("/b"), "{rendered}");
    }

    #[cfg(unix)]
    #[test]
    fn io_error_round_trip_preserves_os_code() {
        let io = std::io::Error::from_raw_os_error(libc::ENOENT);
        let e = Error::from(io);
        assert_eq!(e.errc(), Some(Errc::NoSuchFileOrDirectory));
        let back: std::io::Error = e.into();
        assert_eq!(back.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn errors_carry_the_raising_thread() {
        let here = Error::generic(Errc::InvalidArgument).thread_id();
        let there = std::thread::spawn(|| Error::generic(Errc::InvalidArgument).thread_id())
            .join()
            .expect("thread");
        assert_ne!(here, there);
    }
}
