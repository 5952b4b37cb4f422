// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The BSD/macOS kqueue backend. Same shape as the epoll backend: a
//! readiness port with a self-wake channel (`EVFILT_USER`).

use std::os::unix::io::RawFd;
use std::time::Duration;

use super::KernelEvent;
use crate::{Error, Result};

const WAKE_IDENT: usize = usize::MAX;

#[derive(Debug)]
pub(super) struct Kqueue {
    kq: RawFd,
}

impl Kqueue {
    pub(super) fn new() -> Result<Self> {
        // SAFETY: plain resource creation.
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            return Err(Error::last_os_error());
        }
        // Register the user-event wake channel.
        let event = libc::kevent {
            ident: WAKE_IDENT,
            filter: libc::EVFILT_USER,
            flags: libc::EV_ADD | libc::EV_CLEAR,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        // SAFETY: one changelist entry, no eventlist.
        if unsafe { libc::kevent(kq, &event, 1, std::ptr::null_mut(), 0, std::ptr::null()) } == -1 {
            let error = Error::last_os_error();
            // SAFETY: unwinding the queue we just created.
            unsafe { libc::close(kq) };
            return Err(error);
        }
        Ok(Self { kq })
    }

    pub(super) fn register(&self, _fd: RawFd) -> Result<()> {
        // Filters are added lazily by set_interest.
        Ok(())
    }

    pub(super) fn deregister(&self, fd: RawFd) {
        self.set_interest(fd, false, false);
    }

    pub(super) fn set_interest(&self, fd: RawFd, read: bool, write: bool) {
        let mut changes = Vec::with_capacity(2);
        for (filter, wanted) in [(libc::EVFILT_READ, read), (libc::EVFILT_WRITE, write)] {
            changes.push(libc::kevent {
                ident: fd as usize,
                filter,
                flags: if wanted { libc::EV_ADD | libc::EV_CLEAR } else { libc::EV_DELETE },
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            });
        }
        // SAFETY: changelist entries only; EV_DELETE of an absent filter
        // fails harmlessly with ENOENT.
        let _ = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
    }

    pub(super) fn wake(&self) {
        let event = libc::kevent {
            ident: WAKE_IDENT,
            filter: libc::EVFILT_USER,
            flags: 0,
            fflags: libc::NOTE_TRIGGER,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        // SAFETY: triggering the user event registered in new().
        let _ = unsafe { libc::kevent(self.kq, &event, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
    }

    pub(super) fn wait(&self, timeout: Duration) -> Result<Vec<KernelEvent>> {
        let timespec = libc::timespec {
            tv_sec: timeout.as_secs().min(i64::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(timeout.subsec_nanos() as i32),
        };
        // SAFETY: kevent is plain old data; zeroed is a valid value.
        let mut events: [libc::kevent; 64] = unsafe { std::mem::zeroed() };
        loop {
            // SAFETY: out-param array on the stack.
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    std::ptr::null(),
                    0,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    &timespec,
                )
            };
            if n == -1 {
                match std::io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) => continue,
                    _ => return Err(Error::last_os_error()),
                }
            }
            let mut out = Vec::with_capacity(n as usize);
            for ev in &events[..n as usize] {
                if ev.filter == libc::EVFILT_USER {
                    out.push(KernelEvent::Wake);
                    continue;
                }
                out.push(KernelEvent::Ready {
                    fd: ev.ident as RawFd,
                    readable: ev.filter == libc::EVFILT_READ,
                    writable: ev.filter == libc::EVFILT_WRITE,
                });
            }
            return Ok(out);
        }
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        // SAFETY: closing the queue this struct created.
        unsafe {
            libc::close(self.kq);
        }
    }
}
