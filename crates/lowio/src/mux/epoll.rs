// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Linux epoll backend: a readiness port plus an eventfd for wakeups.
//!
//! Seekable handles never enter epoll (the kernel rejects regular files);
//! their transfers run at submission. Non-seekable handles are added with no
//! interest and have `EPOLLIN`/`EPOLLOUT` toggled as operations park and
//! drain.

use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::{event, Level};

use super::KernelEvent;
use crate::{Error, Result};

/// Token distinguishing the wake eventfd from registered descriptors
/// (which use their non-negative fd value).
const WAKE_TOKEN: u64 = u64::MAX;

#[derive(Debug)]
pub(super) struct Epoll {
    epoll_fd: RawFd,
    wake_fd: RawFd,
}

impl Epoll {
    pub(super) fn new() -> Result<Self> {
        // SAFETY: plain resource creation.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(Error::last_os_error());
        }
        // SAFETY: as above.
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd == -1 {
            let error = Error::last_os_error();
            // SAFETY: unwinding the epoll descriptor we just created.
            unsafe { libc::close(epoll_fd) };
            return Err(error);
        }
        let mut wake_event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        // SAFETY: registering our own eventfd.
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut wake_event) } == -1 {
            let error = Error::last_os_error();
            // SAFETY: unwinding both descriptors.
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(error);
        }
        event!(Level::TRACE, epoll_fd, wake_fd, "created epoll multiplexer");
        Ok(Self { epoll_fd, wake_fd })
    }

    pub(super) fn register(&self, fd: RawFd) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: 0,
            u64: fd as u64,
        };
        // SAFETY: adding a caller-owned descriptor with no interest yet.
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) } == -1 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn deregister(&self, fd: RawFd) {
        // SAFETY: removing a descriptor we added.
        let _ = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
    }

    pub(super) fn set_interest(&self, fd: RawFd, read: bool, write: bool) {
        let mut events = 0u32;
        if read {
            events |= libc::EPOLLIN as u32;
        }
        if write {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: modifying a descriptor we added.
        let _ = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
    }

    pub(super) fn wake(&self) {
        let one: u64 = 1;
        // SAFETY: 8-byte write is the eventfd contract.
        let _ = unsafe {
            libc::write(self.wake_fd, std::ptr::from_ref(&one).cast(), std::mem::size_of::<u64>())
        };
    }

    pub(super) fn wait(&self, timeout: Duration) -> Result<Vec<KernelEvent>> {
        // SAFETY: epoll_event is plain old data; zeroed is a valid value.
        let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        let timeout_millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        loop {
            // SAFETY: out-param array on the stack.
            let n = unsafe {
                libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout_millis)
            };
            if n == -1 {
                match std::io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) => continue,
                    _ => return Err(Error::last_os_error()),
                }
            }
            let mut out = Vec::with_capacity(n as usize);
            for ev in &events[..n as usize] {
                if ev.u64 == WAKE_TOKEN {
                    self.drain_wake();
                    out.push(KernelEvent::Wake);
                    continue;
                }
                out.push(KernelEvent::Ready {
                    fd: ev.u64 as RawFd,
                    readable: ev.events & (libc::EPOLLIN as u32 | libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0,
                    writable: ev.events & (libc::EPOLLOUT as u32 | libc::EPOLLERR as u32) != 0,
                });
            }
            return Ok(out);
        }
    }

    fn drain_wake(&self) {
        let mut counter: u64 = 0;
        // SAFETY: 8-byte read is the eventfd contract; EAGAIN when drained.
        let _ = unsafe {
            libc::read(self.wake_fd, std::ptr::from_mut(&mut counter).cast(), std::mem::size_of::<u64>())
        };
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // SAFETY: closing descriptors this struct created.
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}
