// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Linux io_uring backend.
//!
//! Seekable handles submit their read/write directly; completions are
//! reaped in [`wait`](Uring::wait). Non-seekable handles are opened
//! non-blocking (the multiplexable contract), and io_uring honors
//! `O_NONBLOCK` by completing with `-EAGAIN` instead of waiting — so those
//! go through a two-phase cycle: an `IORING_OP_POLL_ADD` first, then the
//! transfer once the descriptor is ready, re-arming the poll on a spurious
//! wakeup.
//!
//! Cancellation goes through `IORING_OP_ASYNC_CANCEL` against whichever SQE
//! is outstanding; the cancelled operation's own CQE (usually `-ECANCELED`)
//! is consumed by the caller's suppressed-notification path. A persistent
//! read of an eventfd serves as the wake channel.
//!
//! Single-threaded by design:
//! [`best_available`](super::Multiplexer::best_available) only selects
//! io_uring for one-thread multiplexers.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

use io_uring::{opcode, types, IoUring};
use tracing::{event, Level};

use super::{KernelEvent, OpKind, Operation};
use crate::{Error, Result};

/// `user_data` of the persistent eventfd read.
const WAKE_DATA: u64 = u64::MAX;
/// `user_data` of async-cancel requests; their CQEs carry no payload.
const CANCEL_DATA: u64 = u64::MAX - 1;

// Sized so a large scheduled batch (and its completion queue, twice this)
// fits without tripping completion-overflow backpressure.
const RING_ENTRIES: u32 = 1024;

pub(super) struct Uring {
    inner: Mutex<Inner>,
    /// Written (8 bytes) from any thread to wake a blocked wait; read
    /// through a persistent SQE.
    wake_fd: RawFd,
}

/// What the ring knows about one in-flight operation.
struct InFlight {
    fd: RawFd,
    kind: OpKind,
    /// Stable pointer into the arena-pinned operation buffer.
    ptr: *mut u8,
    len: u32,
    /// Offset, or the "current position" sentinel for non-seekable fds.
    offset: u64,
    phase: Phase,
}

// SAFETY: the pointer targets the operation arena, which outlives the ring
// record; the ring is driven behind a mutex.
unsafe impl Send for InFlight {}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// A POLL_ADD is outstanding; the transfer has not been issued yet.
    AwaitingReadiness,
    /// The transfer SQE is outstanding.
    Submitted,
}

struct Inner {
    ring: IoUring,
    inflight: HashMap<u64, InFlight>,
    wake_armed: bool,
    /// Stable destination for the persistent eventfd read.
    wake_buf: Box<[u8; 8]>,
}

impl Uring {
    pub(super) fn new() -> Result<Self> {
        let ring = IoUring::new(RING_ENTRIES).map_err(Error::from)?;
        // Deliberately blocking: the ring waits on it internally and
        // nothing else ever reads it.
        // SAFETY: plain resource creation.
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if wake_fd == -1 {
            return Err(Error::last_os_error());
        }
        event!(Level::TRACE, wake_fd, "created io_uring multiplexer");
        Ok(Self {
            inner: Mutex::new(Inner {
                ring,
                inflight: HashMap::new(),
                wake_armed: false,
                wake_buf: Box::new([0u8; 8]),
            }),
            wake_fd,
        })
    }

    pub(super) fn submit(&self, id: u64, op: &mut Operation) -> Result<()> {
        let mut inner = self.lock();
        let record = InFlight {
            fd: op.fd,
            kind: op.kind,
            ptr: op.buffer.kernel_ptr(),
            len: op.buffer.len() as u32,
            offset: if op.seekable { op.offset } else { !0u64 },
            phase: Phase::Submitted,
        };
        if op.seekable {
            inner.push_transfer(id, &record)?;
            inner.inflight.insert(id, record);
        } else {
            // Non-blocking descriptor: poll first, transfer on readiness.
            let mut record = record;
            record.phase = Phase::AwaitingReadiness;
            inner.push_poll(id, &record)?;
            inner.inflight.insert(id, record);
        }
        event!(Level::TRACE, id, fd = op.fd, "submitted to ring");
        Ok(())
    }

    /// Requests cancellation of `id`. Returns whether a CQE for the
    /// operation is still outstanding (so the caller must keep it pinned).
    pub(super) fn cancel(&self, id: u64) -> bool {
        let mut inner = self.lock();
        if !inner.inflight.contains_key(&id) {
            return false;
        }
        let entry = opcode::AsyncCancel::new(id).build().user_data(CANCEL_DATA);
        // If the cancel cannot be queued the operation completes normally
        // and is suppressed; either way a CQE is coming.
        let _ = inner.push(&entry);
        true
    }

    pub(super) fn wait(&self, timeout: Duration) -> Result<Vec<KernelEvent>> {
        let mut inner = self.lock();
        inner.arm_wake(self.wake_fd)?;

        let timespec = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&timespec);
        match inner.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ETIME | libc::EINTR | libc::EBUSY)
                ) => {}
            Err(e) => return Err(Error::from(e)),
        }

        let completed: Vec<(u64, i32)> = inner
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        let mut out = Vec::new();
        for (user_data, raw) in completed {
            match user_data {
                WAKE_DATA => {
                    inner.wake_armed = false;
                    inner.arm_wake(self.wake_fd)?;
                    out.push(KernelEvent::Wake);
                }
                CANCEL_DATA => {}
                id => {
                    if let Some(event) = inner.operation_cqe(id, raw) {
                        out.push(event);
                    }
                }
            }
        }
        Ok(out)
    }

    pub(super) fn wake(&self) {
        let one: u64 = 1;
        // SAFETY: 8-byte write is the eventfd contract. No ring lock is
        // needed, which is the whole point: this must work while another
        // thread is blocked in submit_with_args.
        let _ = unsafe {
            libc::write(self.wake_fd, std::ptr::from_ref(&one).cast(), std::mem::size_of::<u64>())
        };
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Inner {
    /// Advances the state machine for an operation CQE. Returns the event
    /// to surface, if this CQE finishes the operation.
    fn operation_cqe(&mut self, id: u64, raw: i32) -> Option<KernelEvent> {
        let (phase, offset) = {
            let record = self.inflight.get(&id)?;
            (record.phase, record.offset)
        };
        match phase {
            Phase::AwaitingReadiness => {
                if raw < 0 {
                    // The poll itself failed (or was cancelled).
                    self.inflight.remove(&id);
                    return Some(KernelEvent::Finished {
                        id,
                        result: Err(Error::posix(-raw)),
                    });
                }
                // Ready: issue the transfer.
                let mut record = self.inflight.remove(&id).expect("present above");
                record.phase = Phase::Submitted;
                if let Err(error) = self.push_transfer(id, &record) {
                    return Some(KernelEvent::Finished { id, result: Err(error) });
                }
                self.inflight.insert(id, record);
                None
            }
            Phase::Submitted => {
                if raw == -libc::EAGAIN && offset == !0u64 {
                    // Lost the race with another consumer; poll again.
                    let mut record = self.inflight.remove(&id).expect("present above");
                    record.phase = Phase::AwaitingReadiness;
                    if let Err(error) = self.push_poll(id, &record) {
                        return Some(KernelEvent::Finished { id, result: Err(error) });
                    }
                    self.inflight.insert(id, record);
                    return None;
                }
                self.inflight.remove(&id);
                let result = if raw < 0 {
                    Err(Error::posix(-raw))
                } else {
                    Ok(raw as usize)
                };
                Some(KernelEvent::Finished { id, result })
            }
        }
    }

    fn push_transfer(&mut self, id: u64, record: &InFlight) -> Result<()> {
        let entry = match record.kind {
            OpKind::Read => opcode::Read::new(types::Fd(record.fd), record.ptr, record.len)
                .offset(record.offset)
                .build()
                .user_data(id),
            OpKind::Write => {
                opcode::Write::new(types::Fd(record.fd), record.ptr.cast_const(), record.len)
                    .offset(record.offset)
                    .build()
                    .user_data(id)
            }
        };
        self.push(&entry)
    }

    fn push_poll(&mut self, id: u64, record: &InFlight) -> Result<()> {
        let interest = match record.kind {
            OpKind::Read => libc::POLLIN,
            OpKind::Write => libc::POLLOUT,
        };
        let entry = opcode::PollAdd::new(types::Fd(record.fd), interest as u32)
            .build()
            .user_data(id);
        self.push(&entry)
    }

    /// Queues one SQE, flushing the ring if it is full.
    fn push(&mut self, entry: &io_uring::squeue::Entry) -> Result<()> {
        loop {
            // SAFETY: the buffers behind this entry are pinned in the
            // operation arena until the matching CQE is consumed.
            let pushed = unsafe { self.ring.submission().push(entry) };
            match pushed {
                Ok(()) => {
                    self.ring.submit().map_err(Error::from)?;
                    return Ok(());
                }
                Err(_full) => {
                    self.ring.submit().map_err(Error::from)?;
                }
            }
        }
    }

    /// Keeps exactly one eventfd read outstanding.
    fn arm_wake(&mut self, wake_fd: RawFd) -> Result<()> {
        if self.wake_armed {
            return Ok(());
        }
        let entry = opcode::Read::new(
            types::Fd(wake_fd),
            self.wake_buf.as_mut_ptr(),
            self.wake_buf.len() as u32,
        )
        .build()
        .user_data(WAKE_DATA);
        self.push(&entry)?;
        self.wake_armed = true;
        Ok(())
    }
}

impl Drop for Uring {
    fn drop(&mut self) {
        // SAFETY: closing the eventfd this struct created. The ring closes
        // itself.
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}
