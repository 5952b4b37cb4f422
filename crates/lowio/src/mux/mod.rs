// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The i/o multiplexer: turns kernel completion notifications into
//! composable completion dispatch.
//!
//! A [`Multiplexer`] owns a kernel notification port (epoll, io_uring,
//! kqueue or an i/o completion port), a FIFO of posted work, an arena of
//! in-flight operation states, and two ordered deadline maps (steady clock
//! and wall clock). Threads drive it by calling [`run`](Multiplexer::run);
//! completions are delivered to a blocking waiter, a user callback, or an
//! awaiter that resumes a suspended task — exactly once each.
//!
//! Operation states are owned by the multiplexer and addressed by [`OpId`],
//! so a receiver disappearing early (a dropped future, say) leaves the
//! kernel i/o and its buffer safely pinned in the arena until the kernel is
//! done with them.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::{Duration, Instant, SystemTime};

use tracing::{event, Level};

use crate::deadline::Deadline;
use crate::handle::Handle;
use crate::io_handle::AsHandle;
use crate::map_handle::RegisteredBuffer;
use crate::{Errc, Error, Result};

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(windows)]
mod iocp;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(target_os = "linux")]
mod uring;

mod future;

pub use future::IoFuture;

/// Identifies an in-flight operation within its multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(u64);

/// The buffer an asynchronous operation owns for its lifetime.
///
/// The multiplexer takes the buffer at submission and hands it back inside
/// the [`Completion`], so the memory is pinned for as long as the kernel
/// may touch it.
#[derive(Debug)]
pub enum OpBuffer {
    /// Plain owned bytes.
    Owned(Vec<u8>),
    /// A page-aligned registered buffer on the zero-copy path.
    Registered(RegisteredBuffer),
}

impl OpBuffer {
    /// The usable length.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Owned(bytes) => bytes.len(),
            Self::Registered(buffer) => buffer.len(),
        }
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Registered(buffer) => buffer.as_slice(),
        }
    }

    /// A stable pointer for the kernel's use. Vec storage and map pages
    /// both stay put when the owning `Operation` moves.
    fn kernel_ptr(&mut self) -> *mut u8 {
        match self {
            Self::Owned(bytes) => bytes.as_mut_ptr(),
            // SAFETY: the multiplexer owns this clone exclusively while the
            // operation is in flight.
            Self::Registered(buffer) => unsafe { buffer.as_mut_slice_unchecked().as_mut_ptr() },
        }
    }
}

impl From<Vec<u8>> for OpBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Owned(bytes)
    }
}

impl From<RegisteredBuffer> for OpBuffer {
    fn from(buffer: RegisteredBuffer) -> Self {
        Self::Registered(buffer)
    }
}

/// What an operation delivered.
#[derive(Debug)]
pub struct Completion {
    /// Bytes transferred, or the failure.
    pub result: Result<usize>,
    /// The buffer the operation owned, returned to the submitter.
    pub buffer: OpBuffer,
}

/// Where a completion goes.
enum Receiver {
    /// A user-supplied completion callable.
    Callback(Box<dyn FnOnce(Completion) + Send>),
    /// An awaiter state; the stored waker resumes the suspended task.
    Awaiter(Arc<future::Shared>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Read,
    Write,
}

/// How a registered handle's operations are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriveMode {
    /// Seekable handles: the syscall cannot meaningfully block on
    /// readiness, so it is performed at submission and the completion is
    /// queued. (Readiness ports reject regular files.)
    Immediate,
    /// Non-seekable, non-blocking handles: readiness events drive retries.
    Readiness,
    /// The kernel accepts the submission itself (io_uring, IOCP).
    Submission,
}

/// The per-i/o record: kernel control state, deadline links, receiver.
struct Operation {
    kind: OpKind,
    fd: RawOsHandle,
    offset: u64,
    /// Whether the handle supports positional i/o; non-seekable handles
    /// ignore the offset.
    seekable: bool,
    buffer: OpBuffer,
    receiver: Option<Receiver>,
    /// Set once the receiver has been invoked (or the op cancelled); a
    /// later kernel notification for this op is observed and discarded.
    finished: bool,
    /// Key in the steady/system deadline map, for removal.
    steady_key: Option<(Instant, u64)>,
    system_key: Option<(SystemTime, u64)>,
}

#[cfg(unix)]
type RawOsHandle = std::os::unix::io::RawFd;
#[cfg(windows)]
type RawOsHandle = isize;

struct Registration {
    mode: DriveMode,
    /// Ops awaiting readability, FIFO.
    read_queue: VecDeque<u64>,
    /// Ops awaiting writability, FIFO.
    write_queue: VecDeque<u64>,
}

type Posted = Box<dyn FnOnce() + Send>;

/// Everything the single multiplexer mutex protects.
struct MuxState {
    posted: VecDeque<Posted>,
    ops: HashMap<u64, Operation>,
    registered: HashMap<RawOsHandle, Registration>,
    /// Completions ready for dispatch.
    ready: VecDeque<(u64, Result<usize>)>,
    steady_deadlines: BTreeMap<(Instant, u64), u64>,
    system_deadlines: BTreeMap<(SystemTime, u64), u64>,
    next_id: u64,
}

impl MuxState {
    fn earliest_wakeup(&self) -> Option<Instant> {
        let steady = self.steady_deadlines.keys().next().map(|(when, _)| *when);
        let system = self.system_deadlines.keys().next().map(|(when, _)| {
            match when.duration_since(SystemTime::now()) {
                Ok(remaining) => Instant::now() + remaining,
                Err(_) => Instant::now(),
            }
        });
        match (steady, system) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    fn unlink_deadlines(&mut self, id: u64) {
        if let Some(op) = self.ops.get_mut(&id) {
            if let Some(key) = op.steady_key.take() {
                self.steady_deadlines.remove(&key);
            }
            if let Some(key) = op.system_key.take() {
                self.system_deadlines.remove(&key);
            }
        }
    }

    /// Collects the ids whose deadline has passed.
    fn expired(&self, now: Instant, wall: SystemTime) -> Vec<u64> {
        let mut out = Vec::new();
        for (&(when, _), &id) in &self.steady_deadlines {
            if when > now {
                break;
            }
            out.push(id);
        }
        for (&(when, _), &id) in &self.system_deadlines {
            if when > wall {
                break;
            }
            out.push(id);
        }
        out
    }
}

enum Backend {
    #[cfg(target_os = "linux")]
    Epoll(epoll::Epoll),
    #[cfg(target_os = "linux")]
    Uring(uring::Uring),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    Kqueue(kqueue::Kqueue),
    #[cfg(windows)]
    Iocp(iocp::Iocp),
    /// Windows single-threaded alertable-wait variant; shares the IOCP
    /// machinery but waits alertably.
    #[cfg(windows)]
    Alertable(iocp::Iocp),
}

/// An event surfaced by a backend wait.
enum KernelEvent {
    /// A wake signal from [`Multiplexer::post`] or a deadline re-sort.
    Wake,
    /// A readiness edge (epoll/kqueue).
    Ready {
        fd: RawOsHandle,
        readable: bool,
        writable: bool,
    },
    /// A kernel-submitted operation finished (io_uring/IOCP).
    Finished { id: u64, result: Result<usize> },
}

struct MuxInner {
    backend: Backend,
    state: Mutex<MuxState>,
    /// Threads currently blocked in a kernel wait; used to decide whether a
    /// state change must wake them.
    waiters: AtomicUsize,
    threads: u32,
}

/// The pluggable completion engine. Cloning shares the same engine.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().ok();
        let mut s = f.debug_struct("Multiplexer");
        s.field("threads", &self.inner.threads);
        if let Some(state) = state {
            s.field("in_flight", &state.ops.len())
                .field("posted", &state.posted.len());
        }
        s.finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Picks the best backend for this platform and thread count: io_uring
    /// for single-threaded Linux, epoll otherwise; kqueue on the BSDs and
    /// macOS; IOCP (multi-thread) or alertable wait (single-thread) on
    /// Windows.
    pub fn best_available(threads: u32) -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            if threads <= 1 {
                if let Ok(mux) = Self::io_uring() {
                    return Ok(mux);
                }
            }
            Self::epoll(threads)
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        {
            Self::kqueue(threads)
        }
        #[cfg(windows)]
        {
            if threads > 1 {
                Self::iocp(threads)
            } else {
                Self::alertable()
            }
        }
    }

    /// A Linux epoll engine.
    #[cfg(target_os = "linux")]
    pub fn epoll(threads: u32) -> Result<Self> {
        Ok(Self::from_backend(Backend::Epoll(epoll::Epoll::new()?), threads))
    }

    /// A Linux io_uring engine (single-threaded use).
    #[cfg(target_os = "linux")]
    pub fn io_uring() -> Result<Self> {
        Ok(Self::from_backend(Backend::Uring(uring::Uring::new()?), 1))
    }

    /// A BSD/macOS kqueue engine.
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    pub fn kqueue(threads: u32) -> Result<Self> {
        Ok(Self::from_backend(Backend::Kqueue(kqueue::Kqueue::new()?), threads))
    }

    /// A Windows i/o completion port engine.
    #[cfg(windows)]
    pub fn iocp(threads: u32) -> Result<Self> {
        Ok(Self::from_backend(Backend::Iocp(iocp::Iocp::new(threads)?), threads))
    }

    /// The Windows single-threaded alertable-wait engine.
    #[cfg(windows)]
    pub fn alertable() -> Result<Self> {
        Ok(Self::from_backend(Backend::Alertable(iocp::Iocp::new(1)?), 1))
    }

    fn from_backend(backend: Backend, threads: u32) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                backend,
                state: Mutex::new(MuxState {
                    posted: VecDeque::new(),
                    ops: HashMap::new(),
                    registered: HashMap::new(),
                    ready: VecDeque::new(),
                    steady_deadlines: BTreeMap::new(),
                    system_deadlines: BTreeMap::new(),
                    next_id: 1,
                }),
                waiters: AtomicUsize::new(0),
                threads,
            }),
        }
    }

    /// Associates `handle`'s descriptor with this multiplexer's kernel
    /// port. A handle may be registered with at most one multiplexer at a
    /// time.
    pub fn register_io_handle(&self, handle: &impl AsHandle) -> Result<()> {
        let h = handle.as_handle();
        if !h.is_valid() {
            return Err(Error::generic(Errc::InvalidArgument));
        }
        let fd = raw_of(h);
        let mode = self.drive_mode_for(h)?;
        let mut state = self.lock();
        if state.registered.contains_key(&fd) {
            return Err(Error::generic(Errc::FileExists));
        }
        if mode == DriveMode::Readiness {
            self.backend_register(fd)?;
        }
        #[cfg(windows)]
        if mode == DriveMode::Submission {
            self.backend_register(fd)?;
        }
        state.registered.insert(
            fd,
            Registration {
                mode,
                read_queue: VecDeque::new(),
                write_queue: VecDeque::new(),
            },
        );
        event!(Level::TRACE, fd = ?fd, ?mode, "registered i/o handle");
        Ok(())
    }

    /// Reverses [`register_io_handle`](Self::register_io_handle). Fails
    /// while any i/o on the handle is in flight.
    pub fn deregister_io_handle(&self, handle: &impl AsHandle) -> Result<()> {
        let fd = raw_of(handle.as_handle());
        let mut state = self.lock();
        if state.ops.values().any(|op| op.fd == fd && !op.finished) {
            return Err(Error::generic(Errc::ResourceUnavailableTryAgain));
        }
        match state.registered.remove(&fd) {
            Some(registration) => {
                if registration.mode == DriveMode::Readiness {
                    self.backend_deregister(fd);
                }
                Ok(())
            }
            None => Err(Error::generic(Errc::InvalidArgument)),
        }
    }

    /// Appends `work` to the posted-work FIFO and wakes one kernel waiter.
    pub fn post(&self, work: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.lock();
            state.posted.push_back(Box::new(work));
        }
        self.wake_waiters();
    }

    /// Drains up to `max` posted items (all of them if `max` is zero),
    /// honoring `deadline`. Remaining items stay at the head of the queue
    /// in order.
    pub fn invoke_posted_items(&self, max: usize, deadline: Option<Deadline>) -> Result<usize> {
        let began = Instant::now();
        let mut invoked = 0;
        loop {
            if max != 0 && invoked >= max {
                break;
            }
            if let Some(d) = deadline {
                if invoked > 0 && d.expired(began) {
                    break;
                }
            }
            let work = { self.lock().posted.pop_front() };
            match work {
                Some(work) => {
                    work();
                    invoked += 1;
                }
                None => break,
            }
        }
        Ok(invoked)
    }

    /// Begins an asynchronous read of up to `buffer.len()` bytes at
    /// `offset`, delivering the completion to `receiver`.
    pub fn read_op(
        &self,
        handle: &impl AsHandle,
        buffer: impl Into<OpBuffer>,
        offset: u64,
        deadline: Option<Deadline>,
        receiver: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<OpId> {
        self.begin(
            handle.as_handle(),
            OpKind::Read,
            buffer.into(),
            offset,
            deadline,
            Receiver::Callback(Box::new(receiver)),
        )
    }

    /// Begins an asynchronous write of `buffer` at `offset`, delivering the
    /// completion to `receiver`.
    pub fn write_op(
        &self,
        handle: &impl AsHandle,
        buffer: impl Into<OpBuffer>,
        offset: u64,
        deadline: Option<Deadline>,
        receiver: impl FnOnce(Completion) + Send + 'static,
    ) -> Result<OpId> {
        self.begin(
            handle.as_handle(),
            OpKind::Write,
            buffer.into(),
            offset,
            deadline,
            Receiver::Callback(Box::new(receiver)),
        )
    }

    /// Begins an asynchronous read whose completion resumes an awaiter.
    pub fn co_read(
        &self,
        handle: &impl AsHandle,
        buffer: impl Into<OpBuffer>,
        offset: u64,
        deadline: Option<Deadline>,
    ) -> Result<IoFuture> {
        let shared = Arc::new(future::Shared::default());
        self.begin(
            handle.as_handle(),
            OpKind::Read,
            buffer.into(),
            offset,
            deadline,
            Receiver::Awaiter(Arc::clone(&shared)),
        )?;
        Ok(IoFuture::new(shared))
    }

    /// Begins an asynchronous write whose completion resumes an awaiter.
    pub fn co_write(
        &self,
        handle: &impl AsHandle,
        buffer: impl Into<OpBuffer>,
        offset: u64,
        deadline: Option<Deadline>,
    ) -> Result<IoFuture> {
        let shared = Arc::new(future::Shared::default());
        self.begin(
            handle.as_handle(),
            OpKind::Write,
            buffer.into(),
            offset,
            deadline,
            Receiver::Awaiter(Arc::clone(&shared)),
        )?;
        Ok(IoFuture::new(shared))
    }

    /// Reads synchronously through the multiplexer, driving it from the
    /// calling thread until the completion arrives.
    pub fn read_blocking(
        &self,
        handle: &impl AsHandle,
        buffer: impl Into<OpBuffer>,
        offset: u64,
        deadline: Option<Deadline>,
    ) -> Result<(usize, OpBuffer)> {
        let parked = Arc::new(ParkedCompletion::default());
        let delivery = Arc::clone(&parked);
        let id = self.begin(
            handle.as_handle(),
            OpKind::Read,
            buffer.into(),
            offset,
            deadline,
            Receiver::Callback(Box::new(move |completion| delivery.deliver(completion))),
        )?;
        self.block_on(id, parked, deadline)
    }

    /// Writes synchronously through the multiplexer, driving it from the
    /// calling thread until the completion arrives.
    pub fn write_blocking(
        &self,
        handle: &impl AsHandle,
        buffer: impl Into<OpBuffer>,
        offset: u64,
        deadline: Option<Deadline>,
    ) -> Result<(usize, OpBuffer)> {
        let parked = Arc::new(ParkedCompletion::default());
        let delivery = Arc::clone(&parked);
        let id = self.begin(
            handle.as_handle(),
            OpKind::Write,
            buffer.into(),
            offset,
            deadline,
            Receiver::Callback(Box::new(move |completion| delivery.deliver(completion))),
        )?;
        self.block_on(id, parked, deadline)
    }

    /// Cancels an in-flight operation. Its receiver is invoked with
    /// [`Errc::OperationCanceled`]; a later kernel notification is
    /// discarded. Cancelling a finished or unknown operation is a no-op.
    pub fn cancel(&self, id: OpId) -> Result<()> {
        let mut finishers = Vec::new();
        {
            let mut state = self.lock();
            self.finish_op(
                &mut state,
                id.0,
                Err(Error::generic(Errc::OperationCanceled)),
                &mut finishers,
            );
        }
        self.dispatch(finishers);
        Ok(())
    }

    /// Whether no work of any kind is pending. Cancelled operations whose
    /// kernel notification has not yet arrived do not count as work: their
    /// receivers have already run.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.posted.is_empty()
            && state.ready.is_empty()
            && state.ops.values().all(|op| op.finished)
    }

    /// Polls the kernel port for completions only (no posted work),
    /// invoking each associated receiver exactly once. Returns the number
    /// of receivers invoked.
    pub fn complete_io(&self, max: usize, deadline: Option<Deadline>) -> Result<usize> {
        self.drive(max, deadline, false)
    }

    /// Executes posted items, dispatches completions and expires timeouts,
    /// sleeping in the kernel between batches. Returns when any work was
    /// done or `deadline` passes; the count of items processed.
    pub fn run(&self, max: usize, deadline: Option<Deadline>) -> Result<usize> {
        self.drive(max, deadline, true)
    }

    fn drive(&self, max: usize, deadline: Option<Deadline>, include_posted: bool) -> Result<usize> {
        let began = Instant::now();
        let budget = if max == 0 { usize::MAX } else { max };
        let mut done = 0;

        loop {
            if include_posted && done < budget {
                done += self.invoke_posted_items(budget - done, deadline)?;
            }
            done += self.dispatch_ready(budget - done);
            done += self.expire_deadlines(budget.saturating_sub(done));
            if done > 0 {
                return Ok(done);
            }

            let timeout = self.wait_timeout(deadline, began);
            let Some(timeout) = timeout else {
                // Caller deadline already passed; take one zero-length look
                // at the kernel so a poll still observes finished work.
                let events = self.backend_wait(Duration::ZERO)?;
                self.process_events(events);
                done += self.dispatch_ready(budget - done);
                done += self.expire_deadlines(budget.saturating_sub(done));
                return Ok(done);
            };

            self.inner.waiters.fetch_add(1, Ordering::AcqRel);
            let events = self.backend_wait(timeout);
            self.inner.waiters.fetch_sub(1, Ordering::AcqRel);
            let events = events?;
            self.process_events(events);

            if let Some(d) = deadline {
                if d.expired(began) {
                    // One more dispatch pass so work surfaced by the final
                    // wait is not lost.
                    done += self.dispatch_ready(budget - done);
                    done += self.expire_deadlines(budget.saturating_sub(done));
                    return Ok(done);
                }
            }
        }
    }

    /// The next kernel wait duration, or `None` when the caller deadline
    /// has already expired.
    fn wait_timeout(&self, deadline: Option<Deadline>, began: Instant) -> Option<Duration> {
        let earliest = { self.lock().earliest_wakeup() };
        let now = Instant::now();
        let mut timeout = Duration::from_secs(3600);
        if let Some(when) = earliest {
            timeout = timeout.min(when.saturating_duration_since(now));
        }
        if let Some(d) = deadline {
            let remaining = d.remaining(began);
            if remaining.is_zero() {
                return None;
            }
            timeout = timeout.min(remaining);
        }
        Some(timeout)
    }

    // ---- internal machinery ----

    fn lock(&self) -> std::sync::MutexGuard<'_, MuxState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn drive_mode_for(&self, h: &Handle) -> Result<DriveMode> {
        match self.inner.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(_) => Ok(if h.native().is_seekable() {
                DriveMode::Immediate
            } else {
                DriveMode::Readiness
            }),
            #[cfg(target_os = "linux")]
            Backend::Uring(_) => Ok(DriveMode::Submission),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(_) => Ok(if h.native().is_seekable() {
                DriveMode::Immediate
            } else {
                DriveMode::Readiness
            }),
            #[cfg(windows)]
            Backend::Iocp(_) | Backend::Alertable(_) => Ok(DriveMode::Submission),
        }
    }

    fn begin(
        &self,
        h: &Handle,
        kind: OpKind,
        buffer: OpBuffer,
        offset: u64,
        deadline: Option<Deadline>,
        receiver: Receiver,
    ) -> Result<OpId> {
        let fd = raw_of(h);
        let began = Instant::now();

        let mut state = self.lock();
        let Some(registration) = state.registered.get(&fd) else {
            return Err(Error::generic(Errc::InvalidArgument));
        };
        let mode = registration.mode;

        let id = state.next_id;
        state.next_id += 1;

        let mut op = Operation {
            kind,
            fd,
            offset,
            seekable: h.native().is_seekable(),
            buffer,
            receiver: Some(receiver),
            finished: false,
            steady_key: None,
            system_key: None,
        };

        // Deadline bookkeeping first, so an immediate completion can unlink.
        let mut made_earlier = false;
        if let Some(deadline) = deadline {
            match deadline {
                Deadline::Relative(duration) => {
                    let when = began.checked_add(duration).unwrap_or(began + Duration::from_secs(86400 * 365));
                    made_earlier = state
                        .steady_deadlines
                        .keys()
                        .next()
                        .map_or(true, |(first, _)| when < *first);
                    state.steady_deadlines.insert((when, id), id);
                    op.steady_key = Some((when, id));
                }
                Deadline::Absolute(when) => {
                    made_earlier = state
                        .system_deadlines
                        .keys()
                        .next()
                        .map_or(true, |(first, _)| when < *first);
                    state.system_deadlines.insert((when, id), id);
                    op.system_key = Some((when, id));
                }
            }
        }

        match mode {
            DriveMode::Immediate => {
                // Perform the transfer now; files do not block on readiness.
                let result = sys_transfer(&mut op);
                state.ops.insert(id, op);
                match result {
                    TransferOutcome::Done(result) => state.ready.push_back((id, result)),
                    TransferOutcome::WouldBlock => {
                        // A seekable handle returned EAGAIN: surface it.
                        state
                            .ready
                            .push_back((id, Err(Error::generic(Errc::ResourceUnavailableTryAgain))));
                    }
                }
            }
            DriveMode::Readiness => {
                // Try once; queue on the readiness port if it would block.
                let result = sys_transfer(&mut op);
                let op_kind = op.kind;
                state.ops.insert(id, op);
                match result {
                    TransferOutcome::Done(result) => state.ready.push_back((id, result)),
                    TransferOutcome::WouldBlock => {
                        let registration = state
                            .registered
                            .get_mut(&fd)
                            .expect("registration checked above");
                        match op_kind {
                            OpKind::Read => registration.read_queue.push_back(id),
                            OpKind::Write => registration.write_queue.push_back(id),
                        }
                        let want_read = !registration.read_queue.is_empty();
                        let want_write = !registration.write_queue.is_empty();
                        drop(state);
                        self.backend_interest(fd, want_read, want_write);
                        self.maybe_wake(made_earlier);
                        event!(Level::TRACE, id, fd = ?fd, "operation parked on readiness");
                        return Ok(OpId(id));
                    }
                }
            }
            DriveMode::Submission => {
                // A waiter blocked in the kernel may hold the submission
                // ring; nudge it out before we queue behind it.
                self.wake_waiters();
                state.ops.insert(id, op);
                let submitted = {
                    let op = state.ops.get_mut(&id).expect("just inserted");
                    self.backend_submit(id, op)
                };
                if let Err(error) = submitted {
                    state.ready.push_back((id, Err(error)));
                }
            }
        }
        drop(state);
        // Someone blocked in run() must dispatch what we queued.
        self.wake_waiters();
        self.maybe_wake(made_earlier);
        Ok(OpId(id))
    }

    /// Invokes receivers for everything in the ready queue, up to `budget`.
    fn dispatch_ready(&self, budget: usize) -> usize {
        if budget == 0 {
            return 0;
        }
        let mut finishers = Vec::new();
        {
            let mut state = self.lock();
            while finishers.len() < budget {
                let Some((id, result)) = state.ready.pop_front() else {
                    break;
                };
                self.finish_op(&mut state, id, result, &mut finishers);
            }
        }
        let n = finishers.len();
        self.dispatch(finishers);
        n
    }

    /// Times out every operation whose deadline has passed, up to `budget`.
    fn expire_deadlines(&self, budget: usize) -> usize {
        if budget == 0 {
            return 0;
        }
        let now = Instant::now();
        let wall = SystemTime::now();
        let mut finishers = Vec::new();
        {
            let mut state = self.lock();
            for id in state.expired(now, wall) {
                if finishers.len() >= budget {
                    break;
                }
                self.finish_op(
                    &mut state,
                    id,
                    Err(Error::generic(Errc::TimedOut)),
                    &mut finishers,
                );
            }
        }
        let n = finishers.len();
        self.dispatch(finishers);
        n
    }

    /// Transitions an operation to finished: unlinks deadlines, removes it
    /// from readiness queues, issues a kernel cancel where one is needed,
    /// and collects the receiver for dispatch outside the lock.
    ///
    /// Submission-mode operations whose kernel i/o is still pending stay in
    /// the arena with `finished` set; the eventual kernel notification is
    /// consumed silently and frees the slot.
    fn finish_op(
        &self,
        state: &mut MuxState,
        id: u64,
        result: Result<usize>,
        finishers: &mut Vec<(Receiver, Completion)>,
    ) {
        state.unlink_deadlines(id);
        let fd = match state.ops.get_mut(&id) {
            None => return,
            Some(op) => {
                if op.finished {
                    return;
                }
                op.finished = true;
                op.fd
            }
        };

        // Remove from any readiness queue.
        let mut readiness_member = false;
        if let Some(registration) = state.registered.get_mut(&fd) {
            if registration.mode == DriveMode::Readiness {
                registration.read_queue.retain(|&queued| queued != id);
                registration.write_queue.retain(|&queued| queued != id);
                readiness_member = true;
            }
        }

        // A failing completion of a kernel-submitted op needs a cancel; the
        // op then stays pinned (buffer and all) until the kernel's
        // notification arrives and is consumed silently.
        let keep_pinned = result.is_err() && self.backend_cancel(id);

        if keep_pinned {
            let op = state.ops.get_mut(&id).expect("present above");
            if let Some(receiver) = op.receiver.take() {
                // Hand back an empty buffer; the real one is still pinned.
                finishers.push((
                    receiver,
                    Completion {
                        result,
                        buffer: OpBuffer::Owned(Vec::new()),
                    },
                ));
            }
        } else if let Some(mut op) = state.ops.remove(&id) {
            if let Some(receiver) = op.receiver.take() {
                let buffer = std::mem::replace(&mut op.buffer, OpBuffer::Owned(Vec::new()));
                finishers.push((receiver, Completion { result, buffer }));
            }
        }

        if readiness_member {
            // Interest may have drained; let the backend know.
            if let Some(registration) = state.registered.get(&fd) {
                let want_read = !registration.read_queue.is_empty();
                let want_write = !registration.write_queue.is_empty();
                self.backend_interest(fd, want_read, want_write);
            }
        }
    }

    /// Issues a kernel-side cancel for a still-submitted operation.
    /// Returns whether a later kernel notification should be expected (and
    /// therefore the operation must stay pinned).
    fn backend_cancel(&self, id: u64) -> bool {
        match &self.inner.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(_) => false,
            #[cfg(target_os = "linux")]
            Backend::Uring(ring) => ring.cancel(id),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(_) => false,
            #[cfg(windows)]
            Backend::Iocp(iocp) | Backend::Alertable(iocp) => iocp.cancel(id),
        }
    }

    /// Applies kernel events gathered by a backend wait.
    fn process_events(&self, events: Vec<KernelEvent>) {
        let mut state = self.lock();
        for event in events {
            match event {
                KernelEvent::Wake => {}
                KernelEvent::Finished { id, result } => {
                    match state.ops.get(&id).map(|op| op.finished) {
                        // A suppressed (cancelled or timed-out) operation's
                        // notification: consume silently, freeing the slot.
                        Some(true) => {
                            state.ops.remove(&id);
                        }
                        Some(false) => state.ready.push_back((id, result)),
                        None => {}
                    }
                }
                KernelEvent::Ready { fd, readable, writable } => {
                    self.drain_readiness(&mut state, fd, readable, writable);
                }
            }
        }
    }

    /// Retries parked operations on a freshly ready descriptor.
    fn drain_readiness(&self, state: &mut MuxState, fd: RawOsHandle, readable: bool, writable: bool) {
        let Some(registration) = state.registered.get_mut(&fd) else {
            return;
        };
        let mut retry = Vec::new();
        if readable {
            if let Some(id) = registration.read_queue.pop_front() {
                retry.push(id);
            }
        }
        if writable {
            if let Some(id) = registration.write_queue.pop_front() {
                retry.push(id);
            }
        }
        for id in retry {
            let Some(op) = state.ops.get_mut(&id) else {
                continue;
            };
            let kind = op.kind;
            match sys_transfer(op) {
                TransferOutcome::Done(result) => state.ready.push_back((id, result)),
                TransferOutcome::WouldBlock => {
                    // Spurious readiness; park again at the front to keep
                    // FIFO order.
                    let registration = state.registered.get_mut(&fd).expect("still registered");
                    match kind {
                        OpKind::Read => registration.read_queue.push_front(id),
                        OpKind::Write => registration.write_queue.push_front(id),
                    }
                }
            }
        }
        if let Some(registration) = state.registered.get(&fd) {
            let want_read = !registration.read_queue.is_empty();
            let want_write = !registration.write_queue.is_empty();
            self.backend_interest(fd, want_read, want_write);
        }
    }

    /// Invokes receivers outside the lock, honoring deferred-completion
    /// regions.
    fn dispatch(&self, finishers: Vec<(Receiver, Completion)>) {
        for (receiver, completion) in finishers {
            dispatch_completion(receiver, completion);
        }
    }

    fn block_on(
        &self,
        id: OpId,
        parked: Arc<ParkedCompletion>,
        deadline: Option<Deadline>,
    ) -> Result<(usize, OpBuffer)> {
        let began = Instant::now();
        loop {
            if let Some(completion) = parked.take() {
                return completion.result.map(|n| (n, completion.buffer));
            }
            // Drive the engine from this thread; with a thread pool the
            // completion may equally arrive via another thread's run().
            self.run(0, Some(Deadline::Relative(Duration::from_millis(100))))?;
            if let Some(completion) = parked.take() {
                return completion.result.map(|n| (n, completion.buffer));
            }
            if let Some(d) = deadline {
                if d.expired(began) {
                    // The deadline machinery delivers TimedOut through the
                    // receiver; force it through, then fall back to an
                    // explicit cancel.
                    self.expire_deadlines(usize::MAX);
                    let _ = self.cancel(id);
                    if let Some(completion) = parked.take() {
                        return completion.result.map(|n| (n, completion.buffer));
                    }
                    return Err(Error::generic(Errc::TimedOut));
                }
            }
        }
    }

    fn wake_waiters(&self) {
        if self.inner.waiters.load(Ordering::Acquire) > 0 {
            self.backend_wake();
        }
    }

    fn maybe_wake(&self, made_earlier: bool) {
        // Threads in kernel waits must recompute their wakeup when a new
        // earliest deadline appears.
        if made_earlier && self.inner.waiters.load(Ordering::Acquire) > 0 {
            self.backend_wake();
        }
    }

    // ---- backend dispatch (hand-rolled, no vtable on the hot path) ----

    fn backend_register(&self, fd: RawOsHandle) -> Result<()> {
        match &self.inner.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(epoll) => epoll.register(fd),
            #[cfg(target_os = "linux")]
            Backend::Uring(_) => Ok(()),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(kq) => kq.register(fd),
            #[cfg(windows)]
            Backend::Iocp(iocp) | Backend::Alertable(iocp) => iocp.register(fd),
        }
    }

    fn backend_deregister(&self, fd: RawOsHandle) {
        match &self.inner.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(epoll) => epoll.deregister(fd),
            #[cfg(target_os = "linux")]
            Backend::Uring(_) => {}
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(kq) => kq.deregister(fd),
            #[cfg(windows)]
            Backend::Iocp(_) | Backend::Alertable(_) => {}
        }
    }

    fn backend_interest(&self, fd: RawOsHandle, read: bool, write: bool) {
        match &self.inner.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(epoll) => epoll.set_interest(fd, read, write),
            #[cfg(target_os = "linux")]
            Backend::Uring(_) => {}
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(kq) => kq.set_interest(fd, read, write),
            #[cfg(windows)]
            Backend::Iocp(_) | Backend::Alertable(_) => {}
        }
    }

    fn backend_submit(&self, id: u64, op: &mut Operation) -> Result<()> {
        match &self.inner.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(_) => unreachable!("epoll handles have no submission mode"),
            #[cfg(target_os = "linux")]
            Backend::Uring(ring) => ring.submit(id, op),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(_) => unreachable!("kqueue handles have no submission mode"),
            #[cfg(windows)]
            Backend::Iocp(iocp) | Backend::Alertable(iocp) => iocp.submit(id, op),
        }
    }

    fn backend_wait(&self, timeout: Duration) -> Result<Vec<KernelEvent>> {
        match &self.inner.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(epoll) => epoll.wait(timeout),
            #[cfg(target_os = "linux")]
            Backend::Uring(ring) => ring.wait(timeout),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(kq) => kq.wait(timeout),
            #[cfg(windows)]
            Backend::Iocp(iocp) => iocp.wait(timeout, false),
            #[cfg(windows)]
            Backend::Alertable(iocp) => iocp.wait(timeout, true),
        }
    }

    fn backend_wake(&self) {
        match &self.inner.backend {
            #[cfg(target_os = "linux")]
            Backend::Epoll(epoll) => epoll.wake(),
            #[cfg(target_os = "linux")]
            Backend::Uring(ring) => ring.wake(),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Backend::Kqueue(kq) => kq.wake(),
            #[cfg(windows)]
            Backend::Iocp(iocp) | Backend::Alertable(iocp) => iocp.wake(),
        }
    }
}

fn raw_of(h: &Handle) -> RawOsHandle {
    #[cfg(unix)]
    {
        h.native().fd()
    }
    #[cfg(windows)]
    {
        h.native().raw_handle() as RawOsHandle
    }
}

enum TransferOutcome {
    Done(Result<usize>),
    WouldBlock,
}

/// Performs one read or write syscall for `op`: positional i/o on seekable
/// handles, plain read/write on the rest (whose descriptors are
/// non-blocking).
#[cfg(unix)]
fn sys_transfer(op: &mut Operation) -> TransferOutcome {
    let fd = op.fd;
    let len = op.buffer.len();
    let ptr = op.buffer.kernel_ptr();
    let seekable = op.seekable;
    loop {
        // SAFETY: ptr/len come from the operation's owned buffer, which is
        // pinned in the arena for the duration.
        let n = unsafe {
            match (op.kind, seekable) {
                (OpKind::Read, true) => libc::pread(fd, ptr.cast(), len, op.offset as libc::off_t),
                (OpKind::Read, false) => libc::read(fd, ptr.cast(), len),
                (OpKind::Write, true) => {
                    libc::pwrite(fd, ptr.cast_const().cast(), len, op.offset as libc::off_t)
                }
                (OpKind::Write, false) => libc::write(fd, ptr.cast_const().cast(), len),
            }
        };
        if n >= 0 {
            return TransferOutcome::Done(Ok(n as usize));
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) => {}
            Some(libc::EAGAIN) => return TransferOutcome::WouldBlock,
            _ => return TransferOutcome::Done(Err(Error::last_os_error())),
        }
    }
}

#[cfg(windows)]
fn sys_transfer(op: &mut Operation) -> TransferOutcome {
    // Windows drives everything through IOCP submission.
    let _ = op;
    TransferOutcome::Done(Err(Error::generic(Errc::NotSupported)))
}

/// A completion slot a blocking caller parks on.
#[derive(Default)]
struct ParkedCompletion {
    slot: Mutex<Option<Completion>>,
}

impl ParkedCompletion {
    fn deliver(&self, completion: Completion) {
        let mut slot = self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(completion);
    }

    fn take(&self) -> Option<Completion> {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

// ---- the current multiplexer ----

thread_local! {
    static CURRENT: RefCell<Option<Multiplexer>> = const { RefCell::new(None) };
}

/// The calling thread's multiplexer, lazily initialized to
/// [`Multiplexer::best_available`]`(1)`.
///
/// Strictly thread-local: it is never inherited across OS threads, so each
/// thread lazily gets its own engine unless it installs one explicitly with
/// [`set_current_multiplexer`].
pub fn current_multiplexer() -> Result<Multiplexer> {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if let Some(mux) = current.as_ref() {
            return Ok(mux.clone());
        }
        let mux = Multiplexer::best_available(1)?;
        *current = Some(mux.clone());
        Ok(mux)
    })
}

/// Installs `mux` as the calling thread's multiplexer (or clears it with
/// `None`), returning the previous one.
pub fn set_current_multiplexer(mux: Option<Multiplexer>) -> Option<Multiplexer> {
    CURRENT.with(|current| std::mem::replace(&mut *current.borrow_mut(), mux))
}

// ---- deferred completions ----

struct Deferral {
    depth: usize,
    queue: Vec<(Receiver, Completion)>,
}

thread_local! {
    static DEFERRAL: RefCell<Deferral> = const {
        RefCell::new(Deferral {
            depth: 0,
            queue: Vec::new(),
        })
    };
}

/// Marks a region during which completions are not executed immediately but
/// appended to a thread-local list drained when the outermost region
/// unwinds. This prevents re-entry into user completions while the caller
/// still holds invariants.
pub fn defer_completions<R>(f: impl FnOnce() -> R) -> R {
    DEFERRAL.with(|deferral| deferral.borrow_mut().depth += 1);
    let _guard = scopeguard::guard((), |()| {
        let drained = DEFERRAL.with(|deferral| {
            let mut deferral = deferral.borrow_mut();
            deferral.depth -= 1;
            if deferral.depth == 0 {
                std::mem::take(&mut deferral.queue)
            } else {
                Vec::new()
            }
        });
        for (receiver, completion) in drained {
            invoke_receiver(receiver, completion);
        }
    });
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_buffer_variants_expose_bytes() {
        let owned = OpBuffer::Owned(vec![1, 2, 3]);
        assert_eq!(owned.len(), 3);
        assert_eq!(owned.as_slice(), &[1, 2, 3]);
        assert!(!owned.is_empty());

        let registered = OpBuffer::Registered(RegisteredBuffer::allocate(16).expect("allocate"));
        assert!(registered.len() >= 16);
    }

    #[test]
    fn deferral_regions_nest_and_return() {
        let value = defer_completions(|| defer_completions(|| 42));
        assert_eq!(value, 42);
    }

    #[test]
    fn fresh_multiplexer_is_idle() {
        let mux = Multiplexer::best_available(1).expect("multiplexer");
        assert!(mux.is_idle());
        // A poll over an idle engine does nothing, promptly.
        assert_eq!(mux.run(1, Some(Deadline::POLL)).expect("run"), 0);
    }

    #[test]
    fn operations_on_unregistered_handles_are_rejected() {
        let mux = Multiplexer::best_available(1).expect("multiplexer");
        let handle = crate::Handle::invalid();
        let error = mux.register_io_handle(&HandleOnly(&handle)).expect_err("invalid");
        assert_eq!(error.errc(), Some(Errc::InvalidArgument));
    }

    struct HandleOnly<'a>(&'a Handle);

    impl AsHandle for HandleOnly<'_> {
        fn as_handle(&self) -> &Handle {
            self.0
        }
    }
}

fn dispatch_completion(receiver: Receiver, completion: Completion) {
    let undeferred = DEFERRAL.with(move |deferral| {
        let mut deferral = deferral.borrow_mut();
        if deferral.depth > 0 {
            deferral.queue.push((receiver, completion));
            None
        } else {
            Some((receiver, completion))
        }
    });
    if let Some((receiver, completion)) = undeferred {
        invoke_receiver(receiver, completion);
    }
}

fn invoke_receiver(receiver: Receiver, completion: Completion) {
    match receiver {
        Receiver::Callback(callback) => {
            // User completions must not unwind through the multiplexer.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                callback(completion);
            }));
            if let Err(payload) = result {
                let error = Error::from_panic(payload.as_ref());
                event!(Level::ERROR, %error, "completion callback panicked");
            }
        }
        Receiver::Awaiter(shared) => {
            let waker: Option<Waker> = shared.complete(completion);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

