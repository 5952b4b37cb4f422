// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Windows i/o completion port backend.
//!
//! Registered handles get `FILE_SKIP_COMPLETION_PORT_ON_SUCCESS` and
//! `FILE_SKIP_SET_EVENT_ON_HANDLE`, so synchronously-completed i/o is
//! handled inline and never enqueues a spurious completion packet. Each
//! in-flight operation owns a heap-pinned `OVERLAPPED`; the pointer doubles
//! as the completion key back to the operation id. Cancellation goes
//! through `CancelIoEx` per `OVERLAPPED`; the cancelled operation's packet
//! still arrives and is consumed by the suppressed-notification path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use windows::Win32::Foundation::{
    CloseHandle, ERROR_IO_PENDING, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows::Win32::Storage::FileSystem::{ReadFile, SetFileCompletionNotificationModes, WriteFile};
use windows::Win32::System::WindowsProgramming::{
    FILE_SKIP_COMPLETION_PORT_ON_SUCCESS, FILE_SKIP_SET_EVENT_ON_HANDLE,
};
use windows::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus,
    OVERLAPPED, OVERLAPPED_ENTRY,
};

use super::{KernelEvent, OpKind, Operation, RawOsHandle};
use crate::{Error, Result};

/// Completion key of wake packets posted by [`Iocp::wake`].
const WAKE_KEY: usize = usize::MAX;

pub(super) struct Iocp {
    port: HANDLE,
    /// Heap-pinned OVERLAPPED blocks of in-flight submissions, keyed by
    /// operation id.
    overlapped: Mutex<HashMap<u64, InFlight>>,
}

// SAFETY: the port handle is thread-safe by OS contract; the map is behind
// a mutex.
unsafe impl Send for Iocp {}
// SAFETY: as above.
unsafe impl Sync for Iocp {}

struct InFlight {
    block: Box<OVERLAPPED>,
    handle: HANDLE,
}

impl Iocp {
    pub(super) fn new(threads: u32) -> Result<Self> {
        // SAFETY: creating a fresh port.
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, None, 0, threads) }
            .map_err(|_| Error::last_os_error())?;
        Ok(Self {
            port,
            overlapped: Mutex::new(HashMap::new()),
        })
    }

    pub(super) fn register(&self, raw: RawOsHandle) -> Result<()> {
        let handle = HANDLE(raw as *mut std::ffi::c_void);
        // SAFETY: binding a caller-owned handle to our port.
        unsafe { CreateIoCompletionPort(handle, Some(self.port), 0, 0) }
            .map_err(|_| Error::last_os_error())?;
        // Synchronous completions are handled inline by the submitter; the
        // packet would be a duplicate.
        // SAFETY: configuring a handle we just bound.
        unsafe {
            SetFileCompletionNotificationModes(
                handle,
                (FILE_SKIP_COMPLETION_PORT_ON_SUCCESS | FILE_SKIP_SET_EVENT_ON_HANDLE) as u8,
            )
        }
        .map_err(|_| Error::last_os_error())
    }

    pub(super) fn submit(&self, id: u64, op: &mut Operation) -> Result<()> {
        let handle = HANDLE(op.fd as *mut std::ffi::c_void);
        let mut block = Box::new(OVERLAPPED::default());
        block.Anonymous.Anonymous.Offset = op.offset as u32;
        block.Anonymous.Anonymous.OffsetHigh = (op.offset >> 32) as u32;
        let len = op.buffer.len();
        let ptr = op.buffer.kernel_ptr();

        let mut transferred = 0u32;
        // SAFETY: buffer and OVERLAPPED are pinned (arena + box) until the
        // completion packet arrives.
        let issued = unsafe {
            match op.kind {
                OpKind::Read => ReadFile(
                    handle,
                    Some(std::slice::from_raw_parts_mut(ptr, len)),
                    Some(&mut transferred),
                    Some(&mut *block),
                ),
                OpKind::Write => WriteFile(
                    handle,
                    Some(std::slice::from_raw_parts(ptr, len)),
                    Some(&mut transferred),
                    Some(&mut *block),
                ),
            }
        };
        match issued {
            Ok(()) => {
                // Completed synchronously; with the skip modes set, no
                // packet follows. Post one ourselves so the completion
                // flows through the ordinary dispatch path.
                self.post_finished(id, Ok(transferred as usize));
                Ok(())
            }
            Err(error) if error.code() == ERROR_IO_PENDING.to_hresult() => {
                let mut overlapped = self.lock_overlapped();
                overlapped.insert(id, InFlight { block, handle });
                Ok(())
            }
            Err(_) => Err(Error::last_os_error()),
        }
    }

    /// Issues `CancelIoEx` for `id`. Returns whether a packet is still
    /// expected.
    pub(super) fn cancel(&self, id: u64) -> bool {
        let overlapped = self.lock_overlapped();
        let Some(in_flight) = overlapped.get(&id) else {
            return false;
        };
        // SAFETY: the OVERLAPPED is pinned until its packet arrives.
        unsafe {
            let _ = CancelIoEx(in_flight.handle, Some(&*in_flight.block));
        }
        true
    }

    pub(super) fn wake(&self) {
        // SAFETY: posting a packet with our sentinel key.
        unsafe {
            let _ = PostQueuedCompletionStatus(self.port, 0, WAKE_KEY, None);
        }
    }

    pub(super) fn wait(&self, timeout: Duration, alertable: bool) -> Result<Vec<KernelEvent>> {
        let mut entries = [OVERLAPPED_ENTRY::default(); 64];
        let mut removed = 0u32;
        let millis = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;
        // SAFETY: out-param array on the stack.
        let status = unsafe {
            GetQueuedCompletionStatusEx(self.port, &mut entries, &mut removed, millis, alertable)
        };
        if let Err(error) = status {
            if error.code() == windows::core::HRESULT::from_win32(WAIT_TIMEOUT.0) {
                return Ok(Vec::new());
            }
            return Err(Error::last_os_error());
        }

        let mut out = Vec::with_capacity(removed as usize);
        let mut overlapped = self.lock_overlapped();
        for entry in &entries[..removed as usize] {
            if entry.lpCompletionKey == WAKE_KEY {
                out.push(KernelEvent::Wake);
                continue;
            }
            // Synthetic packets posted by post_finished encode id+1 in the
            // key (0 is a real kernel packet).
            if entry.lpCompletionKey != 0 {
                let id = (entry.lpCompletionKey - 1) as u64;
                out.push(KernelEvent::Finished {
                    id,
                    result: Ok(entry.dwNumberOfBytesTransferred as usize),
                });
                continue;
            }
            let block_ptr = entry.lpOverlapped;
            let id = overlapped
                .iter()
                .find(|(_, in_flight)| std::ptr::addr_of!(*in_flight.block) == block_ptr.cast_const())
                .map(|(&id, _)| id);
            let Some(id) = id else {
                continue;
            };
            let in_flight = overlapped.remove(&id).expect("found above");
            drop(in_flight);
            // SAFETY: reading the union arm the kernel filled.
            let status = unsafe { (*block_ptr).Internal };
            let result = if status == 0 {
                Ok(entry.dwNumberOfBytesTransferred as usize)
            } else {
                Err(Error::ntkernel(status as i32))
            };
            out.push(KernelEvent::Finished { id, result });
        }
        Ok(out)
    }

    fn post_finished(&self, id: u64, result: Result<usize>) {
        let transferred = result.as_ref().map_or(0, |&n| n);
        // SAFETY: posting a synthetic packet keyed by id+1.
        unsafe {
            let _ = PostQueuedCompletionStatus(
                self.port,
                transferred as u32,
                (id + 1) as usize,
                None,
            );
        }
    }

    fn lock_overlapped(&self) -> std::sync::MutexGuard<'_, HashMap<u64, InFlight>> {
        self.overlapped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for Iocp {
    fn drop(&mut self) {
        // SAFETY: closing the port this struct created.
        unsafe {
            let _ = CloseHandle(self.port);
        }
    }
}
