// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A fixed-size in-process log ring.
//!
//! Every [`Error`](crate::Error) raised by this library writes one record
//! here and remembers its index, so a postmortem can correlate an error value
//! with what the library was doing around the time it was raised. Records are
//! also mirrored to `tracing` at TRACE level.
//!
//! The ring holds the most recent [`RING_CAPACITY`] records; older records
//! are overwritten. Indices are monotonically increasing, so an index older
//! than `highest - RING_CAPACITY` refers to a record that no longer exists.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::{event, Level};

/// Number of records retained.
pub const RING_CAPACITY: usize = 4096;

/// One record in the ring.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Monotonic index of this record.
    pub index: u64,
    /// Id of the thread that wrote it (see [`current_thread_id`]).
    pub thread_id: u64,
    /// The message text.
    pub message: String,
}

struct Ring {
    records: Vec<Option<LogRecord>>,
    next_index: u64,
}

static RING: Lazy<Mutex<Ring>> = Lazy::new(|| {
    Mutex::new(Ring {
        records: (0..RING_CAPACITY).map(|_| None).collect(),
        next_index: 0,
    })
});

/// A small dense id for the calling thread.
///
/// `std::thread::ThreadId` has no stable integer accessor, so threads are
/// numbered on first use from a process-wide counter.
#[must_use]
pub fn current_thread_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

/// Appends a record, returning its index. Returns `None` only if the ring
/// lock is poisoned, in which case the record is silently dropped.
pub fn record(args: fmt::Arguments<'_>) -> Option<u64> {
    let message = fmt::format(args);
    event!(Level::TRACE, record = %message, "log ring record");

    let mut ring = RING.lock().ok()?;
    let index = ring.next_index;
    ring.next_index += 1;
    let slot = (index % RING_CAPACITY as u64) as usize;
    ring.records[slot] = Some(LogRecord {
        index,
        thread_id: current_thread_id(),
        message,
    });
    Some(index)
}

/// Fetches the record at `index`, if it has not yet been overwritten.
#[must_use]
pub fn fetch(index: u64) -> Option<LogRecord> {
    let ring = RING.lock().ok()?;
    let slot = (index % RING_CAPACITY as u64) as usize;
    ring.records[slot]
        .as_ref()
        .filter(|record| record.index == index)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_then_fetch() {
        let index = record(format_args!("hello ring")).expect("ring available");
        let fetched = fetch(index).expect("still resident");
        assert_eq!(fetched.message, "hello ring");
        assert_eq!(fetched.index, index);
        assert_eq!(fetched.thread_id, current_thread_id());
    }

    #[test]
    fn missing_record_is_none() {
        let index = record(format_args!("probe")).expect("ring available");
        // An index far in the future was never written.
        assert!(fetch(index + u64::from(u32::MAX)).is_none());
    }

    #[test]
    fn thread_ids_are_distinct() {
        let a = current_thread_id();
        let b = std::thread::spawn(current_thread_id).join().expect("join");
        assert_ne!(a, b);
        // Stable within a thread.
        assert_eq!(a, current_thread_id());
    }
}
