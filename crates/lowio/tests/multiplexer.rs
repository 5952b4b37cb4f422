// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Multiplexer contract tests: posted-work FIFO, deadlines, cancellation,
//! deferred completion regions.

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lowio::{Caching, Deadline, Errc, HandleFlags, Multiplexer, PipeHandle};

#[test]
fn posted_items_run_in_fifo_order() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let order = Arc::new(Mutex::new(Vec::new()));
    const N: usize = 100;
    for i in 0..N {
        let order = Arc::clone(&order);
        mux.post(move || order.lock().expect("order").push(i));
    }
    let mut total = 0;
    while total < N {
        total += mux
            .run(0, Some(Deadline::Relative(Duration::from_secs(1))))
            .expect("run");
    }
    let observed = order.lock().expect("order").clone();
    let expected: Vec<usize> = (0..N).collect();
    assert_eq!(observed, expected);
}

#[test]
fn invoke_posted_items_respects_max() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let count = Arc::new(Mutex::new(0usize));
    for _ in 0..10 {
        let count = Arc::clone(&count);
        mux.post(move || *count.lock().expect("count") += 1);
    }
    let first = mux.invoke_posted_items(3, None).expect("first batch");
    assert_eq!(first, 3);
    assert_eq!(*count.lock().expect("count"), 3);
    let rest = mux.invoke_posted_items(0, None).expect("rest");
    assert_eq!(rest, 7);
}

#[test]
fn zero_deadline_read_is_a_poll() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let (read_end, _write_end) =
        PipeHandle::anonymous_pipe(Caching::All, HandleFlags::OVERLAPPED).expect("pipe pair");
    mux.register_io_handle(&read_end).expect("register");

    let began = Instant::now();
    let error = mux
        .read_blocking(&read_end, vec![0u8; 8], 0, Some(Deadline::POLL))
        .expect_err("empty pipe cannot satisfy a poll");
    assert_eq!(error.errc(), Some(Errc::TimedOut));
    assert!(
        began.elapsed() < Duration::from_secs(2),
        "a poll returns within bounded time"
    );
}

#[test]
fn deadline_expiry_reports_timed_out() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let (read_end, _write_end) =
        PipeHandle::anonymous_pipe(Caching::All, HandleFlags::OVERLAPPED).expect("pipe pair");
    mux.register_io_handle(&read_end).expect("register");

    let began = Instant::now();
    let error = mux
        .read_blocking(
            &read_end,
            vec![0u8; 8],
            0,
            Some(Deadline::Relative(Duration::from_millis(100))),
        )
        .expect_err("nothing will arrive");
    assert_eq!(error.errc(), Some(Errc::TimedOut));
    let elapsed = began.elapsed();
    assert!(elapsed >= Duration::from_millis(90), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
}

#[test]
fn absolute_deadline_expires_too() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let (read_end, _write_end) =
        PipeHandle::anonymous_pipe(Caching::All, HandleFlags::OVERLAPPED).expect("pipe pair");
    mux.register_io_handle(&read_end).expect("register");

    let cutoff = std::time::SystemTime::now() + Duration::from_millis(100);
    let error = mux
        .read_blocking(&read_end, vec![0u8; 8], 0, Some(Deadline::Absolute(cutoff)))
        .expect_err("nothing will arrive");
    assert_eq!(error.errc(), Some(Errc::TimedOut));
}

#[test]
fn explicit_cancel_delivers_operation_canceled() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let (read_end, _write_end) =
        PipeHandle::anonymous_pipe(Caching::All, HandleFlags::OVERLAPPED).expect("pipe pair");
    mux.register_io_handle(&read_end).expect("register");

    let outcome = Arc::new(Mutex::new(None));
    let delivery = Arc::clone(&outcome);
    let id = mux
        .read_op(&read_end, vec![0u8; 8], 0, None, move |completion| {
            *delivery.lock().expect("outcome") = Some(completion.result);
        })
        .expect("begin read");

    mux.cancel(id).expect("cancel");
    // The receiver fires on the cancel path itself or on the next drive.
    let _ = mux.run(0, Some(Deadline::Relative(Duration::from_millis(200))));

    let outcome = outcome.lock().expect("outcome").take().expect("receiver ran");
    let error = outcome.expect_err("cancelled");
    assert_eq!(error.errc(), Some(Errc::OperationCanceled));
}

#[test]
fn completions_are_deferred_inside_a_region() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let (read_end, write_end) =
        PipeHandle::anonymous_pipe(Caching::All, HandleFlags::OVERLAPPED).expect("pipe pair");
    mux.register_io_handle(&read_end).expect("register");

    let fired = Arc::new(AtomicBool::new(false));
    let delivery = Arc::clone(&fired);
    mux.read_op(&read_end, vec![0u8; 4], 0, None, move |completion| {
        completion.result.expect("read completes");
        delivery.store(true, Ordering::SeqCst);
    })
    .expect("begin read");

    {
        use lowio::{ConstBuffer, IoHandle, IoRequest};
        let payload = *b"ping";
        let mut buffers = [ConstBuffer::new(&payload)];
        write_end
            .write(IoRequest::new(&mut buffers, 0), None)
            .expect("write");
    }

    lowio::defer_completions(|| {
        // Drive until the completion is ready; it must not run inside the
        // region.
        for _ in 0..100 {
            let _ = mux.run(0, Some(Deadline::Relative(Duration::from_millis(50))));
            if mux.is_idle() {
                break;
            }
        }
        assert!(!fired.load(Ordering::SeqCst), "completion held back in the region");
    });
    assert!(fired.load(Ordering::SeqCst), "completion ran when the region unwound");
}

#[test]
fn deregister_refuses_while_io_in_flight() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let (read_end, _write_end) =
        PipeHandle::anonymous_pipe(Caching::All, HandleFlags::OVERLAPPED).expect("pipe pair");
    mux.register_io_handle(&read_end).expect("register");

    let id = mux
        .read_op(&read_end, vec![0u8; 8], 0, None, |_| {})
        .expect("begin read");
    let error = mux.deregister_io_handle(&read_end).expect_err("i/o in flight");
    assert_eq!(error.errc(), Some(Errc::ResourceUnavailableTryAgain));

    mux.cancel(id).expect("cancel");
    let _ = mux.run(0, Some(Deadline::Relative(Duration::from_millis(100))));
    mux.deregister_io_handle(&read_end).expect("deregister after cancel");
}

#[test]
fn current_multiplexer_is_per_thread() {
    let here = lowio::current_multiplexer().expect("current");
    // Stable within the thread.
    let again = lowio::current_multiplexer().expect("current again");
    let _ = (here, again);

    // A fresh thread lazily builds its own engine rather than inheriting.
    std::thread::spawn(|| {
        let there = lowio::current_multiplexer().expect("current elsewhere");
        assert!(there.is_idle());
    })
    .join()
    .expect("thread");

    let previous = lowio::set_current_multiplexer(None);
    assert!(previous.is_some(), "replace returns the lazily installed engine");
}

#[test]
fn double_registration_is_rejected() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let (read_end, _write_end) =
        PipeHandle::anonymous_pipe(Caching::All, HandleFlags::OVERLAPPED).expect("pipe pair");
    mux.register_io_handle(&read_end).expect("first registration");
    let error = mux.register_io_handle(&read_end).expect_err("second registration");
    assert_eq!(error.errc(), Some(Errc::FileExists));
}
