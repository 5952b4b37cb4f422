// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Asynchronous write-out followed by synchronous read-back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lowio::{
    page_size, AsHandle, AsyncFileHandle, Caching, Deadline, FileHandle, HandleFlags, Mode,
    Multiplexer, OpBuffer, RegisteredBuffer,
};

const BLOCK: usize = 4096;
const BLOCKS: usize = 1024;

/// Opens an unlinked async temp file, preferring direct-data caching and
/// falling back to default caching on filesystems without direct i/o.
fn open_async_temp(mux: &Multiplexer) -> AsyncFileHandle {
    let flags = HandleFlags::UNLINK_ON_FIRST_CLOSE | HandleFlags::OVERLAPPED;
    let file = FileHandle::temp_file(
        pathview::PathView::new(""),
        Mode::Write,
        lowio::Creation::IfNeeded,
        Caching::OnlyMetadata,
        flags,
    )
    .or_else(|_| {
        FileHandle::temp_file(
            pathview::PathView::new(""),
            Mode::Write,
            lowio::Creation::IfNeeded,
            Caching::All,
            flags,
        )
    })
    .expect("open temp file");
    AsyncFileHandle::from_file(mux, file).expect("bind to multiplexer")
}

/// A block-sized buffer filled with `fill`, aligned when the handle needs
/// aligned i/o.
fn block_buffer(direct: bool, fill: u8) -> OpBuffer {
    if direct {
        let mut buffer = RegisteredBuffer::allocate(BLOCK).expect("allocate");
        buffer.as_mut_slice().expect("unique").fill(fill);
        OpBuffer::Registered(buffer)
    } else {
        OpBuffer::Owned(vec![fill; BLOCK])
    }
}

fn write_out_then_read_back(mux: &Multiplexer) {
    let file = open_async_temp(mux);
    let direct = file.as_handle().requires_aligned_io();
    if direct && page_size() != BLOCK {
        // Registered buffers are page-granular; on unusual page sizes the
        // direct path would write past the block.
        return;
    }
    file.truncate((BLOCKS * BLOCK) as u64).expect("truncate");

    let completed = Arc::new(AtomicUsize::new(0));
    for block in 0..BLOCKS {
        let completed = Arc::clone(&completed);
        file.begin_write(
            block_buffer(direct, 78),
            (block * BLOCK) as u64,
            None,
            move |completion| {
                let n = completion.result.expect("write completes");
                assert_eq!(n, BLOCK, "whole block written");
                completed.fetch_add(1, Ordering::Relaxed);
            },
        )
        .expect("begin write");
    }

    // Drive until idle.
    let mut spins = 0;
    while completed.load(Ordering::Relaxed) < BLOCKS {
        mux.run(0, Some(Deadline::Relative(Duration::from_secs(5))))
            .expect("run");
        spins += 1;
        assert!(spins < 100_000, "multiplexer failed to drain");
    }
    assert!(mux.is_idle(), "all scheduled work retired");

    // Synchronous deadlined read-back of every block.
    for block in 0..BLOCKS {
        let (n, returned) = mux
            .read_blocking(
                &file,
                block_buffer(direct, 0),
                (block * BLOCK) as u64,
                Some(Deadline::Relative(Duration::from_secs(30))),
            )
            .expect("read back");
        assert_eq!(n, BLOCK, "block {block} fully read");
        assert!(
            returned.as_slice()[..BLOCK].iter().all(|&b| b == 78),
            "block {block} contains the written pattern"
        );
    }
}

#[test]
fn async_write_then_read_back_best_available() {
    let mux = Multiplexer::best_available(2).expect("multiplexer");
    write_out_then_read_back(&mux);
}

#[cfg(target_os = "linux")]
#[test]
fn async_write_then_read_back_io_uring() {
    let Ok(mux) = Multiplexer::io_uring() else {
        // Kernel without io_uring (or seccomp); the epoll variant covers it.
        return;
    };
    write_out_then_read_back(&mux);
}

#[cfg(target_os = "linux")]
#[test]
fn async_write_then_read_back_epoll() {
    let mux = Multiplexer::epoll(1).expect("multiplexer");
    write_out_then_read_back(&mux);
}

#[test]
fn unlink_on_first_close_leaves_no_trace() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let file = open_async_temp(&mux);
    let path = file.file().as_handle().current_path();
    drop(file);
    if let Ok(path) = path {
        if !path.as_os_str().is_empty() {
            assert!(!path.exists(), "temp file unlinked at close");
        }
    }
}
