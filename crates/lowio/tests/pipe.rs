// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Blocking named-pipe rendezvous between two threads.

#![cfg(unix)]

use std::time::Duration;

use lowio::{
    BarrierKind, Buffer, Caching, ConstBuffer, Errc, HandleFlags, IoHandle, IoRequest, PathHandle,
    PipeHandle,
};
use pathview::PathView;

const PIPE_NAME: &str = "lowio-pipe-handle-test";

#[test]
fn blocking_named_pipe_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dir_path = dir.path().to_path_buf();

    // Reader thread: create the pipe and block in the 64-byte read.
    let reader = std::thread::spawn(move || {
        let base = PathHandle::path(None, PathView::new(&dir_path)).expect("anchor");
        let pipe = PipeHandle::pipe_create(
            Some(&base),
            PathView::new(PIPE_NAME),
            Caching::All,
            HandleFlags::empty(),
        )
        .expect("create reader end");

        let mut scratch = [0u8; 64];
        let mut buffers = [Buffer::new(&mut scratch)];
        let read = pipe.read(IoRequest::new(&mut buffers, 0), None).expect("read");
        assert_eq!(read.len(), 1, "one buffer filled");
        read[0].as_slice().to_vec()
    });

    // Give the reader time to create the pipe and block.
    std::thread::sleep(Duration::from_millis(150));

    let base = PathHandle::path(None, PathView::new(dir.path())).expect("anchor");
    let writer = loop {
        match PipeHandle::pipe_open(
            Some(&base),
            PathView::new(PIPE_NAME),
            Caching::All,
            HandleFlags::empty(),
        ) {
            Ok(pipe) => break pipe,
            Err(e) if e.errc() == Some(Errc::NoSuchFileOrDirectory) => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("writer open failed: {e}"),
        }
    };

    let mut buffers = [ConstBuffer::new(b"hello")];
    let written = writer
        .write(IoRequest::new(&mut buffers, 0), None)
        .expect("write");
    assert_eq!(written.iter().map(|b| b.len()).sum::<usize>(), 5);

    // A barrier on a pipe legally degrades to a no-op; it must not fail.
    writer
        .barrier(None, BarrierKind::WaitDataOnly, None)
        .expect("barrier");
    drop(writer);

    let received = reader.join().expect("reader thread");
    assert_eq!(received, b"hello", "the 64-byte read returns exactly the 5 bytes sent");
}
