// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sixty-four pipe reads multiplexed through one engine.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lowio::{Caching, Deadline, HandleFlags, IoHandle, IoRequest, Multiplexer, PipeHandle};

const PIPES: usize = 64;

#[test]
fn sixty_four_multiplexed_pipe_reads() {
    let mux = Multiplexer::best_available(2).expect("multiplexer");

    let mut read_ends = Vec::with_capacity(PIPES);
    let mut write_ends = Vec::with_capacity(PIPES);
    for _ in 0..PIPES {
        let (read, write) =
            PipeHandle::anonymous_pipe(Caching::All, HandleFlags::OVERLAPPED).expect("pipe pair");
        mux.register_io_handle(&read).expect("register read end");
        read_ends.push(read);
        write_ends.push(write);
    }

    let received = Arc::new(Mutex::new(Vec::<u64>::new()));
    for read_end in &read_ends {
        let received = Arc::clone(&received);
        mux.read_op(read_end, vec![0u8; 8], 0, None, move |completion| {
            let n = completion.result.expect("read completes");
            assert_eq!(n, 8, "index arrives whole");
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&completion.buffer.as_slice()[..8]);
            received.lock().expect("collector").push(u64::from_le_bytes(bytes));
        })
        .expect("attach read");
    }

    // A writer thread sends each pipe's index, in reverse order, after a
    // pause long enough that every read is parked.
    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(500));
        for (index, write_end) in write_ends.iter().enumerate().rev() {
            let bytes = (index as u64).to_le_bytes();
            let mut buffers = [lowio::ConstBuffer::new(&bytes)];
            write_end
                .write(IoRequest::new(&mut buffers, 0), None)
                .expect("write index");
        }
        write_ends
    });

    let mut spins = 0;
    while received.lock().expect("collector").len() < PIPES {
        mux.run(0, Some(Deadline::Relative(Duration::from_secs(5))))
            .expect("run");
        spins += 1;
        assert!(spins < 100_000, "reads failed to complete");
    }
    let _write_ends = writer.join().expect("writer thread");

    let mut indices = received.lock().expect("collector").clone();
    indices.sort_unstable();
    let expected: Vec<u64> = (0..PIPES as u64).collect();
    assert_eq!(indices, expected, "each index received exactly once");

    for read_end in &read_ends {
        mux.deregister_io_handle(read_end).expect("deregister");
    }
}
