// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Eight concurrent writer tasks interleaving blocks through awaiters.

use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use lowio::{AsyncFileHandle, Caching, Deadline, HandleFlags, Mode, Multiplexer};

const BLOCK: usize = 4096;
const WRITERS: usize = 8;
const ROUNDS: usize = 128;

#[test]
fn interleaved_coroutine_writers() {
    let mux = Multiplexer::best_available(1).expect("multiplexer");
    let dir = tempfile::tempdir().expect("tempdir");
    let base = lowio::PathHandle::path(None, pathview::PathView::new(dir.path())).expect("anchor");
    let file = Rc::new(
        AsyncFileHandle::async_file(
            &mux,
            Some(&base),
            pathview::PathView::new("interleave"),
            Mode::Write,
            lowio::Creation::IfNeeded,
            Caching::All,
            HandleFlags::empty(),
        )
        .expect("open async file"),
    );
    file.truncate((WRITERS * ROUNDS * BLOCK) as u64).expect("truncate");

    static FINISHED: AtomicUsize = AtomicUsize::new(0);
    FINISHED.store(0, Ordering::Relaxed);

    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    for writer in 0..WRITERS {
        let file = Rc::clone(&file);
        spawner
            .spawn_local(async move {
                let fill = b'0' + writer as u8;
                for round in 0..ROUNDS {
                    let offset = (round * WRITERS * BLOCK + writer * BLOCK) as u64;
                    let future = file
                        .co_write(vec![fill; BLOCK], offset, None)
                        .expect("begin co_write");
                    let completion = future.await;
                    let n = completion.result.expect("write completes");
                    assert_eq!(n, BLOCK);
                }
                FINISHED.fetch_add(1, Ordering::Relaxed);
            })
            .expect("spawn writer");
    }

    // Alternate between the task pool and the multiplexer until every
    // writer has retired.
    let mut spins = 0;
    while FINISHED.load(Ordering::Relaxed) < WRITERS {
        pool.run_until_stalled();
        if FINISHED.load(Ordering::Relaxed) >= WRITERS {
            break;
        }
        mux.run(0, Some(Deadline::Relative(Duration::from_millis(250))))
            .expect("run");
        spins += 1;
        assert!(spins < 1_000_000, "writers failed to make progress");
    }

    // Every block at offset (round*8 + writer)*BLOCK holds '0'+writer.
    let bytes = std::fs::read(dir.path().join("interleave")).expect("read file");
    assert_eq!(bytes.len(), WRITERS * ROUNDS * BLOCK);
    for round in 0..ROUNDS {
        for writer in 0..WRITERS {
            let start = (round * WRITERS + writer) * BLOCK;
            let expected = b'0' + writer as u8;
            assert!(
                bytes[start..start + BLOCK].iter().all(|&b| b == expected),
                "round {round} writer {writer} block intact"
            );
        }
    }
}
