// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Clone-or-copy of a randomly populated file.

use rand::RngCore;

use lowio::{
    Buffer, Caching, ConstBuffer, Creation, FileHandle, FsHandle, HandleFlags, IoHandle,
    IoRequest, Mode, PathHandle,
};
use pathview::PathView;

const MAX_LENGTH: u64 = 16 * 1024 * 1024;

fn open(base: &PathHandle, name: &str) -> FileHandle {
    FileHandle::file(
        Some(base),
        PathView::new(name),
        Mode::Write,
        Creation::IfNeeded,
        Caching::All,
        HandleFlags::empty(),
    )
    .expect("open file")
}

#[test]
fn clone_or_copy_preserves_length_and_content() {
    let mut rng = rand::rng();
    let dir = tempfile::tempdir().expect("tempdir");
    let base = PathHandle::path(None, PathView::new(dir.path())).expect("anchor");

    let source = open(&base, "source");
    let length = rng.next_u64() % MAX_LENGTH;
    source.truncate(length).expect("size source");

    // Scribble randomized runs over random ranges, leaving holes between.
    let mut run = vec![0u8; 256 * 1024];
    for _ in 0..24 {
        if length == 0 {
            break;
        }
        rng.fill_bytes(&mut run);
        let offset = rng.next_u64() % length;
        let len = (rng.next_u64() % run.len() as u64).min(length - offset) as usize;
        if len == 0 {
            continue;
        }
        let mut buffers = [ConstBuffer::new(&run[..len])];
        source.write(IoRequest::new(&mut buffers, offset), None).expect("scribble");
    }

    let destination = open(&base, "destination");
    let cloned = source.clone_extents_to(&destination).expect("clone");
    assert_eq!(cloned, length);
    assert_eq!(
        destination.length().expect("dst length"),
        source.length().expect("src length")
    );
    assert_ne!(
        source.unique_id().expect("src id"),
        destination.unique_id().expect("dst id"),
        "the clone is a distinct inode"
    );

    // Byte-for-byte equality, compared in chunks.
    let mut src_chunk = vec![0u8; 1024 * 1024];
    let mut dst_chunk = vec![0u8; 1024 * 1024];
    let mut offset = 0u64;
    while offset < length {
        let src_read = {
            let mut buffers = [Buffer::new(&mut src_chunk)];
            let filled = source.read(IoRequest::new(&mut buffers, offset), None).expect("read src");
            filled.iter().map(|b| b.len()).sum::<usize>()
        };
        let dst_read = {
            let mut buffers = [Buffer::new(&mut dst_chunk)];
            let filled = destination
                .read(IoRequest::new(&mut buffers, offset), None)
                .expect("read dst");
            filled.iter().map(|b| b.len()).sum::<usize>()
        };
        assert_eq!(src_read, dst_read, "equal progress at {offset}");
        if src_read == 0 {
            break;
        }
        assert_eq!(
            src_chunk[..src_read],
            dst_chunk[..dst_read],
            "content equal at {offset}"
        );
        offset += src_read as u64;
    }

    // On reflink-capable filesystems the clone shares extents with its
    // source; allocation equality is asserted there and skipped elsewhere,
    // since this test cannot choose its filesystem.
    #[cfg(target_os = "linux")]
    {
        let src_extents = source.extents().expect("src extents");
        let dst_extents = destination.extents().expect("dst extents");
        let allocated = |extents: &[std::ops::Range<u64>]| -> u64 {
            extents.iter().map(|e| e.end - e.start).sum()
        };
        // A range copy may allocate more than the source (no holes); never
        // meaningfully less.
        assert!(
            allocated(&dst_extents) + 4096 >= allocated(&src_extents),
            "destination covers the source's data"
        );
    }
}

#[test]
fn cloning_an_empty_file_is_fine() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = PathHandle::path(None, PathView::new(dir.path())).expect("anchor");
    let source = open(&base, "empty-src");
    let destination = open(&base, "empty-dst");
    let cloned = source.clone_extents_to(&destination).expect("clone");
    assert_eq!(cloned, 0);
    assert_eq!(destination.length().expect("length"), 0);
}
