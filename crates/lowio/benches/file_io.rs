// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "Benchmark harness")]
#![allow(unused_results, reason = "Criterion builder returns are intentionally unused")]

use std::io::{Read, Seek, SeekFrom, Write};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lowio::{
    Buffer, Caching, ConstBuffer, Creation, FileHandle, HandleFlags, IoHandle, IoRequest,
    MappedFileHandle, Mode, PathHandle,
};
use pathview::PathView;

fn make_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn bench_sequential_read(c: &mut Criterion) {
    let sizes: &[(usize, &str)] = &[(4 * 1024, "4KB"), (64 * 1024, "64KB"), (1024 * 1024, "1MB")];

    let mut group = c.benchmark_group("sequential_read");

    for &(size, label) in sizes {
        let data = make_data(size);
        group.throughput(Throughput::Bytes(size as u64));

        // std::fs streams
        group.bench_with_input(BenchmarkId::new("iostreams", label), &size, |b, _| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("in.bin");
            std::fs::write(&path, &data).expect("seed");
            let mut file = std::fs::File::open(&path).expect("open");
            let mut scratch = vec![0u8; size];
            b.iter(|| {
                file.seek(SeekFrom::Start(0)).expect("rewind");
                file.read_exact(&mut scratch).expect("read");
            });
        });

        // file handle, positional scatter read
        group.bench_with_input(BenchmarkId::new("file_handle", label), &size, |b, _| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let base = PathHandle::path(None, PathView::new(tmp.path())).expect("anchor");
            let file = seeded_file(&base, &data);
            let mut scratch = vec![0u8; size];
            b.iter(|| {
                let mut buffers = [Buffer::new(&mut scratch)];
                let filled = file.read(IoRequest::new(&mut buffers, 0), None).expect("read");
                assert_eq!(filled[0].len(), size);
            });
        });

        // mapped file handle, memcpy read
        group.bench_with_input(BenchmarkId::new("mapped_file_handle", label), &size, |b, _| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let base = PathHandle::path(None, PathView::new(tmp.path())).expect("anchor");
            let file = seeded_file(&base, &data);
            drop(file);
            let mapped = MappedFileHandle::mapped_file(
                Some(&base),
                PathView::new("seed.bin"),
                Mode::Read,
                Creation::OpenExisting,
                Caching::All,
                HandleFlags::empty(),
            )
            .expect("map");
            let mut scratch = vec![0u8; size];
            b.iter(|| {
                let mut buffers = [Buffer::new(&mut scratch)];
                let filled = mapped.read(IoRequest::new(&mut buffers, 0), None).expect("read");
                assert_eq!(filled[0].len(), size);
            });
        });

        // plain memcpy baseline
        group.bench_with_input(BenchmarkId::new("memcpy", label), &size, |b, _| {
            let mut scratch = vec![0u8; size];
            b.iter(|| {
                scratch.copy_from_slice(&data);
            });
        });
    }

    group.finish();
}

fn bench_sequential_write(c: &mut Criterion) {
    let sizes: &[(usize, &str)] = &[(4 * 1024, "4KB"), (64 * 1024, "64KB"), (1024 * 1024, "1MB")];

    let mut group = c.benchmark_group("sequential_write");

    for &(size, label) in sizes {
        let data = make_data(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("iostreams", label), &size, |b, _| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join("out.bin");
            let mut file = std::fs::File::create(&path).expect("create");
            b.iter(|| {
                file.seek(SeekFrom::Start(0)).expect("rewind");
                file.write_all(&data).expect("write");
            });
        });

        group.bench_with_input(BenchmarkId::new("file_handle", label), &size, |b, _| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let base = PathHandle::path(None, PathView::new(tmp.path())).expect("anchor");
            let file = FileHandle::file(
                Some(&base),
                PathView::new("out.bin"),
                Mode::Write,
                Creation::IfNeeded,
                Caching::All,
                HandleFlags::empty(),
            )
            .expect("create");
            b.iter(|| {
                let mut buffers = [ConstBuffer::new(&data)];
                file.write(IoRequest::new(&mut buffers, 0), None).expect("write");
            });
        });

        group.bench_with_input(BenchmarkId::new("mapped_file_handle", label), &size, |b, _| {
            let tmp = tempfile::tempdir().expect("tempdir");
            let base = PathHandle::path(None, PathView::new(tmp.path())).expect("anchor");
            let mut mapped = MappedFileHandle::mapped_file(
                Some(&base),
                PathView::new("out.bin"),
                Mode::Write,
                Creation::IfNeeded,
                Caching::All,
                HandleFlags::empty(),
            )
            .expect("create");
            mapped.truncate(size as u64).expect("size");
            b.iter(|| {
                let mut buffers = [ConstBuffer::new(&data)];
                mapped.write(IoRequest::new(&mut buffers, 0), None).expect("write");
            });
        });
    }

    group.finish();
}

fn seeded_file(base: &PathHandle, data: &[u8]) -> FileHandle {
    let file = FileHandle::file(
        Some(base),
        PathView::new("seed.bin"),
        Mode::Write,
        Creation::IfNeeded,
        Caching::All,
        HandleFlags::empty(),
    )
    .expect("create");
    let mut buffers = [ConstBuffer::new(data)];
    file.write(IoRequest::new(&mut buffers, 0), None).expect("seed");
    file
}

criterion_group!(benches, bench_sequential_read, bench_sequential_write);
criterion_main!(benches);
