// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Benchmarks for the rolling queue.
//!
//! Measures:
//! - Single message append latency
//! - Batch append throughput
//! - Sequential read (tailer) throughput
//! - Random seeks through the sparse index

use std::{
    hint::black_box,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rollqueue::{FlushMode, Queue, QueueBuilder, RollCycle, SetTimeProvider};
use tempfile::TempDir;

/// Message sizes to benchmark (bytes)
const MESSAGE_SIZES: &[usize] = &[64, 256, 1024, 4096, 16384];

/// Number of messages for batch/throughput tests
const BATCH_SIZE: usize = 10_000;

/// Bytes per cycle file.
const BLOCK_SIZE: u64 = 256 * 1024 * 1024;

// 2026-01-14T00:00:00Z
const START: i64 = 1_768_348_800_000;

/// Create a queue with a frozen clock so no benchmark crosses a cycle.
fn create_queue(temp_dir: &TempDir, flush_mode: FlushMode) -> Queue {
    QueueBuilder::new(temp_dir.path())
        .roll_cycle(RollCycle::Daily)
        .block_size(BLOCK_SIZE)
        .flush_mode(flush_mode)
        .time_provider(Arc::new(SetTimeProvider::new(START)))
        .build()
        .expect("Failed to create queue")
}

fn generate_message(size: usize) -> Bytes { Bytes::from(vec![0xABu8; size]) }

/// Time `iters` appends, starting a fresh queue whenever the current cycle
/// file would fill up. Queue setup is not timed.
fn timed_appends(iters: u64, size: usize, flush_mode: FlushMode) -> Duration {
    let msg = generate_message(size);
    let per_queue = (BLOCK_SIZE / 2) / (size as u64 + 16);
    let mut elapsed = Duration::ZERO;
    let mut remaining = iters;
    while remaining > 0 {
        let temp_dir = TempDir::new().unwrap();
        let queue = create_queue(&temp_dir, flush_mode);
        let mut appender = queue.acquire_appender().unwrap();
        let n = remaining.min(per_queue);

        let start = Instant::now();
        for _ in 0..n {
            appender.append(black_box(&msg)).unwrap();
        }
        elapsed += start.elapsed();
        remaining -= n;
    }
    elapsed
}

fn bench_append_latency_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_latency_async");

    for &size in MESSAGE_SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_custom(|iters| timed_appends(iters, size, FlushMode::Async));
        });
    }

    group.finish();
}

fn bench_append_latency_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_latency_sync");
    // msync per append is slow
    group.sample_size(20);

    for &size in &[64, 256, 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_custom(|iters| timed_appends(iters, size, FlushMode::Sync));
        });
    }

    group.finish();
}

fn bench_append_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_batch");
    group.sample_size(20);

    for &size in &[64, 256, 1024, 4096] {
        let total_bytes = (size * BATCH_SIZE) as u64;
        group.throughput(Throughput::Bytes(total_bytes));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let queue = create_queue(&temp_dir, FlushMode::Async);
                    let msgs: Vec<Bytes> = (0..BATCH_SIZE).map(|_| generate_message(size)).collect();
                    (temp_dir, queue, msgs)
                },
                |(temp_dir, queue, msgs)| {
                    let mut appender = queue.acquire_appender().unwrap();
                    appender.append_batch(black_box(&msgs)).unwrap();
                    drop(appender);
                    drop(queue);
                    drop(temp_dir);
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

/// Fill a queue with `count` messages of `size` bytes.
fn filled_queue(size: usize, count: usize) -> (TempDir, Queue, Vec<u64>) {
    let temp_dir = TempDir::new().unwrap();
    let queue = create_queue(&temp_dir, FlushMode::Async);
    let mut appender = queue.acquire_appender().unwrap();
    let msg = generate_message(size);
    let indices = (0..count).map(|_| appender.append(&msg).unwrap()).collect();
    (temp_dir, queue, indices)
}

fn bench_tailer_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("tailer_read");
    group.sample_size(20);

    for &size in &[256, 1024, 4096] {
        let total_bytes = (size * BATCH_SIZE) as u64;
        group.throughput(Throughput::Bytes(total_bytes));
        let (_temp_dir, queue, _) = filled_queue(size, BATCH_SIZE);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut tailer = queue.create_tailer();
                let mut count = 0;
                while let Ok(Some(msg)) = tailer.read_next() {
                    black_box(msg);
                    count += 1;
                }
                assert_eq!(count, BATCH_SIZE);
            });
        });
    }

    group.finish();
}

fn bench_index_seek(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_seek");

    let (_temp_dir, queue, indices) = filled_queue(256, BATCH_SIZE);
    let mut tailer = queue.create_tailer();
    let mut next = 0_usize;
    group.bench_function("move_to_index", |b| {
        b.iter(|| {
            // Stride through the indices so consecutive seeks land in
            // different index slots.
            next = (next + 7_919) % indices.len();
            assert!(tailer.move_to_index(black_box(indices[next])).unwrap());
        });
    });

    group.finish();
}

/// Raw write + fsync latency (baseline, no queue overhead)
fn bench_raw_fsync(c: &mut Criterion) {
    use std::{fs::OpenOptions, io::Write};

    let mut group = c.benchmark_group("raw_fsync");
    group.sample_size(50);

    for &size in &[64, 256, 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("write_fsync", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let path = temp_dir.path().join("test.data");
                    let file = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(&path)
                        .unwrap();
                    let data = vec![0xABu8; size];
                    (temp_dir, file, data)
                },
                |(_temp_dir, mut file, data)| {
                    file.write_all(black_box(&data)).unwrap();
                    file.sync_all().unwrap();
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_append_latency_async,
    bench_append_latency_sync,
    bench_append_batch,
    bench_tailer_read,
    bench_index_seek,
    bench_raw_fsync,
);

criterion_main!(benches);
