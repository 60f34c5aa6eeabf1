//! Benchmarks for slot hashing, routing and command encoding.
//!
//! Run benchmarks:
//! ```bash
//! cargo bench --bench routing
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shardis::alloc::AllocGuard;
use shardis::cluster::route;
use shardis::key_slot;
use shardis::proto::codec::encode_command;

/// Benchmark: CRC16 slot hashing for keys of different lengths.
fn bench_key_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_slot");

    for size in [8, 64, 512, 4096].iter() {
        let key = "k".repeat(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &key, |b, key| {
            b.iter(|| key_slot(black_box(key.as_str())))
        });
    }

    group.bench_function("hash_tag", |b| {
        b.iter(|| key_slot(black_box("user:{1000}:profile")))
    });
    group.finish();
}

/// Benchmark: resolving the route of multi-key commands.
fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("route");

    for count in [1, 10, 100].iter() {
        let mut args = vec!["MGET".to_string()];
        args.extend((0..*count).map(|i| format!("{{user}}:{i}")));
        group.bench_with_input(BenchmarkId::from_parameter(count), &args, |b, args| {
            b.iter(|| route(black_box(args.as_slice())).unwrap())
        });
    }
    group.finish();
}

/// Benchmark: encoding commands into the wire format.
fn bench_encode(c: &mut Criterion) {
    let alloc = AllocGuard::system();
    let mut group = c.benchmark_group("encode_command");

    for size in [64, 1024, 16384].iter() {
        let value = "x".repeat(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &value, |b, value| {
            b.iter(|| encode_command(&alloc, black_box(&["SET", "key1", value.as_str()][..])).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_key_slot, bench_route, bench_encode);
criterion_main!(benches);
