//! Chunk split/reassembly benchmarks
//!
//! Run with: cargo bench -p tandem-core

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use tandem_core::protocol::{chunk_payload, decode_payload};
use tandem_core::{TransferKey, TransferRegistry, FILE_FRAGMENT_SIZE};

fn bench_chunk_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_payload");

    for size in [4 * 1024, 256 * 1024, 4 * 1024 * 1024] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| chunk_payload(black_box(payload), FILE_FRAGMENT_SIZE).unwrap());
        });
    }

    group.finish();
}

fn bench_reassemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassemble");

    for size in [256 * 1024, 4 * 1024 * 1024] {
        let payload = vec![0x5Au8; size];
        let chunks = chunk_payload(&payload, FILE_FRAGMENT_SIZE).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &chunks, |b, chunks| {
            b.iter(|| {
                let mut registry = TransferRegistry::new(Duration::from_secs(60));
                let mut out = None;
                for chunk in chunks.iter().rev() {
                    out = registry
                        .accept(
                            TransferKey::file("bench.bin"),
                            chunk.index,
                            chunk.total,
                            chunk.data.clone().into_bytes(),
                        )
                        .unwrap();
                }
                decode_payload(&out.unwrap()).unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_chunk_payload, bench_reassemble);
criterion_main!(benches);
