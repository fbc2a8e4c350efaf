//! Benchmarks for part planning and in-memory uploads

use bytes::Bytes;
use chunkup_rs::{plan_parts, MemoryStore, MultipartUploadCoordinator, UploadConfig, UploadRequest};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

fn benchmark_plan_parts(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_parts");

    // 10 parts up to the 10,000 part limit
    for parts in [10u64, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(parts), parts, |b, &parts| {
            let part_size = 5 * 1024 * 1024;
            b.iter(|| black_box(plan_parts(black_box(parts * part_size - 1), part_size)));
        });
    }

    group.finish();
}

fn benchmark_memory_upload(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_upload");
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let total: u64 = 64 * 1024 * 1024;
    let payload = Bytes::from(vec![0xABu8; total as usize]);
    group.throughput(Throughput::Bytes(total));

    for concurrency in [1usize, 4, 16].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            concurrency,
            |b, &concurrency| {
                b.to_async(&runtime).iter(|| {
                    let payload = payload.clone();
                    async move {
                        let coordinator = MultipartUploadCoordinator::new(
                            Arc::new(MemoryStore::new()),
                            UploadConfig {
                                part_size: 8 * 1024 * 1024,
                                max_concurrency: concurrency,
                                ..UploadConfig::default()
                            },
                        );
                        let summary = coordinator
                            .upload(UploadRequest::new("bench", "object", total), Arc::new(payload))
                            .await
                            .unwrap();
                        black_box(summary)
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_plan_parts, benchmark_memory_upload);
criterion_main!(benches);
