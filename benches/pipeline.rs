//! Throughput benchmarks for the hot paths of the pipeline: metadata
//! copy-on-write, batching, and partition routing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use streamwork::clock::Clock;
use streamwork::concurrency::CancelToken;
use streamwork::metadata::Metadata;
use streamwork::processor::output_channel;
use streamwork::result::Result as StreamItem;
use streamwork::routing::{Partition, PartitionStrategy};
use streamwork::Batcher;

fn benchmark_metadata_with(c: &mut Criterion) {
    c.bench_function("metadata_with_single_key", |b| {
        b.iter(|| {
            let base = Metadata::empty();
            black_box(base.with("window_start", "2024-01-01T00:00:00Z"))
        });
    });
}

fn benchmark_metadata_with_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("metadata_with_chained_keys");

    for key_count in [1, 5, 10, 20].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(key_count), key_count, |b, &count| {
            b.iter(|| {
                let mut m = Metadata::empty();
                for i in 0..count {
                    m = m.with(format!("key_{i}"), format!("value_{i}"));
                }
                black_box(m)
            });
        });
    }

    group.finish();
}

fn benchmark_batcher_throughput(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");

    c.bench_function("batcher_1000_items_size_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let clock = Clock::real();
                let (tx, input) = output_channel::<i32>(1024);
                let batcher = Arc::new(Batcher::new(100, Duration::from_secs(60), clock));
                let mut out = batcher.process(CancelToken::new(), input);

                tokio::spawn(async move {
                    for v in 0..1000 {
                        if tx.send(StreamItem::new_success(v)).await.is_err() {
                            break;
                        }
                    }
                });

                let mut batches = 0;
                while out.recv().await.is_some() {
                    batches += 1;
                }
                black_box(batches)
            })
        });
    });
}

fn benchmark_partition_hash_routing(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");

    c.bench_function("partition_hash_1000_items_8_ways", |b| {
        b.iter(|| {
            rt.block_on(async {
                let strategy = PartitionStrategy::Hash(Arc::new(|v: &i32| v.to_string()));
                let partition = Arc::new(Partition::new(strategy, 8));
                let (tx, input) = output_channel::<i32>(1024);

                tokio::spawn(async move {
                    for v in 0..1000 {
                        if tx.send(StreamItem::new_success(v)).await.is_err() {
                            break;
                        }
                    }
                });

                let mut outputs = partition.process(CancelToken::new(), input);
                let mut total = 0;
                for out in outputs.iter_mut() {
                    while out.recv().await.is_some() {
                        total += 1;
                    }
                }
                black_box(total)
            })
        });
    });
}

criterion_group! {
    name = pipeline_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(50);
    targets = benchmark_metadata_with,
              benchmark_metadata_with_scaling,
              benchmark_batcher_throughput,
              benchmark_partition_hash_routing
}

criterion_main!(pipeline_benches);
