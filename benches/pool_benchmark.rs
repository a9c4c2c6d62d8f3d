//! Benchmarks for worker pool round trips and partitioning.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pwa_foreman::partition;
use pwa_foreman::{Backend, DataBundle, Kernel, PoolConfig, Shard, SumInterface, WorkerPool};

/// Weighted sum over the shard, one request per run.
#[derive(Clone, Default)]
struct WeightedSum {
    data: Vec<f64>,
}

impl Kernel for WeightedSum {
    type Request = f64;
    type Response = f64;

    fn assign(&mut self, shard: Shard, _process_id: usize) {
        self.data = shard.numeric("x").map(<[f64]>::to_vec).unwrap_or_default();
    }

    fn process(&mut self, weight: Option<f64>) -> anyhow::Result<f64> {
        let weight = weight.unwrap_or(1.0);
        Ok(self.data.iter().map(|x| (x * weight).ln_1p()).sum())
    }
}

fn bundle(events: usize) -> DataBundle {
    DataBundle::new().with("x", (0..events).map(|i| i as f64).collect::<Vec<_>>())
}

fn bench_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_run");
    let data = bundle(100_000);

    for backend in [Backend::Fork, Backend::Thread] {
        for workers in [1, 2, 4] {
            let config = PoolConfig::new()
                .with_workers(workers)
                .with_backend(backend);
            let mut pool =
                WorkerPool::build(&data, WeightedSum::default(), SumInterface::new(), config)
                    .expect("Failed to build pool");

            group.bench_with_input(
                BenchmarkId::new(backend.to_string(), workers),
                &workers,
                |b, _| {
                    b.iter(|| black_box(pool.run(black_box(0.5)).expect("run failed")));
                },
            );
            pool.close();
        }
    }

    group.finish();
}

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_split");

    for events in [10_000, 1_000_000] {
        let data = bundle(events);
        group.bench_with_input(BenchmarkId::new("numeric", events), &data, |b, data| {
            b.iter(|| black_box(partition::split(data, 8).expect("split failed")));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_run, bench_split);
criterion_main!(benches);
