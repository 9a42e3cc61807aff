use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lightning_merge::{merge_with_config, Column, MergeConfig, MergeMethod, MergeRequest, Table};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::time::Duration;

fn keyed_table(rng: &mut StdRng, rows: usize, distinct: i64, payload: &str) -> Table {
    let keys = (0..rows).map(|_| Some(rng.random_range(0..distinct))).collect();
    let values = (0..rows).map(|i| Some(i as f64)).collect();
    Table::with_chunk_rows(
        vec![Column::int64("key", keys), Column::float64(payload, values)],
        16 * 1024,
    )
    .unwrap()
}

fn bench_config() -> MergeConfig {
    MergeConfig {
        worker_count: 4,
        stall_timeout: Duration::from_secs(60),
        ..MergeConfig::default()
    }
}

fn bench_merge_methods(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_methods");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(20);

    for size in [10_000usize, 100_000].iter() {
        let mut rng = StdRng::seed_from_u64(42);
        let left = keyed_table(&mut rng, *size, (*size / 4) as i64, "x");
        let right = keyed_table(&mut rng, *size / 4, (*size / 4) as i64, "y");
        group.throughput(Throughput::Elements((*size + *size / 4) as u64));

        for method in [MergeMethod::Radix, MergeMethod::Hash, MergeMethod::Auto] {
            group.bench_with_input(
                BenchmarkId::new(method.as_str(), size),
                size,
                |b, _| {
                    let request = MergeRequest::on(["key"]).method(method);
                    b.iter(|| {
                        merge_with_config(black_box(&left), black_box(&right), &request, bench_config())
                            .unwrap()
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_join_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("join_modes");
    group.sample_size(20);

    let mut rng = StdRng::seed_from_u64(7);
    let left = keyed_table(&mut rng, 50_000, 20_000, "x");
    let right = keyed_table(&mut rng, 20_000, 40_000, "y");

    for (name, request) in [
        ("inner", MergeRequest::on(["key"])),
        ("left_outer", MergeRequest::on(["key"]).all_x(true)),
        ("right_outer", MergeRequest::on(["key"]).all_y(true)),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| merge_with_config(black_box(&left), black_box(&right), &request, bench_config()).unwrap());
        });
    }

    group.finish();
}

fn bench_skewed_refinement(c: &mut Criterion) {
    let mut group = c.benchmark_group("skewed_refinement");
    group.sample_size(10);

    let mut rng = StdRng::seed_from_u64(11);
    let keys = (0..50_000)
        .map(|_| {
            if rng.random_bool(0.2) {
                Some(0)
            } else {
                Some(rng.random_range(0..10_000i64))
            }
        })
        .collect();
    let left = Table::with_chunk_rows(
        vec![
            Column::int64("key", keys),
            Column::float64("x", (0..50_000).map(|i| Some(i as f64)).collect()),
        ],
        8 * 1024,
    )
    .unwrap();
    let right = keyed_table(&mut rng, 10_000, 10_000, "y");

    for threshold in [1usize << 14, 1 << 16].iter() {
        group.bench_with_input(BenchmarkId::new("threshold", threshold), threshold, |b, &threshold| {
            let config = MergeConfig {
                bucket_row_threshold: threshold,
                ..bench_config()
            };
            let request = MergeRequest::on(["key"]).all_x(true);
            b.iter(|| merge_with_config(black_box(&left), black_box(&right), &request, config.clone()).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_merge_methods,
    bench_join_modes,
    bench_skewed_refinement
);
criterion_main!(benches);
